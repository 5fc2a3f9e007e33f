//! Append-only item store and conversation metadata store.
//!
//! Both stores are plain traits (`ConversationStore`, `ItemStore`) so the
//! core never depends on a concrete database; the SQLite-backed
//! implementation shipped here (`rusqlite`, bridged off the async runtime
//! with `tokio::task::spawn_blocking` the way the crate's other
//! synchronous-library seams do) is expected and sufficient per §6.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::cloudllm::error::{OrchestratorError, OrchestratorResult};
use crate::cloudllm::model::{Conversation, ConversationItem, ConversationStatus};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: Conversation) -> OrchestratorResult<()>;
    async fn get(&self, id: &str) -> OrchestratorResult<Option<Conversation>>;
    async fn set_status(&self, id: &str, status: ConversationStatus) -> OrchestratorResult<()>;
    /// Sets `title` only if currently empty. Returns whether this call was
    /// the one that set it — callers use this to enforce the
    /// "title set at most once" invariant without a read-then-write race
    /// visible outside this store.
    async fn set_title_if_empty(&self, id: &str, title: &str) -> OrchestratorResult<bool>;
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn append(&self, item: ConversationItem) -> OrchestratorResult<()>;
    async fn list_by_conversation(&self, conversation_id: &str) -> OrchestratorResult<Vec<ConversationItem>>;
    /// Overwrites the payload of an existing item, keyed by `item_id`. Used
    /// for the `scheduled_task_controller` cancel-in-place update; a no-op
    /// insert-as-new if the item doesn't already exist.
    async fn upsert_by_item_id(&self, item: ConversationItem) -> OrchestratorResult<()>;
    /// Finds `component_generator` items of the given `component_type`
    /// whose payload references `task_id`. Backs the idempotent
    /// `/tasks/{taskId}/cancel` surface, which must work even after a
    /// process restart wiped the in-memory `TaskService` entry.
    async fn find_components_for_task(&self, task_id: &str, component_type: &str) -> OrchestratorResult<Vec<ConversationItem>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    agent_name  TEXT NOT NULL,
    title       TEXT,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS items (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id         TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    thread_id       TEXT NOT NULL,
    task_id         TEXT,
    role            TEXT NOT NULL,
    event           TEXT NOT NULL,
    agent_name      TEXT,
    payload         TEXT NOT NULL,
    metadata        TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_items_conversation ON items(conversation_id, seq);
CREATE INDEX IF NOT EXISTS idx_items_task ON items(task_id);
";

fn blocking_err(e: tokio::task::JoinError) -> OrchestratorError {
    OrchestratorError::Executor(format!("blocking persistence task panicked: {e}"))
}

/// `rusqlite::Connection` is `Send` but not `Sync`; every operation is
/// dispatched to a blocking thread holding the lock for the duration of a
/// single statement, matching the row-level-atomic contract in §6.
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn in_memory() -> OrchestratorResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    fn handle(&self) -> Arc<StdMutex<Connection>> {
        self.conn.clone()
    }
}

fn status_to_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Active => "active",
        ConversationStatus::RequireUserInput => "require_user_input",
        ConversationStatus::Terminated => "terminated",
    }
}

fn status_from_str(s: &str) -> ConversationStatus {
    match s {
        "require_user_input" => ConversationStatus::RequireUserInput,
        "terminated" => ConversationStatus::Terminated,
        _ => ConversationStatus::Active,
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, conversation: Conversation) -> OrchestratorResult<()> {
        let conn = self.handle();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<()> {
            let conn = conn.lock().expect("conversation store mutex poisoned");
            conn.execute(
                "INSERT INTO conversations (id, user_id, agent_name, title, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation.id,
                    conversation.user_id,
                    conversation.agent_name,
                    conversation.title,
                    status_to_str(conversation.status),
                    conversation.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(blocking_err)?
    }

    async fn get(&self, id: &str) -> OrchestratorResult<Option<Conversation>> {
        let conn = self.handle();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<Option<Conversation>> {
            let conn = conn.lock().expect("conversation store mutex poisoned");
            let row = conn
                .query_row(
                    "SELECT id, user_id, agent_name, title, status, created_at FROM conversations WHERE id = ?1",
                    params![id],
                    |row| {
                        let created_at: String = row.get(5)?;
                        Ok(Conversation {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            agent_name: row.get(2)?,
                            title: row.get(3)?,
                            status: status_from_str(&row.get::<_, String>(4)?),
                            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                                .map(|dt| dt.with_timezone(&chrono::Utc))
                                .unwrap_or_else(|_| chrono::Utc::now()),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
        .map_err(blocking_err)?
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> OrchestratorResult<()> {
        let conn = self.handle();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<()> {
            let conn = conn.lock().expect("conversation store mutex poisoned");
            conn.execute(
                "UPDATE conversations SET status = ?1 WHERE id = ?2",
                params![status_to_str(status), id],
            )?;
            Ok(())
        })
        .await
        .map_err(blocking_err)?
    }

    async fn set_title_if_empty(&self, id: &str, title: &str) -> OrchestratorResult<bool> {
        let conn = self.handle();
        let id = id.to_string();
        let title = title.to_string();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<bool> {
            let conn = conn.lock().expect("conversation store mutex poisoned");
            let updated = conn.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2 AND (title IS NULL OR title = '')",
                params![title, id],
            )?;
            Ok(updated > 0)
        })
        .await
        .map_err(blocking_err)?
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<ConversationItem> {
    let payload: String = row.get(7)?;
    let metadata: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(ConversationItem {
        item_id: row.get(0)?,
        conversation_id: row.get(1)?,
        thread_id: row.get(2)?,
        task_id: row.get(3)?,
        role: row.get(4)?,
        event: row.get(5)?,
        agent_name: row.get(6)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn append(&self, item: ConversationItem) -> OrchestratorResult<()> {
        let conn = self.handle();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<()> {
            let conn = conn.lock().expect("item store mutex poisoned");
            conn.execute(
                "INSERT INTO items (item_id, conversation_id, thread_id, task_id, role, event, agent_name, payload, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item.item_id,
                    item.conversation_id,
                    item.thread_id,
                    item.task_id,
                    item.role,
                    item.event,
                    item.agent_name,
                    serde_json::to_string(&item.payload)?,
                    item.metadata.as_ref().map(serde_json::to_string).transpose()?,
                    item.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(blocking_err)?
    }

    async fn list_by_conversation(&self, conversation_id: &str) -> OrchestratorResult<Vec<ConversationItem>> {
        let conn = self.handle();
        let conversation_id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<Vec<ConversationItem>> {
            let conn = conn.lock().expect("item store mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT item_id, conversation_id, thread_id, task_id, role, event, agent_name, payload, metadata, created_at
                 FROM items WHERE conversation_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], row_to_item)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
        .await
        .map_err(blocking_err)?
    }

    async fn upsert_by_item_id(&self, item: ConversationItem) -> OrchestratorResult<()> {
        let conn = self.handle();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<()> {
            let conn = conn.lock().expect("item store mutex poisoned");
            let payload = serde_json::to_string(&item.payload)?;
            let metadata = item.metadata.as_ref().map(serde_json::to_string).transpose()?;
            let updated = conn.execute(
                "UPDATE items SET payload = ?1, metadata = ?2 WHERE item_id = ?3",
                params![payload, metadata, item.item_id],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO items (item_id, conversation_id, thread_id, task_id, role, event, agent_name, payload, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        item.item_id,
                        item.conversation_id,
                        item.thread_id,
                        item.task_id,
                        item.role,
                        item.event,
                        item.agent_name,
                        payload,
                        metadata,
                        item.created_at.to_rfc3339(),
                    ],
                )?;
            }
            Ok(())
        })
        .await
        .map_err(blocking_err)?
    }

    async fn find_components_for_task(&self, task_id: &str, component_type: &str) -> OrchestratorResult<Vec<ConversationItem>> {
        let conn = self.handle();
        let task_id = task_id.to_string();
        let component_type = component_type.to_string();
        tokio::task::spawn_blocking(move || -> OrchestratorResult<Vec<ConversationItem>> {
            let conn = conn.lock().expect("item store mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT item_id, conversation_id, thread_id, task_id, role, event, agent_name, payload, metadata, created_at
                 FROM items WHERE task_id = ?1 AND event = 'component_generator' ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![task_id], row_to_item)?;
            let mut items = Vec::new();
            for row in rows {
                let item = row?;
                if item.payload.get("component_type").and_then(Value::as_str) == Some(component_type.as_str()) {
                    items.push(item);
                }
            }
            Ok(items)
        })
        .await
        .map_err(blocking_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::model::new_id;
    use chrono::Utc;
    use serde_json::json;

    fn sample_conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            user_id: "user1".into(),
            agent_name: "SuperAgent".into(),
            title: None,
            status: ConversationStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn sample_item(conversation_id: &str, task_id: Option<&str>, event: &str, payload: Value) -> ConversationItem {
        ConversationItem {
            item_id: new_id("item"),
            conversation_id: conversation_id.to_string(),
            thread_id: "thread1".into(),
            task_id: task_id.map(str::to_string),
            role: "assistant".into(),
            event: event.into(),
            agent_name: None,
            payload,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trips_conversation_and_preserves_item_order() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = sample_conversation("c1");
        store.create(conv.clone()).await.unwrap();
        let fetched = store.get("c1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
        assert_eq!(fetched.status, ConversationStatus::Active);

        for i in 0..3 {
            store
                .append(sample_item("c1", None, "message_chunk", json!({ "text": format!("chunk{i}") })))
                .await
                .unwrap();
        }
        let items = store.list_by_conversation("c1").await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].payload["text"], "chunk0");
        assert_eq!(items[2].payload["text"], "chunk2");
    }

    #[tokio::test]
    async fn title_set_at_most_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.create(sample_conversation("c1")).await.unwrap();
        assert!(store.set_title_if_empty("c1", "First title").await.unwrap());
        assert!(!store.set_title_if_empty("c1", "Second title").await.unwrap());
        let fetched = store.get("c1").await.unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("First title"));
    }

    #[tokio::test]
    async fn upsert_by_item_id_overwrites_payload_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        store.create(sample_conversation("c1")).await.unwrap();
        let mut item = sample_item("c1", Some("task1"), "component_generator", json!({ "component_type": "scheduled_task_controller", "task_status": "running" }));
        store.append(item.clone()).await.unwrap();

        item.payload = json!({ "component_type": "scheduled_task_controller", "task_status": "cancelled" });
        store.upsert_by_item_id(item.clone()).await.unwrap();

        let items = store.list_by_conversation("c1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload["task_status"], "cancelled");
    }

    #[tokio::test]
    async fn finds_scheduled_task_controller_components_by_task() {
        let store = SqliteStore::in_memory().unwrap();
        store.create(sample_conversation("c1")).await.unwrap();
        store
            .append(sample_item(
                "c1",
                Some("task1"),
                "component_generator",
                json!({ "component_type": "scheduled_task_controller", "task_status": "running" }),
            ))
            .await
            .unwrap();
        store
            .append(sample_item("c1", Some("task1"), "component_generator", json!({ "component_type": "schedule_task_result" })))
            .await
            .unwrap();

        let found = store.find_components_for_task("task1", "scheduled_task_controller").await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
