//! Conversation lifecycle: load-or-create, status transitions, title
//! assignment, and item persistence — delegated to the store traits in
//! [`persistence`](crate::cloudllm::persistence) rather than owning storage
//! itself.

use std::sync::Arc;

use crate::cloudllm::error::OrchestratorResult;
use crate::cloudllm::model::{new_id, Conversation, ConversationItem, ConversationStatus};
use crate::cloudllm::persistence::{ConversationStore, ItemStore};

/// Owns conversation metadata and delegates item persistence to the
/// [`ItemStore`]. Per the Design Notes, this replaces the source's
/// module-level `ConversationService` singleton with an explicit,
/// constructor-injected instance.
pub struct ConversationService {
    conversations: Arc<dyn ConversationStore>,
    items: Arc<dyn ItemStore>,
}

impl ConversationService {
    pub fn new(conversations: Arc<dyn ConversationStore>, items: Arc<dyn ItemStore>) -> Self {
        Self { conversations, items }
    }

    /// Loads an existing conversation by id, or creates a fresh `ACTIVE` one
    /// if `id` is `None`.
    pub async fn load_or_create(&self, id: Option<&str>, user_id: &str, agent_name: &str) -> OrchestratorResult<Conversation> {
        if let Some(id) = id {
            if let Some(existing) = self.conversations.get(id).await? {
                return Ok(existing);
            }
        }
        let conversation = Conversation {
            id: id.map(str::to_string).unwrap_or_else(|| new_id("conv")),
            user_id: user_id.to_string(),
            agent_name: agent_name.to_string(),
            title: None,
            status: ConversationStatus::Active,
            created_at: chrono::Utc::now(),
        };
        self.conversations.create(conversation.clone()).await?;
        Ok(conversation)
    }

    pub async fn get(&self, id: &str) -> OrchestratorResult<Option<Conversation>> {
        self.conversations.get(id).await
    }

    pub async fn set_status(&self, id: &str, status: ConversationStatus) -> OrchestratorResult<()> {
        self.conversations.set_status(id, status).await
    }

    /// Sets the conversation title from the plan's first task, but only
    /// once — the invariant in §3/§8.6 ("title is written at most once").
    pub async fn maybe_set_title(&self, id: &str, first_task_title: &str) -> OrchestratorResult<()> {
        self.conversations.set_title_if_empty(id, first_task_title).await.map(|_| ())
    }

    /// Persists an event and forwards it — the "every emitted event MUST be
    /// persisted atomically before being forwarded" contract in §4.1 lives
    /// here: callers always persist through this method before pushing onto
    /// the client queue.
    pub async fn persist_event(&self, item: ConversationItem) -> OrchestratorResult<()> {
        self.items.append(item).await
    }

    pub async fn upsert_event(&self, item: ConversationItem) -> OrchestratorResult<()> {
        self.items.upsert_by_item_id(item).await
    }

    pub async fn history(&self, conversation_id: &str) -> OrchestratorResult<Vec<ConversationItem>> {
        self.items.list_by_conversation(conversation_id).await
    }

    pub fn item_store(&self) -> Arc<dyn ItemStore> {
        self.items.clone()
    }

    /// Upserts every `scheduled_task_controller` component persisted for
    /// `task_id` to `task_status: "cancelled"`, in place (same item id).
    /// Shared by the Executor's cooperative-cancellation exit path and the
    /// `/tasks/{taskId}/cancel` REST surface, so both agree on what
    /// "cancelled in the UI" means — per §5/§6.
    pub async fn mark_scheduled_controller_cancelled(&self, task_id: &str) -> OrchestratorResult<Vec<String>> {
        let components = self.items.find_components_for_task(task_id, "scheduled_task_controller").await?;
        let mut updated = Vec::with_capacity(components.len());
        for mut item in components {
            if let Some(component) = item.payload.get_mut("component") {
                if let Some(obj) = component.as_object_mut() {
                    obj.insert("task_status".to_string(), serde_json::Value::String("cancelled".to_string()));
                }
            }
            updated.push(item.item_id.clone());
            self.items.upsert_by_item_id(item).await?;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::model::new_id;
    use crate::cloudllm::persistence::SqliteStore;

    fn service() -> ConversationService {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        ConversationService::new(store.clone(), store)
    }

    #[tokio::test]
    async fn creates_conversation_when_id_absent() {
        let svc = service();
        let conv = svc.load_or_create(None, "user1", "SuperAgent").await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Active);
        assert!(conv.title.is_none());
    }

    #[tokio::test]
    async fn loads_existing_conversation_by_id() {
        let svc = service();
        let created = svc.load_or_create(None, "user1", "SuperAgent").await.unwrap();
        let loaded = svc.load_or_create(Some(&created.id), "user1", "SuperAgent").await.unwrap();
        assert_eq!(loaded.id, created.id);
    }

    #[tokio::test]
    async fn title_assignment_is_idempotent() {
        let svc = service();
        let conv = svc.load_or_create(None, "user1", "SuperAgent").await.unwrap();
        svc.maybe_set_title(&conv.id, "Tesla latest news").await.unwrap();
        svc.maybe_set_title(&conv.id, "Something else").await.unwrap();
        let reloaded = svc.get(&conv.id).await.unwrap().unwrap();
        assert_eq!(reloaded.title.as_deref(), Some("Tesla latest news"));
    }

    #[tokio::test]
    async fn marks_scheduled_controller_cancelled_in_place() {
        let svc = service();
        let conv = svc.load_or_create(None, "user1", "SuperAgent").await.unwrap();
        let item = ConversationItem {
            item_id: new_id("item"),
            conversation_id: conv.id.clone(),
            thread_id: "thread1".into(),
            task_id: Some("task1".into()),
            role: "assistant".into(),
            event: "component_generator".into(),
            agent_name: Some("NewsAgent".into()),
            payload: serde_json::json!({"component_type": "scheduled_task_controller", "component": {"task_status": "running"}}),
            metadata: None,
            created_at: chrono::Utc::now(),
        };
        svc.persist_event(item.clone()).await.unwrap();

        let updated = svc.mark_scheduled_controller_cancelled("task1").await.unwrap();
        assert_eq!(updated, vec![item.item_id.clone()]);

        let history = svc.history(&conv.id).await.unwrap();
        assert_eq!(history[0].payload["component"]["task_status"], "cancelled");
    }
}
