//! In-memory task registry: state transitions and cancellation tokens.
//!
//! Task identity and status live here, not on the `Executor`, so that the
//! `/tasks/{taskId}/cancel` surface and the Executor's recurring loop can
//! both observe and mutate a task's lifecycle through one funnel, per §5's
//! "writes are funnelled through TaskService; status transitions are atomic"
//! shared-resource policy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::model::{Task, TaskStatus};

struct TaskEntry {
    task: Task,
    cancel_token: CancellationToken,
}

#[derive(Default)]
pub struct TaskService {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new task (status `PENDING`) and returns the
    /// `CancellationToken` its worker must poll.
    pub async fn register(&self, task: Task) -> CancellationToken {
        let token = CancellationToken::new();
        let task_id = task.task_id.clone();
        self.tasks.write().await.insert(
            task_id,
            TaskEntry {
                task,
                cancel_token: token.clone(),
            },
        );
        token
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).map(|e| e.task.clone())
    }

    pub async fn cancellation_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks.read().await.get(task_id).map(|e| e.cancel_token.clone())
    }

    pub async fn transition(&self, task_id: &str, status: TaskStatus) {
        if let Some(entry) = self.tasks.write().await.get_mut(task_id) {
            entry.task.status = status;
        }
    }

    pub async fn append_remote_task_id(&self, task_id: &str, remote_task_id: String) {
        if let Some(entry) = self.tasks.write().await.get_mut(task_id) {
            entry.task.remote_task_ids.push(remote_task_id);
        }
    }

    /// Cancels a task if present: transitions it to `CANCELLED` and signals
    /// its token. Returns `true` iff the task was found in memory — the
    /// REST surface (§6) still proceeds to sweep persisted components when
    /// this is `false` (process restart lost the in-memory entry).
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(entry) => {
                entry.task.status = TaskStatus::Cancelled;
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_cancelled(&self, task_id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.task.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }
}

pub type SharedTaskService = Arc<TaskService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::model::{TaskPattern, TaskStatus};
    use chrono::Utc;

    fn sample_task(id: &str) -> Task {
        Task {
            task_id: id.to_string(),
            conversation_id: "c1".into(),
            thread_id: "t1".into(),
            user_id: "u1".into(),
            agent_name: "NewsAgent".into(),
            status: TaskStatus::Pending,
            title: "Latest Tesla news".into(),
            query: "Latest Tesla news".into(),
            pattern: TaskPattern::Once,
            schedule_config: None,
            depends_on: vec![],
            remote_task_ids: vec![],
            handoff_from_super_agent: true,
            super_agent_conversation_id: Some("parent1".into()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_then_transition_updates_status() {
        let svc = TaskService::new();
        svc.register(sample_task("task1")).await;
        svc.transition("task1", TaskStatus::Running).await;
        let task = svc.get("task1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn cancel_sets_cancelled_and_signals_token() {
        let svc = TaskService::new();
        let token = svc.register(sample_task("task1")).await;
        assert!(svc.cancel("task1").await);
        assert!(token.is_cancelled());
        assert!(svc.is_cancelled("task1").await);
    }

    #[tokio::test]
    async fn cancel_missing_task_returns_false() {
        let svc = TaskService::new();
        assert!(!svc.cancel("ghost").await);
    }

    #[tokio::test]
    async fn remote_task_ids_accumulate_monotonically() {
        let svc = TaskService::new();
        svc.register(sample_task("task1")).await;
        svc.append_remote_task_id("task1", "remote1".into()).await;
        svc.append_remote_task_id("task1", "remote2".into()).await;
        let task = svc.get("task1").await.unwrap();
        assert_eq!(task.remote_task_ids, vec!["remote1".to_string(), "remote2".to_string()]);
    }
}
