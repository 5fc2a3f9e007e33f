//! TaskExecutor: runs an [`ExecutionPlan`] to completion, emitting the
//! merged client stream. The heart of the orchestration engine — DAG batch
//! scheduling, per-task remote streaming, event routing/persistence, and the
//! recurring-task temporal scheduler all live here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use chrono_tz::Tz;
use futures_util::StreamExt;
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::cloudllm::config::OrchestratorConfig;
use crate::cloudllm::conversation_service::ConversationService;
use crate::cloudllm::event::{to_conversation_item, EventFactory, EventRouter, ScheduledTaskResultAccumulator, SideEffect, StreamEvent};
use crate::cloudllm::model::{topological_batches, ExecutionPlan, ScheduleConfig, Task, TaskStatus};
use crate::cloudllm::registry::RemoteAgentRegistry;
use crate::cloudllm::task_service::SharedTaskService;

/// Seconds until the next fire for `schedule`, resolved in `timezone`
/// (an IANA name) when given, else the system local timezone. Grounded in
/// §4.6.3's `calculate_next_execution_delay`.
pub fn calculate_next_execution_delay(schedule: &ScheduleConfig, timezone: Option<&str>) -> Duration {
    match schedule {
        ScheduleConfig::IntervalMinutes { interval_minutes } => Duration::from_secs(u64::from(*interval_minutes) * 60),
        ScheduleConfig::DailyTime { daily_time } => {
            let Some((hour, minute)) = parse_daily_time(daily_time) else {
                warn!("executor: malformed dailyTime `{daily_time}`, defaulting to 1 hour");
                return Duration::from_secs(3600);
            };
            match timezone.and_then(|tz| tz.parse::<Tz>().ok()) {
                Some(tz) => seconds_until(Utc::now().with_timezone(&tz), hour, minute),
                None => seconds_until(Local::now(), hour, minute),
            }
        }
    }
}

fn parse_daily_time(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.splitn(2, ':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

fn seconds_until<Tz: TimeZone>(now: DateTime<Tz>, hour: u32, minute: u32) -> Duration {
    let naive = now.date_naive().and_hms_opt(hour, minute, 0).expect("valid hour/minute");
    let mut target = match now.timezone().from_local_datetime(&naive).single() {
        Some(dt) => dt,
        None => return Duration::from_secs(3600),
    };
    if target <= now {
        target = target + chrono::Duration::days(1);
    }
    (target - now).to_std().unwrap_or(Duration::from_secs(0))
}

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared, per-task-completion artifact cache: a dependent task's metadata
/// carries the finalized output text of each of its `dependsOn` tasks.
type Artifacts = Arc<RwLock<HashMap<String, String>>>;

/// Runs [`ExecutionPlan`]s to completion. Grounded in the source's
/// `Executor`/`execute_plan` responsibility; a `TaskExecutor` is cheap to
/// clone (every field is an `Arc` or plain config) so each spawned per-task
/// worker owns its own handle.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<RemoteAgentRegistry>,
    conversations: Arc<ConversationService>,
    tasks: SharedTaskService,
    config: OrchestratorConfig,
}

impl TaskExecutor {
    pub fn new(registry: Arc<RemoteAgentRegistry>, conversations: Arc<ConversationService>, tasks: SharedTaskService, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            conversations,
            tasks,
            config,
        }
    }

    /// Runs every task in `plan` to completion, forwarding client events on
    /// `tx`. Returns once every batch has finished; recurring tasks are
    /// spawned as detached background loops that keep running after this
    /// call returns (cooperative cancellation is the only way to stop them).
    pub async fn execute_plan(&self, plan: ExecutionPlan, tx: mpsc::Sender<StreamEvent>) {
        for task in &plan.tasks {
            self.tasks.register(task.clone()).await;
        }

        let by_id: HashMap<String, Task> = plan.tasks.iter().map(|t| (t.task_id.clone(), t.clone())).collect();
        let (batches, had_cycle) = self.plan_batches(&plan.tasks);
        if had_cycle {
            error!("executor: plan {} has a dependency cycle; running remaining tasks best-effort", plan.plan_id);
        }

        let artifacts: Artifacts = Arc::new(RwLock::new(HashMap::new()));
        let mut failed: HashSet<String> = HashSet::new();

        for batch in batches {
            let mut once_handles = Vec::new();
            let mut recurring_ready = Vec::new();
            for task_id in batch {
                let Some(task) = by_id.get(&task_id).cloned() else { continue };
                if task.depends_on.iter().any(|d| failed.contains(d)) {
                    warn!("executor: skipping task {} because an upstream dependency failed", task.task_id);
                    failed.insert(task.task_id.clone());
                    continue;
                }

                let executor = self.clone();
                let tx = tx.clone();
                let artifacts = artifacts.clone();
                let recurring = task.is_scheduled();
                let task_id = task.task_id.clone();

                if recurring {
                    // The loop's remaining iterations run detached: a dependent task
                    // only needs this one's first-invocation artifact, and the turn
                    // must not block on a schedule that fires again tomorrow.
                    let (ready_tx, ready_rx) = oneshot::channel();
                    tokio::spawn(async move {
                        executor.run_task(task, tx, artifacts, Some(ready_tx)).await;
                    });
                    recurring_ready.push((task_id, ready_rx));
                } else {
                    once_handles.push(tokio::spawn(async move { (task_id, executor.run_task(task, tx, artifacts, None).await) }));
                }
            }
            for handle in once_handles {
                match handle.await {
                    Ok((task_id, succeeded)) => {
                        if !succeeded {
                            failed.insert(task_id);
                        }
                    }
                    Err(e) => error!("executor: task worker panicked: {e}"),
                }
            }
            for (task_id, ready_rx) in recurring_ready {
                match ready_rx.await {
                    Ok(true) => {}
                    Ok(false) => {
                        failed.insert(task_id);
                    }
                    Err(_) => {
                        warn!("executor: recurring task {task_id} worker vanished before its first invocation completed");
                        failed.insert(task_id);
                    }
                }
            }
        }
    }

    /// §4.6.1: a plan where no task declares a dependency takes the
    /// simpler one-task-per-batch sequential path instead of paying
    /// topological-peeling overhead. Behaviorally indistinguishable, kept
    /// for parity with the legacy `execute_plan` code shape.
    fn plan_batches(&self, tasks: &[Task]) -> (Vec<Vec<String>>, bool) {
        if tasks.iter().all(|t| t.depends_on.is_empty()) {
            (tasks.iter().map(|t| vec![t.task_id.clone()]).collect(), false)
        } else {
            topological_batches(tasks)
        }
    }

    /// Runs a single task to completion (for RECURRING, loops invocations
    /// until cancelled). `ready_tx`, when given, fires exactly once — right
    /// after the first invocation's outcome is known — so a caller that only
    /// needs "did the first run succeed" (the batch scheduler, for a
    /// RECURRING task whose remaining iterations run detached) doesn't have
    /// to wait for the loop itself to exit. Returns whether the task's
    /// final/only invocation succeeded.
    async fn run_task(&self, task: Task, tx: mpsc::Sender<StreamEvent>, artifacts: Artifacts, mut ready_tx: Option<oneshot::Sender<bool>>) -> bool {
        let Some(cancel_token) = self.tasks.cancellation_token(&task.task_id).await else {
            warn!("executor: task {} vanished from TaskService before it could start", task.task_id);
            return false;
        };

        self.tasks.transition(&task.task_id, TaskStatus::Running).await;

        let conversation_id = if task.handoff_from_super_agent {
            match self.open_handoff_conversation(&task, &tx).await {
                Ok(id) => id,
                Err(e) => {
                    error!("executor: could not open handoff conversation for task {}: {e}", task.task_id);
                    self.tasks.transition(&task.task_id, TaskStatus::Failed).await;
                    self.emit(&tx, EventFactory::task_failed(&task.conversation_id, &task.thread_id, &task.task_id, &task.agent_name, &e.to_string()))
                        .await;
                    return false;
                }
            }
        } else {
            task.conversation_id.clone()
        };

        let Some(client) = self.registry.get(&task.agent_name) else {
            let reason = format!("agent `{}` is not registered", task.agent_name);
            warn!("executor: {reason}");
            self.tasks.transition(&task.task_id, TaskStatus::Failed).await;
            self.emit(&tx, EventFactory::task_failed(&conversation_id, &task.thread_id, &task.task_id, &task.agent_name, &reason))
                .await;
            self.close_handoff_conversation(&task, &tx, &conversation_id).await;
            return false;
        };

        if task.is_scheduled() {
            self.emit(&tx, EventFactory::scheduled_task_controller(&conversation_id, &task)).await;
        }

        let mut succeeded = true;
        loop {
            if cancel_token.is_cancelled() {
                self.tasks.transition(&task.task_id, TaskStatus::Cancelled).await;
                break;
            }

            let metadata = self.invocation_metadata(&task, &artifacts).await;
            let outcome = self.run_one_invocation(&task, &conversation_id, client.as_ref(), metadata, &tx, &cancel_token).await;

            match outcome {
                Ok(result_text) => {
                    artifacts.write().await.insert(task.task_id.clone(), result_text);
                }
                Err(reason) => {
                    succeeded = false;
                    self.tasks.transition(&task.task_id, TaskStatus::Failed).await;
                    self.emit(&tx, EventFactory::task_failed(&conversation_id, &task.thread_id, &task.task_id, &task.agent_name, &reason))
                        .await;
                    if let Some(ready_tx) = ready_tx.take() {
                        let _ = ready_tx.send(false);
                    }
                    break;
                }
            }

            if let Some(ready_tx) = ready_tx.take() {
                let _ = ready_tx.send(true);
            }

            // Exactly one `task_completed` per task: only the terminal,
            // non-recurring exit emits it. A cancelled recurrence (either at
            // the top of this loop or during cooperative sleep below) must
            // never reach here.
            let Some(schedule) = (if task.is_scheduled() { task.schedule_config.as_ref() } else { None }) else {
                self.tasks.transition(&task.task_id, TaskStatus::Completed).await;
                self.emit(&tx, EventFactory::task_completed(&conversation_id, &task.thread_id, &task.task_id, &task.agent_name))
                    .await;
                break;
            };

            let delay = calculate_next_execution_delay(schedule, self.config.timezone.as_deref());
            if self.cooperative_sleep(delay, &cancel_token).await {
                self.tasks.transition(&task.task_id, TaskStatus::Cancelled).await;
                let updated = self.conversations.mark_scheduled_controller_cancelled(&task.task_id).await;
                if let Err(e) = updated {
                    warn!("executor: failed to mark scheduled controller cancelled for {}: {e}", task.task_id);
                }
                break;
            }
        }

        self.close_handoff_conversation(&task, &tx, &conversation_id).await;
        succeeded
    }

    /// Sleeps for `delay`, polling `cancel_token` every [`CANCEL_POLL_INTERVAL`].
    /// Returns `true` if cancellation fired before the delay elapsed.
    async fn cooperative_sleep(&self, delay: Duration, cancel_token: &tokio_util::sync::CancellationToken) -> bool {
        let mut remaining = delay;
        while remaining > Duration::ZERO {
            if cancel_token.is_cancelled() {
                return true;
            }
            let step = remaining.min(CANCEL_POLL_INTERVAL);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        cancel_token.is_cancelled()
    }

    async fn invocation_metadata(&self, task: &Task, artifacts: &Artifacts) -> serde_json::Value {
        let mut upstream = serde_json::Map::new();
        if !task.depends_on.is_empty() {
            let snapshot = artifacts.read().await;
            for dep in &task.depends_on {
                if let Some(result) = snapshot.get(dep) {
                    upstream.insert(dep.clone(), serde_json::Value::String(result.clone()));
                }
            }
        }
        json!({
            "user_id": task.user_id,
            "lang": self.config.lang,
            "timezone": self.config.timezone,
            "upstream_artifacts": upstream,
        })
    }

    /// Consumes one remote invocation's event stream to completion, routing,
    /// accumulating, persisting, and forwarding each event. Returns the
    /// finalized result text on success, or a failure reason string.
    async fn run_one_invocation(
        &self,
        task: &Task,
        conversation_id: &str,
        client: &(dyn crate::cloudllm::registry::RemoteAgentClient),
        metadata: serde_json::Value,
        tx: &mpsc::Sender<StreamEvent>,
        cancel_token: &tokio_util::sync::CancellationToken,
    ) -> Result<String, String> {
        let mut stream = match client.send_message(&task.query, conversation_id, metadata).await {
            Ok(stream) => stream,
            Err(e) => return Err(e.to_string()),
        };

        let mut accumulator = ScheduledTaskResultAccumulator::new(task.is_scheduled());
        let mut seen_submitted = false;

        while let Some(next) = stream.next().await {
            if cancel_token.is_cancelled() {
                return Err("cancelled".to_string());
            }
            let remote_event = match next {
                Ok(event) => event,
                Err(e) => return Err(e.to_string()),
            };

            if !seen_submitted && remote_event.remote_task_id != task.task_id {
                self.tasks.append_remote_task_id(&task.task_id, remote_event.remote_task_id.clone()).await;
                seen_submitted = true;
            }

            let outcome = EventRouter::route(conversation_id, &task.thread_id, &task.task_id, &task.agent_name, &remote_event);
            let forwarded = accumulator.process(outcome.responses);
            for event in forwarded {
                self.emit(tx, event).await;
            }

            for side_effect in &outcome.side_effects {
                match side_effect {
                    SideEffect::FailTask { reason } => return Err(reason.clone()),
                }
            }

            if outcome.done {
                break;
            }
        }

        if task.is_scheduled() {
            let finalized = accumulator.finalize(conversation_id, &task.thread_id, &task.task_id, &task.agent_name);
            let result_text = finalized.envelope().payload["component"]["result"].as_str().unwrap_or_default().to_string();
            self.emit(tx, finalized).await;
            Ok(result_text)
        } else {
            Ok(String::new())
        }
    }

    /// §4.6.2 step 2: a handoff from the SuperAgent runs in a *fresh* child
    /// conversation (new conversationId, parent threadId preserved).
    async fn open_handoff_conversation(&self, task: &Task, tx: &mpsc::Sender<StreamEvent>) -> Result<String, crate::cloudllm::error::OrchestratorError> {
        let child = self.conversations.load_or_create(Some(&task.conversation_id), &task.user_id, &task.agent_name).await?;
        self.emit(
            tx,
            EventFactory::component_generator(
                &child.id,
                &task.thread_id,
                Some(&task.task_id),
                Some(&task.agent_name),
                "subagent_conversation",
                json!({ "phase": "start", "parent_conversation_id": task.super_agent_conversation_id }),
            ),
        )
        .await;
        Ok(child.id)
    }

    /// One-shot "emit-end" closure per §4.6.2 step 2, called on both the
    /// success and failure exits of [`Self::run_task`].
    async fn close_handoff_conversation(&self, task: &Task, tx: &mpsc::Sender<StreamEvent>, conversation_id: &str) {
        if !task.handoff_from_super_agent {
            return;
        }
        self.emit(
            tx,
            EventFactory::component_generator(
                conversation_id,
                &task.thread_id,
                Some(&task.task_id),
                Some(&task.agent_name),
                "subagent_conversation",
                json!({ "phase": "end" }),
            ),
        )
        .await;
    }

    /// Persists an event then forwards it — the "persist before forward"
    /// ordering the client-visible and stored orderings both depend on.
    async fn emit(&self, tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
        if let Err(e) = self.conversations.persist_event(to_conversation_item(&event)).await {
            error!("executor: failed to persist event {}: {e}", event.kind());
        }
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::error::OrchestratorResult;
    use crate::cloudllm::model::{new_id, TaskPattern};
    use crate::cloudllm::persistence::SqliteStore;
    use crate::cloudllm::registry::{CapabilityCard, RemoteAgentClient, RemoteEvent, RemoteEventStream, RemoteTaskState};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio_stream::wrappers::ReceiverStream;

    struct ScriptedClient {
        events: StdMutex<Option<Vec<RemoteEvent>>>,
    }

    impl ScriptedClient {
        fn new(events: Vec<RemoteEvent>) -> Self {
            Self {
                events: StdMutex::new(Some(events)),
            }
        }
    }

    #[async_trait]
    impl RemoteAgentClient for ScriptedClient {
        async fn send_message(&self, _query: &str, _conversation_id: &str, _metadata: serde_json::Value) -> OrchestratorResult<RemoteEventStream> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            let (sender, receiver) = mpsc::channel(events.len().max(1));
            for event in events {
                sender.send(Ok(event)).await.ok();
            }
            Ok(Box::pin(ReceiverStream::new(receiver)))
        }

        async fn get_card(&self) -> OrchestratorResult<CapabilityCard> {
            Ok(CapabilityCard {
                name: "NewsAgent".into(),
                description: "desc".into(),
                skills: vec![],
            })
        }
    }

    fn sample_task(id: &str, agent: &str, deps: &[&str]) -> Task {
        Task {
            task_id: id.to_string(),
            conversation_id: "c1".into(),
            thread_id: "t1".into(),
            user_id: "u1".into(),
            agent_name: agent.to_string(),
            status: TaskStatus::Pending,
            title: "title".into(),
            query: "query".into(),
            pattern: TaskPattern::Once,
            schedule_config: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            remote_task_ids: vec![],
            handoff_from_super_agent: false,
            super_agent_conversation_id: None,
            created_at: Utc::now(),
        }
    }

    fn executor_with(agent: &str, client: Arc<dyn RemoteAgentClient>) -> (TaskExecutor, mpsc::Sender<StreamEvent>, mpsc::Receiver<StreamEvent>) {
        let mut registry = RemoteAgentRegistry::new();
        registry.register(agent, client);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conversations = Arc::new(ConversationService::new(store.clone(), store));
        let tasks = SharedTaskService::new(crate::cloudllm::task_service::TaskService::new());
        let (tx, rx) = mpsc::channel(64);
        let executor = TaskExecutor::new(Arc::new(registry), conversations, tasks, OrchestratorConfig::default());
        (executor, tx, rx)
    }

    #[tokio::test]
    async fn single_task_plan_runs_to_completion() {
        let client = Arc::new(ScriptedClient::new(vec![
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Submitted,
                message: None,
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Working,
                message: Some("Tesla up 3%".into()),
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Completed,
                message: None,
                reasoning: None,
                tool_call: None,
            },
        ]));
        let (executor, tx, mut rx) = executor_with("NewsAgent", client);
        let plan = ExecutionPlan {
            plan_id: new_id("plan"),
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            orig_query: "Latest Tesla news".into(),
            tasks: vec![sample_task("task1", "NewsAgent", &[])],
            guidance_message: None,
        };

        executor.execute_plan(plan, tx).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind().to_string());
        }
        assert!(kinds.contains(&"task_started".to_string()));
        assert!(kinds.contains(&"message_chunk".to_string()));
        assert!(kinds.contains(&"task_completed".to_string()));

        let task = executor.tasks.get("task1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_upstream_task_blocks_its_dependent() {
        let failing = Arc::new(ScriptedClient::new(vec![RemoteEvent {
            remote_task_id: "r1".into(),
            state: RemoteTaskState::Failed,
            message: Some("boom".into()),
            reasoning: None,
            tool_call: None,
        }]));
        let mut registry = RemoteAgentRegistry::new();
        registry.register("ResearchAgent", failing);
        registry.register("StrategyAgent", Arc::new(ScriptedClient::new(vec![])));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let conversations = Arc::new(ConversationService::new(store.clone(), store));
        let tasks = SharedTaskService::new(crate::cloudllm::task_service::TaskService::new());
        let (tx, mut rx) = mpsc::channel(64);
        let executor = TaskExecutor::new(Arc::new(registry), conversations, tasks, OrchestratorConfig::default());

        let research = sample_task("research", "ResearchAgent", &[]);
        let strategy = sample_task("strategy", "StrategyAgent", &["research"]);
        let plan = ExecutionPlan {
            plan_id: new_id("plan"),
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            orig_query: "Should I invest?".into(),
            tasks: vec![research, strategy],
            guidance_message: None,
        };

        executor.execute_plan(plan, tx).await;
        drop(rx.close());

        let strategy_task = executor.tasks.get("strategy").await.unwrap();
        assert_eq!(strategy_task.status, TaskStatus::Pending);
        let research_task = executor.tasks.get("research").await.unwrap();
        assert_eq!(research_task.status, TaskStatus::Failed);

        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn interval_delay_is_minutes_times_sixty() {
        let delay = calculate_next_execution_delay(&ScheduleConfig::IntervalMinutes { interval_minutes: 5 }, None);
        assert_eq!(delay, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn recurring_task_emits_controller_once_and_never_task_completed_mid_loop() {
        let client = Arc::new(ScriptedClient::new(vec![
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Submitted,
                message: None,
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Working,
                message: Some("Apple beat estimates".into()),
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Completed,
                message: None,
                reasoning: None,
                tool_call: None,
            },
        ]));
        let (executor, tx, mut rx) = executor_with("NewsAgent", client);

        let mut task = sample_task("task1", "NewsAgent", &[]);
        task.pattern = TaskPattern::Recurring;
        task.schedule_config = Some(ScheduleConfig::IntervalMinutes { interval_minutes: 60 });
        executor.tasks.register(task.clone()).await;

        let worker = executor.clone();
        let handle = tokio::spawn(async move { worker.run_task(task, tx, Arc::new(RwLock::new(HashMap::new())), None).await });

        // Let the first invocation finish and the worker settle into its
        // cooperative sleep before the next (60-minute-away) recurrence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.tasks.cancel("task1").await);
        handle.await.unwrap();

        let mut kinds = Vec::new();
        let mut component_types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind().to_string());
            if event.kind() == "component_generator" {
                let payload = event.envelope().payload.clone();
                component_types.push(payload["component_type"].as_str().unwrap_or_default().to_string());
            }
        }

        assert!(!kinds.contains(&"task_completed".to_string()), "a cancelled recurrence must never emit task_completed");
        assert_eq!(component_types.iter().filter(|c| c.as_str() == "scheduled_task_controller").count(), 1);
        assert_eq!(component_types.iter().filter(|c| c.as_str() == "schedule_task_result").count(), 1);
    }
}
