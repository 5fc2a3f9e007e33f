//! Core data model: the shapes that flow between the Triager, Planner,
//! Executor, and the conversation/task stores.
//!
//! Grounded in the original Python dataclasses (`core/task/models.py`-style
//! `Task`/`ExecutionPlan`, `core/super_agent/core.py`'s `SuperAgentOutcome`)
//! but expressed as plain serde-derived structs/enums, since there is no
//! ORM or agent-framework layer underneath this port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Generates a prefixed unique id, e.g. `new_id("task")` -> `task_3e1...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputMeta {
    pub user_id: String,
    pub conversation_id: String,
}

/// A single turn submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub query: String,
    /// Empty string or `"SuperAgent"` means "route through the Triager".
    /// Anything else addresses a specific remote agent directly, bypassing
    /// triage and planning entirely.
    pub target_agent_name: String,
    pub meta: UserInputMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    RequireUserInput,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub agent_name: String,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    pub item_id: String,
    pub conversation_id: String,
    pub thread_id: String,
    pub task_id: Option<String>,
    pub role: String,
    pub event: String,
    pub agent_name: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPattern {
    Once,
    Recurring,
}

/// Exactly one of the two schedule shapes a recurring task can carry.
/// Parsed from planner-LLM JSON via `ScheduleConfigWire` in `planner.rs`,
/// which accepts `{"intervalMinutes": 30}` or `{"dailyTime": "09:00"}`
/// distinguished by field presence alone; this type is the validated,
/// internal representation those wire shapes collapse into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleConfig {
    IntervalMinutes { interval_minutes: u32 },
    DailyTime { daily_time: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Conversation this task's remote agent call happens in. For a
    /// SuperAgent handoff this is a *new* conversation distinct from the
    /// parent; for a directly-addressed task it is the parent conversation.
    pub conversation_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub status: TaskStatus,
    pub title: String,
    pub query: String,
    pub pattern: TaskPattern,
    pub schedule_config: Option<ScheduleConfig>,
    pub depends_on: Vec<String>,
    pub remote_task_ids: Vec<String>,
    pub handoff_from_super_agent: bool,
    /// Set only when `handoff_from_super_agent`: the parent conversation id,
    /// preserved so the child's replies can be traced back to it.
    pub super_agent_conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn is_scheduled(&self) -> bool {
        self.pattern == TaskPattern::Recurring
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub orig_query: String,
    pub tasks: Vec<Task>,
    /// Set (with `tasks` empty) when the planner could not, or chose not to,
    /// produce a runnable plan this turn — e.g. the scheduling-confirmation
    /// rule, or a malformed/inadequate LLM response. The Orchestrator treats
    /// a non-empty `guidance_message` as a pause: it parks an
    /// [`ExecutionContext`], marks the conversation `RequireUserInput`, and
    /// surfaces the message via `plan_require_user_input`.
    pub guidance_message: Option<String>,
}

impl ExecutionPlan {
    pub fn needs_user_input(&self) -> bool {
        self.tasks.is_empty() && self.guidance_message.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageDecision {
    Answer,
    HandoffToPlanner,
}

/// Outcome of a single Triager invocation. Mirrors
/// `SuperAgentOutcome` from the original system: a malformed or
/// unreachable model never raises, it degrades to `Answer` with a
/// diagnostic `answer_content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageOutcome {
    pub decision: TriageDecision,
    pub answer_content: Option<String>,
    pub enriched_query: Option<String>,
    pub recommended_agents: Option<Vec<String>>,
    pub reason: Option<String>,
}

/// A clarification request the Planner raises mid-planning. Re-architected
/// per the Design Notes ("pause-resume state") as a one-shot channel rather
/// than an `asyncio.Event`-alike: `signal` is consumed exactly once, by
/// whichever of the Planner or the Orchestrator's expiry sweep gets there
/// first.
pub struct UserInputRequest {
    pub prompt: String,
    pub response: Option<String>,
    signal: Option<oneshot::Sender<String>>,
}

impl UserInputRequest {
    /// Creates the request alongside the receiver the Planner awaits on.
    pub fn new(prompt: impl Into<String>) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                prompt: prompt.into(),
                response: None,
                signal: Some(tx),
            },
            rx,
        )
    }

    /// Delivers the user's reply to the waiting Planner. A no-op if the
    /// signal was already consumed (e.g. the request was already resolved
    /// or the context expired and was torn down first).
    pub fn resolve(&mut self, response: String) {
        self.response = Some(response.clone());
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(response);
        }
    }
}

/// In-memory-only pause state for a planner that is blocked awaiting
/// clarification. Keyed by `conversation_id` in the Orchestrator; never
/// persisted, never survives a process restart.
#[derive(Clone)]
pub struct ExecutionContextMetadata {
    pub original_user_input: UserInput,
    pub pending_prompt: Option<String>,
    /// The Triager outcome from the turn that opened this pause, replayed on
    /// resume so agent selection (e.g. which agent a confirmed schedule
    /// attaches to) stays consistent across the pause without re-triaging.
    pub triage: Option<TriageOutcome>,
}

pub struct ExecutionContext {
    pub stage: &'static str,
    pub conversation_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ExecutionContextMetadata,
}

impl ExecutionContext {
    pub const STAGE_PLANNING: &'static str = "planning";

    pub fn new_planning(
        conversation_id: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        original_user_input: UserInput,
        triage: Option<TriageOutcome>,
    ) -> Self {
        Self {
            stage: Self::STAGE_PLANNING,
            conversation_id: conversation_id.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            metadata: ExecutionContextMetadata {
                original_user_input,
                pending_prompt: None,
                triage,
            },
        }
    }

    pub fn is_expired(&self, ttl: std::time::Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.created_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => elapsed >= ttl,
            Err(_) => false,
        }
    }
}

/// `{taskId, success, updatedComponentIds}` — the response shape for the
/// `POST /tasks/{taskId}/cancel` surface named in §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub task_id: String,
    pub success: bool,
    pub updated_component_ids: Vec<String>,
}

/// Computes execution batches by repeated topological peeling (§4.6.1):
/// each batch is the maximal set of not-yet-completed tasks whose
/// `depends_on` is already satisfied. If a round finds no ready task while
/// tasks remain, the remainder is a cycle — it is returned as one final
/// best-effort batch and `had_cycle` is `true`.
///
/// Shared between the Planner (DAG validation) and the Executor (actual
/// scheduling) so the two never disagree about what a "batch" is.
pub fn topological_batches(tasks: &[Task]) -> (Vec<Vec<String>>, bool) {
    use std::collections::HashSet;

    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut completed: HashSet<String> = HashSet::new();
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut had_cycle = false;

    while !remaining.is_empty() {
        let mut ready = Vec::new();
        let mut not_ready = Vec::new();
        for t in remaining {
            if t.depends_on.iter().all(|d| completed.contains(d)) {
                ready.push(t);
            } else {
                not_ready.push(t);
            }
        }
        if ready.is_empty() {
            had_cycle = true;
            batches.push(not_ready.iter().map(|t| t.task_id.clone()).collect());
            break;
        }
        batches.push(ready.iter().map(|t| t.task_id.clone()).collect());
        for t in &ready {
            completed.insert(t.task_id.clone());
        }
        remaining = not_ready;
    }
    (batches, had_cycle)
}

/// `true` iff `depends_on` across `tasks` forms a DAG with no cycles and no
/// dangling references outside the plan.
pub fn is_valid_dag(tasks: &[Task]) -> bool {
    let ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    if tasks.iter().any(|t| t.depends_on.iter().any(|d| !ids.contains(d.as_str()))) {
        return false;
    }
    let (_, had_cycle) = topological_batches(tasks);
    !had_cycle
}
