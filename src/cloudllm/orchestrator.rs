//! Orchestrator: the top-level session driver. Runs the
//! Triager → Planner → Executor pipeline for a single [`UserInput`],
//! owns the in-memory [`ExecutionContext`] table that backs HITL
//! pause/resume, and exposes the idempotent task-cancellation surface
//! described in §6.
//!
//! Grounded in `core/orchestrator/core.py`'s `Orchestrator.process_user_input`
//! and `_cleanup_expired_contexts`; re-architected per the Design Notes as a
//! struct taking an explicitly-composed [`ServiceBundle`] rather than reaching
//! for module-level singletons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::cloudllm::config::OrchestratorConfig;
use crate::cloudllm::conversation_service::ConversationService;
use crate::cloudllm::event::{EventFactory, StreamEvent};
use crate::cloudllm::executor::TaskExecutor;
use crate::cloudllm::model::{
    new_id, CancelResult, ConversationStatus, ExecutionContext, ExecutionPlan, TriageDecision, TriageOutcome, UserInput,
};
use crate::cloudllm::persistence::{ConversationStore, ItemStore};
use crate::cloudllm::planner::Planner;
use crate::cloudllm::registry::RemoteAgentRegistry;
use crate::cloudllm::task_service::SharedTaskService;
use crate::cloudllm::triager::{should_fast_track, Triager};

/// Default capacity of the bounded channel a session's producer pushes
/// client events onto. A disconnected consumer drains nothing further; the
/// producer keeps running per §5 (overflow policy = drop-on-consumer-gone,
/// not drop-on-full — a full queue backpressures the producer).
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// How often the background sweep in [`ServiceBundle::compose`] checks the
/// context table for TTL expiry. Independent of the TTL itself.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Owns every [`ExecutionContext`] keyed by conversation id. Single-writer:
/// only the Orchestrator mutates this map, per §5's shared-resource policy.
#[derive(Default)]
struct ContextTable {
    contexts: HashMap<String, ExecutionContext>,
}

/// `processUserInput(UserInput) -> stream of Event` and the HITL pause/resume
/// state machine from §4.7. Cheap to clone: every field is an `Arc` (or, for
/// the context table, an `Arc<Mutex<..>>`), so a new session's detached
/// producer can own its own handle.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<RemoteAgentRegistry>,
    conversations: Arc<ConversationService>,
    tasks: SharedTaskService,
    triager: Arc<Triager>,
    planner: Arc<Planner>,
    executor: TaskExecutor,
    config: OrchestratorConfig,
    contexts: Arc<Mutex<ContextTable>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<RemoteAgentRegistry>,
        conversations: Arc<ConversationService>,
        tasks: SharedTaskService,
        triager: Arc<Triager>,
        planner: Arc<Planner>,
        executor: TaskExecutor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            conversations,
            tasks,
            triager,
            planner,
            executor,
            config,
            contexts: Arc::new(Mutex::new(ContextTable::default())),
        }
    }

    /// Public entry point. Spawns a detached producer and returns the
    /// receiving half of the bounded channel it pushes events into. Per
    /// §4.7, if the caller drops the receiver the producer keeps running:
    /// events still persist and recurring tasks keep executing, the queue
    /// simply stops being drained.
    pub fn process_user_input(&self, input: UserInput) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(DEFAULT_STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move {
            this.run_session(input, tx).await;
        });
        rx
    }

    /// Same as [`Self::process_user_input`] but runs the session inline and
    /// returns only once it's finished (i.e. once `done`/`system_failed` has
    /// been emitted). Convenient for tests and for callers that already run
    /// their own producer task.
    pub async fn process_user_input_to_completion(&self, input: UserInput) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(DEFAULT_STREAM_BUFFER);
        self.run_session(input, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn run_session(&self, input: UserInput, tx: mpsc::Sender<StreamEvent>) {
        let thread_id = new_id("thread");
        let default_agent = if input.target_agent_name.trim().is_empty() {
            "SuperAgent"
        } else {
            input.target_agent_name.as_str()
        };
        let existing_id = if input.meta.conversation_id.trim().is_empty() {
            None
        } else {
            Some(input.meta.conversation_id.as_str())
        };

        let conversation = match self.conversations.load_or_create(existing_id, &input.meta.user_id, default_agent).await {
            Ok(c) => c,
            Err(e) => {
                error!("orchestrator: failed to load/create conversation: {e}");
                self.emit(&tx, EventFactory::system_failed("unknown", &thread_id, &e.to_string())).await;
                self.emit(&tx, EventFactory::done("unknown", &thread_id)).await;
                return;
            }
        };

        self.emit(&tx, EventFactory::conversation_started(&conversation.id, &thread_id)).await;
        self.emit(&tx, EventFactory::thread_started(&conversation.id, &thread_id)).await;

        let plan = if conversation.status == ConversationStatus::RequireUserInput {
            self.resume_paused_turn(&conversation.id, input, &thread_id, &tx).await
        } else {
            self.start_new_turn(&conversation.id, input, &thread_id, &tx).await
        };

        if let Some(plan) = plan {
            if let Some(first) = plan.tasks.first() {
                if let Err(e) = self.conversations.maybe_set_title(&conversation.id, &first.title).await {
                    warn!("orchestrator: failed to set conversation title: {e}");
                }
            }
            self.executor.execute_plan(plan, tx.clone()).await;
        }

        self.emit(&tx, EventFactory::done(&conversation.id, &thread_id)).await;
    }

    /// Fresh turn on an `ACTIVE` conversation: fast-track check, then
    /// Triager-or-skip, then Planner. Returns `Some(plan)` when the plan is
    /// ready for the Executor, `None` when the turn already concluded this
    /// call (direct answer, or a fresh HITL pause).
    async fn start_new_turn(&self, conversation_id: &str, input: UserInput, thread_id: &str, tx: &mpsc::Sender<StreamEvent>) -> Option<ExecutionPlan> {
        let triage = if should_fast_track(&input) {
            info!("orchestrator: fast-tracking to planner for conversation {conversation_id}");
            TriageOutcome {
                decision: TriageDecision::HandoffToPlanner,
                answer_content: None,
                enriched_query: None,
                recommended_agents: None,
                reason: Some("lexical fast-track bypass".to_string()),
            }
        } else {
            self.triager.triage(&input, &self.registry).await
        };

        if triage.decision == TriageDecision::Answer {
            let text = triage.answer_content.unwrap_or_default();
            self.emit(tx, EventFactory::message_chunk(conversation_id, thread_id, "", "SuperAgent", &text)).await;
            return None;
        }

        let plan_input = match &triage.enriched_query {
            Some(enriched) if !enriched.trim().is_empty() => UserInput {
                query: enriched.clone(),
                ..input.clone()
            },
            _ => input.clone(),
        };

        let plan = self.planner.plan(&plan_input, thread_id, &triage, &self.registry).await;

        if plan.needs_user_input() {
            self.pause_for_user_input(conversation_id, thread_id, input, triage, &plan, tx).await;
            return None;
        }

        Some(plan)
    }

    /// Resumes a conversation parked in `REQUIRE_USER_INPUT`. Validates the
    /// context (user match, TTL, stage), then replays the original query
    /// concatenated with the user's reply back through the Planner — the
    /// simplest faithful rendition of "resume the paused planner" once the
    /// Planner itself is a pure `plan(...)` call rather than a long-lived
    /// task (see DESIGN.md).
    async fn resume_paused_turn(&self, conversation_id: &str, reply: UserInput, thread_id: &str, tx: &mpsc::Sender<StreamEvent>) -> Option<ExecutionPlan> {
        let context = {
            let mut table = self.contexts.lock().await;
            table.contexts.remove(conversation_id)
        };

        let context = match self.validate_context(context, &reply) {
            Ok(ctx) => ctx,
            Err(reason) => {
                warn!("orchestrator: context error resuming {conversation_id}: {reason}");
                self.emit(tx, EventFactory::system_failed(conversation_id, thread_id, &reason)).await;
                if let Err(e) = self.conversations.set_status(conversation_id, ConversationStatus::Terminated).await {
                    warn!("orchestrator: failed to terminate conversation {conversation_id} after context error: {e}");
                }
                return None;
            }
        };

        if let Err(e) = self.conversations.set_status(conversation_id, ConversationStatus::Active).await {
            warn!("orchestrator: failed to reactivate conversation {conversation_id}: {e}");
        }

        let original = context.metadata.original_user_input;
        let resumed_input = UserInput {
            query: format!("{} {}", original.query, reply.query),
            target_agent_name: original.target_agent_name,
            meta: original.meta,
        };
        let triage = context.metadata.triage.unwrap_or(TriageOutcome {
            decision: TriageDecision::HandoffToPlanner,
            answer_content: None,
            enriched_query: None,
            recommended_agents: None,
            reason: None,
        });

        let plan = self.planner.plan(&resumed_input, thread_id, &triage, &self.registry).await;
        if plan.needs_user_input() {
            self.pause_for_user_input(conversation_id, thread_id, resumed_input, triage, &plan, tx).await;
            return None;
        }
        Some(plan)
    }

    fn validate_context(&self, context: Option<ExecutionContext>, reply: &UserInput) -> Result<ExecutionContext, String> {
        let Some(context) = context else {
            return Err("no paused execution context for this conversation".to_string());
        };
        if context.stage != ExecutionContext::STAGE_PLANNING {
            return Err(format!("unexpected execution context stage `{}`", context.stage));
        }
        if context.user_id != reply.meta.user_id {
            return Err("execution context user mismatch".to_string());
        }
        if context.is_expired(self.config.execution_context_ttl) {
            return Err("execution context expired".to_string());
        }
        Ok(context)
    }

    /// HITL pause (§4.7): parks an `ExecutionContext`, flips the
    /// conversation to `REQUIRE_USER_INPUT`, and emits
    /// `plan_require_user_input` with the planner's guidance message.
    async fn pause_for_user_input(
        &self,
        conversation_id: &str,
        thread_id: &str,
        original_input: UserInput,
        triage: TriageOutcome,
        plan: &ExecutionPlan,
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let prompt = plan.guidance_message.clone().unwrap_or_else(|| "I need more information to continue.".to_string());
        let context = ExecutionContext::new_planning(conversation_id, thread_id, original_input.meta.user_id.clone(), original_input, Some(triage));
        self.contexts.lock().await.contexts.insert(conversation_id.to_string(), context);

        if let Err(e) = self.conversations.set_status(conversation_id, ConversationStatus::RequireUserInput).await {
            warn!("orchestrator: failed to mark conversation {conversation_id} as requiring user input: {e}");
        }
        self.emit(tx, EventFactory::plan_require_user_input(conversation_id, thread_id, &prompt)).await;
    }

    async fn emit(&self, tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
        if let Err(e) = self.conversations.persist_event(crate::cloudllm::event::to_conversation_item(&event)).await {
            error!("orchestrator: failed to persist event {}: {e}", event.kind());
        }
        let _ = tx.send(event).await;
    }

    /// Removes every `ExecutionContext` past its TTL. Returns the
    /// conversation ids that were reaped, so callers (the background sweep
    /// spawned by [`ServiceBundle::compose`], or a test) can observe it.
    /// There is no live planner task to cancel in this rendition (see
    /// DESIGN.md); the practical effect of "cancel the associated planner
    /// task" is that the next turn on that conversation starts a fresh one.
    pub async fn sweep_expired_contexts(&self) -> Vec<String> {
        let mut table = self.contexts.lock().await;
        let ttl = self.config.execution_context_ttl;
        let expired: Vec<String> = table.contexts.iter().filter(|(_, ctx)| ctx.is_expired(ttl)).map(|(id, _)| id.clone()).collect();
        for id in &expired {
            table.contexts.remove(id);
            warn!("orchestrator: reaped expired execution context for conversation {id}");
        }
        expired
    }

    pub fn task_api(&self) -> TaskApiService {
        TaskApiService {
            tasks: self.tasks.clone(),
            conversations: self.conversations.clone(),
        }
    }
}

/// The `POST /tasks/{taskId}/cancel` surface from §6, exposed as a plain
/// async method — no router/framework dependency is introduced by the core.
#[derive(Clone)]
pub struct TaskApiService {
    tasks: SharedTaskService,
    conversations: Arc<ConversationService>,
}

impl TaskApiService {
    /// Cancels `task_id` if it's known in memory, then — regardless —
    /// upserts every persisted `scheduled_task_controller` component
    /// referencing it to `task_status: "cancelled"`. Idempotent: calling
    /// this twice in a row produces the same observable state both times,
    /// which is what makes it safe to call after a process restart wiped
    /// the in-memory `TaskService` entry.
    pub async fn cancel_and_update_component(&self, task_id: &str) -> CancelResult {
        let success = self.tasks.cancel(task_id).await;
        let updated_component_ids = self.conversations.mark_scheduled_controller_cancelled(task_id).await.unwrap_or_else(|e| {
            warn!("task_api: failed to upsert cancelled component: {e}");
            Vec::new()
        });
        CancelResult {
            task_id: task_id.to_string(),
            success: success || !updated_component_ids.is_empty(),
            updated_component_ids,
        }
    }
}

/// Composition root: builds one instance each of every service the
/// Orchestrator depends on. Grounded in the source's
/// `AgentServiceBundle.compose(...)` and the Design Notes' "explicit DI over
/// global singletons" directive — the Orchestrator takes this by value at
/// construction instead of reaching for module statics.
pub struct ServiceBundle {
    pub registry: Arc<RemoteAgentRegistry>,
    pub conversations: Arc<ConversationService>,
    pub tasks: SharedTaskService,
    pub triager: Arc<Triager>,
    pub planner: Arc<Planner>,
    pub executor: TaskExecutor,
    pub config: OrchestratorConfig,
}

impl ServiceBundle {
    /// Builds a bundle around the given stores, registry, and LLM backend,
    /// using `config` (typically [`OrchestratorConfig::from_env`]) for the
    /// ambient knobs. Starts the conversation/item stores' owner (a single
    /// shared store implementing both traits, e.g. `SqliteStore`) from the
    /// caller so tests can swap in in-memory fakes.
    pub fn compose(
        registry: RemoteAgentRegistry,
        conversations_store: Arc<dyn ConversationStore>,
        items_store: Arc<dyn ItemStore>,
        llm: Arc<dyn crate::cloudllm::llm::LlmInvoker>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let conversations = Arc::new(ConversationService::new(conversations_store, items_store));
        let tasks = SharedTaskService::new(crate::cloudllm::task_service::TaskService::new());
        let triager = Arc::new(Triager::new(llm.clone()));
        let planner = Arc::new(Planner::new(llm));
        let executor = TaskExecutor::new(registry.clone(), conversations.clone(), tasks.clone(), config.clone());
        Self {
            registry,
            conversations,
            tasks,
            triager,
            planner,
            executor,
            config,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.registry.clone(),
            self.conversations.clone(),
            self.tasks.clone(),
            self.triager.clone(),
            self.planner.clone(),
            self.executor.clone(),
            self.config.clone(),
        )
    }

    /// Spawns the background sweep named in §4.7 ("Expired `ExecutionContext`
    /// entries are swept periodically, not just on access"). Returns a
    /// handle the caller can abort on shutdown; the task runs until aborted.
    pub fn spawn_context_sweep(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                orchestrator.sweep_expired_contexts().await;
            }
        })
    }
}
