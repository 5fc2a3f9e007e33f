//! Canonical client-facing events and the remote→client translation layer.
//!
//! [`EventFactory`] builds the events the Orchestrator/Executor forward to
//! the client and persist to the [`ItemStore`](crate::cloudllm::persistence::ItemStore).
//! [`EventRouter`] translates a single [`RemoteEvent`](crate::cloudllm::registry::RemoteEvent)
//! from a specialist agent's stream into zero or more of them.
//!
//! Every [`StreamEvent`] carries a tag matching its wire `event` field so the
//! `{event, data}` envelope in the external transport contract falls out of
//! `serde`'s adjacently-tagged representation for free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cloudllm::model::{new_id, ConversationItem, Task};
use crate::cloudllm::registry::{RemoteEvent, RemoteTaskState};

/// Common fields every event carries, regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_name: Option<String>,
    pub item_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Every event kind the core emits, `#[serde(tag = "event", content = "data")]`
/// so the wire shape is exactly `{"event": "message_chunk", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    ConversationStarted(EventEnvelope),
    ThreadStarted(EventEnvelope),
    TaskStarted(EventEnvelope),
    TaskCompleted(EventEnvelope),
    TaskFailed(EventEnvelope),
    MessageChunk(EventEnvelope),
    Reasoning(EventEnvelope),
    ToolCallStarted(EventEnvelope),
    ToolCallCompleted(EventEnvelope),
    PlanRequireUserInput(EventEnvelope),
    PlanFailed(EventEnvelope),
    ComponentGenerator(EventEnvelope),
    SystemFailed(EventEnvelope),
    Done(EventEnvelope),
}

impl StreamEvent {
    pub fn envelope(&self) -> &EventEnvelope {
        match self {
            StreamEvent::ConversationStarted(e)
            | StreamEvent::ThreadStarted(e)
            | StreamEvent::TaskStarted(e)
            | StreamEvent::TaskCompleted(e)
            | StreamEvent::TaskFailed(e)
            | StreamEvent::MessageChunk(e)
            | StreamEvent::Reasoning(e)
            | StreamEvent::ToolCallStarted(e)
            | StreamEvent::ToolCallCompleted(e)
            | StreamEvent::PlanRequireUserInput(e)
            | StreamEvent::PlanFailed(e)
            | StreamEvent::ComponentGenerator(e)
            | StreamEvent::SystemFailed(e)
            | StreamEvent::Done(e) => e,
        }
    }

    /// The wire `event` string, e.g. `"message_chunk"`. Matches the
    /// `#[serde(rename_all = "snake_case")]` variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ConversationStarted(_) => "conversation_started",
            StreamEvent::ThreadStarted(_) => "thread_started",
            StreamEvent::TaskStarted(_) => "task_started",
            StreamEvent::TaskCompleted(_) => "task_completed",
            StreamEvent::TaskFailed(_) => "task_failed",
            StreamEvent::MessageChunk(_) => "message_chunk",
            StreamEvent::Reasoning(_) => "reasoning",
            StreamEvent::ToolCallStarted(_) => "tool_call_started",
            StreamEvent::ToolCallCompleted(_) => "tool_call_completed",
            StreamEvent::PlanRequireUserInput(_) => "plan_require_user_input",
            StreamEvent::PlanFailed(_) => "plan_failed",
            StreamEvent::ComponentGenerator(_) => "component_generator",
            StreamEvent::SystemFailed(_) => "system_failed",
            StreamEvent::Done(_) => "done",
        }
    }

    /// Terminal-for-the-stream markers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }
}

/// Maps a [`StreamEvent`] to the persisted-item shape it always carries
/// alongside the client forward — the "every emitted event MUST be persisted"
/// contract in §4.1, shared by the Executor and the Orchestrator so both
/// persist the same way.
pub fn to_conversation_item(event: &StreamEvent) -> ConversationItem {
    let env = event.envelope();
    let role = match event {
        StreamEvent::ConversationStarted(_)
        | StreamEvent::ThreadStarted(_)
        | StreamEvent::PlanRequireUserInput(_)
        | StreamEvent::PlanFailed(_)
        | StreamEvent::SystemFailed(_)
        | StreamEvent::Done(_) => "system",
        _ => "assistant",
    };
    ConversationItem {
        item_id: env.item_id.clone(),
        conversation_id: env.conversation_id.clone(),
        thread_id: env.thread_id.clone().unwrap_or_default(),
        task_id: env.task_id.clone(),
        role: role.to_string(),
        event: event.kind().to_string(),
        agent_name: env.agent_name.clone(),
        payload: env.payload.clone(),
        metadata: None,
        created_at: env.timestamp,
    }
}

#[derive(Default, Clone, Copy)]
struct EnvelopeArgs<'a> {
    thread_id: Option<&'a str>,
    task_id: Option<&'a str>,
    agent_name: Option<&'a str>,
}

fn envelope(conversation_id: &str, args: EnvelopeArgs, payload: Value) -> EventEnvelope {
    EventEnvelope {
        conversation_id: conversation_id.to_string(),
        thread_id: args.thread_id.map(str::to_string),
        task_id: args.task_id.map(str::to_string),
        agent_name: args.agent_name.map(str::to_string),
        item_id: new_id("item"),
        payload,
        timestamp: Utc::now(),
    }
}

/// Stateless constructor for canonical [`StreamEvent`]s. Grounded in the
/// "builds canonical response events" responsibility named for this
/// component; every method here has a matching persisted `ConversationItem`
/// shape on the Executor/Orchestrator side.
pub struct EventFactory;

impl EventFactory {
    pub fn conversation_started(conversation_id: &str, thread_id: &str) -> StreamEvent {
        StreamEvent::ConversationStarted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({}),
        ))
    }

    pub fn thread_started(conversation_id: &str, thread_id: &str) -> StreamEvent {
        StreamEvent::ThreadStarted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({}),
        ))
    }

    pub fn task_started(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str) -> StreamEvent {
        StreamEvent::TaskStarted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({}),
        ))
    }

    pub fn task_completed(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str) -> StreamEvent {
        StreamEvent::TaskCompleted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({}),
        ))
    }

    pub fn task_failed(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str, reason: &str) -> StreamEvent {
        StreamEvent::TaskFailed(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({ "reason": reason }),
        ))
    }

    pub fn message_chunk(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str, text: &str) -> StreamEvent {
        StreamEvent::MessageChunk(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({ "text": text }),
        ))
    }

    pub fn reasoning(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str, text: &str) -> StreamEvent {
        StreamEvent::Reasoning(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({ "text": text }),
        ))
    }

    pub fn tool_call_started(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str, tool_name: &str) -> StreamEvent {
        StreamEvent::ToolCallStarted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({ "tool_name": tool_name }),
        ))
    }

    pub fn tool_call_completed(conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str, tool_name: &str) -> StreamEvent {
        StreamEvent::ToolCallCompleted(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id: Some(task_id),
                agent_name: Some(agent_name),
            },
            json!({ "tool_name": tool_name }),
        ))
    }

    pub fn plan_require_user_input(conversation_id: &str, thread_id: &str, prompt: &str) -> StreamEvent {
        StreamEvent::PlanRequireUserInput(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({ "prompt": prompt }),
        ))
    }

    pub fn plan_failed(conversation_id: &str, thread_id: &str, reason: &str) -> StreamEvent {
        StreamEvent::PlanFailed(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({ "reason": reason }),
        ))
    }

    pub fn component_generator(
        conversation_id: &str,
        thread_id: &str,
        task_id: Option<&str>,
        agent_name: Option<&str>,
        component_type: &str,
        component_payload: Value,
    ) -> StreamEvent {
        StreamEvent::ComponentGenerator(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                task_id,
                agent_name,
            },
            json!({ "component_type": component_type, "component": component_payload }),
        ))
    }

    /// The `scheduled_task_controller` component, emitted once at the start
    /// of a RECURRING task's first invocation so the UI has something to
    /// show (and cancel) before the first `schedule_task_result` lands. The
    /// cancel-in-place machinery upserts this same item id's
    /// `component.task_status` rather than emitting a fresh one.
    pub fn scheduled_task_controller(conversation_id: &str, task: &Task) -> StreamEvent {
        StreamEvent::ComponentGenerator(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(&task.thread_id),
                task_id: Some(&task.task_id),
                agent_name: Some(&task.agent_name),
            },
            json!({
                "component_type": "scheduled_task_controller",
                "component": {
                    "task_id": task.task_id,
                    "title": task.title,
                    "schedule_config": task.schedule_config,
                    "task_status": "running",
                },
            }),
        ))
    }

    pub fn system_failed(conversation_id: &str, thread_id: &str, reason: &str) -> StreamEvent {
        StreamEvent::SystemFailed(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({ "reason": reason }),
        ))
    }

    pub fn done(conversation_id: &str, thread_id: &str) -> StreamEvent {
        StreamEvent::Done(envelope(
            conversation_id,
            EnvelopeArgs {
                thread_id: Some(thread_id),
                ..Default::default()
            },
            json!({}),
        ))
    }
}

/// What the Executor must do in response to a routed remote event, beyond
/// forwarding the translated [`StreamEvent`]s.
#[derive(Debug, Clone)]
pub enum SideEffect {
    FailTask { reason: String },
}

/// Result of routing a single remote event: the client-facing events it
/// translates to, any side effects the Executor must act on, and whether
/// this remote event was terminal for the task (`completed` or `failed`).
pub struct RouteOutcome {
    pub responses: Vec<StreamEvent>,
    pub side_effects: Vec<SideEffect>,
    pub done: bool,
}

/// Translates a single task's remote event stream into the client event
/// vocabulary. Stateless: every call is a pure function of its inputs.
pub struct EventRouter;

impl EventRouter {
    pub fn route(
        conversation_id: &str,
        thread_id: &str,
        task_id: &str,
        agent_name: &str,
        event: &RemoteEvent,
    ) -> RouteOutcome {
        match event.state {
            RemoteTaskState::Submitted => RouteOutcome {
                responses: vec![EventFactory::task_started(conversation_id, thread_id, task_id, agent_name)],
                side_effects: vec![],
                done: false,
            },
            RemoteTaskState::Working => {
                let mut responses = Vec::new();
                if let Some(message) = &event.message {
                    responses.push(EventFactory::message_chunk(conversation_id, thread_id, task_id, agent_name, message));
                }
                if let Some(reasoning) = &event.reasoning {
                    responses.push(EventFactory::reasoning(conversation_id, thread_id, task_id, agent_name, reasoning));
                }
                if let Some(tool_call) = &event.tool_call {
                    responses.push(if tool_call.started {
                        EventFactory::tool_call_started(conversation_id, thread_id, task_id, agent_name, &tool_call.name)
                    } else {
                        EventFactory::tool_call_completed(conversation_id, thread_id, task_id, agent_name, &tool_call.name)
                    });
                }
                RouteOutcome {
                    responses,
                    side_effects: vec![],
                    done: false,
                }
            }
            RemoteTaskState::Completed => RouteOutcome {
                responses: vec![],
                side_effects: vec![],
                done: true,
            },
            RemoteTaskState::Failed => RouteOutcome {
                responses: vec![],
                side_effects: vec![SideEffect::FailTask {
                    reason: event.message.clone().unwrap_or_else(|| "remote agent reported failure".to_string()),
                }],
                done: true,
            },
        }
    }
}

/// Concatenates per-invocation output for RECURRING tasks instead of
/// forwarding it chunk-by-chunk; a no-op pass-through for ONCE tasks.
pub struct ScheduledTaskResultAccumulator {
    is_scheduled: bool,
    buffer: Vec<String>,
}

impl ScheduledTaskResultAccumulator {
    pub fn new(is_scheduled: bool) -> Self {
        Self {
            is_scheduled,
            buffer: Vec::new(),
        }
    }

    /// Filters a batch of routed events. Reasoning/tool-call events are
    /// dropped when scheduled; message chunks are buffered instead of
    /// passed through; everything else passes through unchanged.
    pub fn process(&mut self, events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        if !self.is_scheduled {
            return events;
        }
        let mut passthrough = Vec::with_capacity(events.len());
        for event in events {
            match &event {
                StreamEvent::MessageChunk(env) => {
                    if let Some(text) = env.payload.get("text").and_then(Value::as_str) {
                        self.buffer.push(text.to_string());
                    }
                }
                StreamEvent::Reasoning(_) | StreamEvent::ToolCallStarted(_) | StreamEvent::ToolCallCompleted(_) => {}
                _ => passthrough.push(event),
            }
        }
        passthrough
    }

    /// Emits the consolidated `schedule_task_result` component for this
    /// invocation. Only meaningful when `is_scheduled`; callers skip it
    /// entirely for ONCE tasks.
    pub fn finalize(&self, conversation_id: &str, thread_id: &str, task_id: &str, agent_name: &str) -> StreamEvent {
        let result = if self.buffer.is_empty() {
            "Task completed without output.".to_string()
        } else {
            self.buffer.join("")
        };
        EventFactory::component_generator(
            conversation_id,
            thread_id,
            Some(task_id),
            Some(agent_name),
            "schedule_task_result",
            json!({ "result": result, "create_time": Utc::now() }),
        )
    }
}
