//! Crate-wide error taxonomy for the orchestration engine.
//!
//! Every fallible core function returns [`OrchestratorResult`]. The variants
//! mirror the seven error kinds the runtime distinguishes: callers at the
//! session boundary match on them to decide whether a failure becomes a
//! `task_failed` event (recoverable, peer tasks continue) or a `system_failed`
//! event (fatal to the session).

use thiserror::Error;

/// The error type threaded through every fallible orchestration call.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Could not reach a remote agent at all (connection refused, DNS failure, etc).
    #[error("could not reach agent `{agent_name}`: {message}")]
    Transport { agent_name: String, message: String },

    /// The remote agent reached us fine but reported a terminal `failed` status.
    #[error("agent `{agent_name}` reported failure: {message}")]
    RemoteTaskFailure { agent_name: String, message: String },

    /// The planning LLM returned output that could not be parsed into a plan.
    #[error("planner produced malformed output: {0}")]
    PlannerMalformed(String),

    /// A plan failed validation (unknown agent, cyclic dependency, bad schedule).
    #[error("plan validation failed: {0}")]
    Validation(String),

    /// Resuming a paused conversation with a missing, expired, or mismatched context.
    #[error("execution context error: {0}")]
    Context(String),

    /// The task was cancelled by the user; not a failure.
    #[error("task `{0}` was cancelled")]
    Cancelled(String),

    /// An unhandled failure inside the executor itself, not attributable to any one task.
    #[error("executor failure: {0}")]
    Executor(String),

    /// SQLite-backed persistence failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// JSON (de)serialization failure, typically while parsing LLM or remote output.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Filesystem or other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
