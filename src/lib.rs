// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access.
pub use cloudllm::config::{init_logging, OrchestratorConfig};
pub use cloudllm::error::{OrchestratorError, OrchestratorResult};
pub use cloudllm::event::StreamEvent;
pub use cloudllm::llm::LlmInvoker;
pub use cloudllm::model::{CancelResult, Conversation, ConversationStatus, ExecutionPlan, Task, TaskPattern, TaskStatus, UserInput, UserInputMeta};
pub use cloudllm::orchestrator::{Orchestrator, ServiceBundle, TaskApiService};
pub use cloudllm::registry::{CapabilityCard, RemoteAgentClient, RemoteAgentRegistry};
