//! Remote agent registry and the dispatch seam that reaches them.
//!
//! Agent identity is a name (`"ResearchAgent"`, `"StrategyAgent"`, ...), not a
//! Rust type — dispatch is dynamic by design (see the "Dynamic dispatch over
//! agent names" design note), so the registry maps names to
//! `Arc<dyn RemoteAgentClient>` rather than enumerating a closed set of
//! client types.

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cloudllm::error::OrchestratorResult;

#[derive(Debug, Clone)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub examples: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CapabilityCard {
    pub name: String,
    pub description: String,
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTaskState {
    Submitted,
    Working,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ToolCallInfo {
    pub name: String,
    /// `true` on the opening event for this call, `false` on completion.
    pub started: bool,
}

/// One update in a remote agent's event stream for a single invocation.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub remote_task_id: String,
    pub state: RemoteTaskState,
    pub message: Option<String>,
    pub reasoning: Option<String>,
    pub tool_call: Option<ToolCallInfo>,
}

pub type RemoteEventStream = Pin<Box<dyn Stream<Item = OrchestratorResult<RemoteEvent>> + Send>>;

/// The seam through which the Executor talks to a specialist agent.
/// Concrete transports (HTTP/SSE, gRPC, in-process) implement this; the
/// core never depends on any one of them.
#[async_trait]
pub trait RemoteAgentClient: Send + Sync {
    async fn send_message(
        &self,
        query: &str,
        conversation_id: &str,
        metadata: serde_json::Value,
    ) -> OrchestratorResult<RemoteEventStream>;

    async fn get_card(&self) -> OrchestratorResult<CapabilityCard>;

    /// Best-effort cancellation of an in-flight remote task. Transports that
    /// can't cancel remotely may no-op; cooperative cancellation on our side
    /// still applies via the task's `CancellationToken`.
    async fn cancel(&self, _remote_task_id: &str) -> OrchestratorResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RemoteAgentRegistry {
    clients: HashMap<String, Arc<dyn RemoteAgentClient>>,
    card_cache: RwLock<HashMap<String, CapabilityCard>>,
}

impl RemoteAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_name: impl Into<String>, client: Arc<dyn RemoteAgentClient>) {
        self.clients.insert(agent_name.into(), client);
    }

    pub fn get(&self, agent_name: &str) -> Option<Arc<dyn RemoteAgentClient>> {
        self.clients.get(agent_name).cloned()
    }

    pub fn contains(&self, agent_name: &str) -> bool {
        self.clients.contains_key(agent_name)
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_card(&self, agent_name: &str) -> OrchestratorResult<Option<CapabilityCard>> {
        if let Some(card) = self.card_cache.read().await.get(agent_name) {
            return Ok(Some(card.clone()));
        }
        let Some(client) = self.get(agent_name) else {
            return Ok(None);
        };
        let card = client.get_card().await?;
        self.card_cache
            .write()
            .await
            .insert(agent_name.to_string(), card.clone());
        Ok(Some(card))
    }

    pub async fn capability_prompt(&self, agent_name: &str) -> String {
        match self.get_card(agent_name).await {
            Ok(Some(card)) => card_to_prompt(&card),
            _ => format!("Agent `{agent_name}` is not currently available."),
        }
    }

    /// Builds the "here is what every agent can do" block the Triager and
    /// Planner prompts embed, one `<AgentName>...</AgentName>` section per
    /// registered agent.
    pub async fn all_capability_prompts(&self) -> String {
        let mut parts = Vec::new();
        for name in self.agent_names() {
            parts.push(format!("<{name}>\n{}\n</{name}>", self.capability_prompt(&name).await));
        }
        parts.join("\n\n")
    }
}

/// Formats a capability card as the Markdown block the planning prompts
/// embed, grounded in the original `agentcard_to_prompt` helper.
pub fn card_to_prompt(card: &CapabilityCard) -> String {
    let mut prompt = format!("# Agent: {}\n\n**Description:** {}\n", card.name, card.description);
    if !card.skills.is_empty() {
        prompt.push_str("\n## Skills\n");
        for (i, skill) in card.skills.iter().enumerate() {
            prompt.push_str(&format!(
                "\n### {}. {} (`{}`)\n\n{}\n",
                i + 1,
                skill.name,
                skill.id,
                skill.description
            ));
            if !skill.examples.is_empty() {
                prompt.push_str("\n**Examples:**\n");
                for example in &skill.examples {
                    prompt.push_str(&format!("- {example}\n"));
                }
            }
            if !skill.tags.is_empty() {
                let tags = skill
                    .tags
                    .iter()
                    .map(|t| format!("`{t}`"))
                    .collect::<Vec<_>>()
                    .join(", ");
                prompt.push_str(&format!("\n**Tags:** {tags}\n"));
            }
        }
    }
    prompt.trim().to_string()
}
