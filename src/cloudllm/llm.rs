//! The LLM invocation seam the Triager and Planner sit behind.
//!
//! A single-shot `invoke(system, user) -> text` call that neither component
//! needs to know is backed by OpenAI, Claude, Gemini, Grok, or a test fake —
//! the same "depend on a narrow trait at the boundary, let concrete
//! transports live outside the core" shape as
//! [`RemoteAgentClient`](crate::cloudllm::registry::RemoteAgentClient).
//! Triager/Planner outputs are JSON; parsing and the "never raise on
//! malformed JSON, degrade instead" policy lives in the callers
//! (`triager.rs`, `planner.rs`), not here.

use std::error::Error;

use async_trait::async_trait;

/// A single prompt-in, text-out LLM call, implemented per-provider outside
/// this crate (an HTTP client wrapping a chat-completions endpoint, a local
/// model runner, or a test fake).
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn invoke(&self, system_prompt: &str, user_prompt: &str) -> Result<String, Box<dyn Error>>;
}

/// Strips a leading/trailing markdown code fence (` ```json ... ``` ` or
/// plain ` ``` ... ``` `) that chat models routinely wrap JSON in, so callers
/// can feed the result straight to `serde_json::from_str`.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\":1}");
    }

    #[test]
    fn strips_plain_fence() {
        let raw = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\":1}");
    }

    #[test]
    fn passes_through_bare_json() {
        let raw = "{\"a\":1}";
        assert_eq!(strip_code_fence(raw), "{\"a\":1}");
    }
}
