//! Triager (SuperAgent): one LLM call deciding answer-directly vs. handoff,
//! plus the lexical fast-track heuristic the Orchestrator uses to skip it
//! entirely for obviously multi-step queries.

use std::sync::Arc;

use log::warn;
use serde::Deserialize;

use crate::cloudllm::llm::{strip_code_fence, LlmInvoker};
use crate::cloudllm::model::{TriageDecision, TriageOutcome, UserInput};
use crate::cloudllm::registry::RemoteAgentRegistry;

const ENGLISH_KEYWORDS: &[&str] = &[
    "analyze",
    "analysis",
    "compare",
    "vs",
    "versus",
    "recommend",
    "should i",
    "worth",
    "better",
    "invest",
    "investment",
    "ipo",
    "valuation",
    "trend",
    "outlook",
    "performance",
];

const CJK_KEYWORDS: &[&str] = &["分析", "对比", "比较", "推荐", "建议", "值得", "投资", "估值", "趋势", "前景", "表现", "如何", "怎么样"];

/// Lexical "fast-track to Planner" bypass from §4.4. Checked *before* the
/// Triager is ever invoked; when it fires, the Triager is skipped entirely
/// for that turn (the two are mutually exclusive per the Design Notes'
/// resolved open question).
pub fn should_fast_track(input: &UserInput) -> bool {
    if !input.target_agent_name.trim().is_empty() {
        return false;
    }
    let lower = input.query.to_lowercase();

    let english_hits = ENGLISH_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
    if english_hits >= 2 {
        return true;
    }

    let cjk_hits = CJK_KEYWORDS.iter().filter(|kw| input.query.contains(*kw)).count();
    if cjk_hits >= 2 {
        return true;
    }

    lower.contains(" vs. ") || lower.contains("versus") || input.query.contains("对比") || lower.contains("vs")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriageLlmOutput {
    decision: String,
    answer_content: Option<String>,
    enriched_query: Option<String>,
    recommended_agents: Option<Vec<String>>,
    reason: Option<String>,
}

fn degrade(reason: String) -> TriageOutcome {
    warn!("triager: degrading to ANSWER after malformed/unreachable model output: {reason}");
    TriageOutcome {
        decision: TriageDecision::Answer,
        answer_content: Some(format!(
            "I wasn't able to route this request automatically ({reason}). Could you rephrase it?"
        )),
        enriched_query: None,
        recommended_agents: None,
        reason: Some(reason),
    }
}

fn system_prompt(capability_prompt: &str) -> String {
    format!(
        "You are the front-line router for a multi-agent orchestration system. \
         Decide whether the user's query can be answered directly, or whether it must be \
         handed off to one or more specialist agents.\n\n\
         Available specialist agents:\n{capability_prompt}\n\n\
         Respond with STRICT JSON only, matching exactly this shape:\n\
         {{\"decision\": \"answer\" | \"handoff\", \"answerContent\": string|null, \
         \"enrichedQuery\": string|null, \"recommendedAgents\": [string]|null, \"reason\": string|null}}"
    )
}

/// Decides answer-vs-handoff with one LLM call. Grounded in the
/// `SuperAgent`/`core/super_agent/core.py` responsibility named in §4.4:
/// malformed or unreachable model output never propagates as an error, it
/// degrades to `ANSWER` with a diagnostic message.
pub struct Triager {
    llm: Arc<dyn LlmInvoker>,
}

impl Triager {
    pub fn new(llm: Arc<dyn LlmInvoker>) -> Self {
        Self { llm }
    }

    pub async fn triage(&self, input: &UserInput, registry: &RemoteAgentRegistry) -> TriageOutcome {
        let capability_prompt = registry.all_capability_prompts().await;
        let system = system_prompt(&capability_prompt);
        match self.llm.invoke(&system, &input.query).await {
            Ok(raw) => match serde_json::from_str::<TriageLlmOutput>(strip_code_fence(&raw)) {
                Ok(parsed) => {
                    let decision = match parsed.decision.to_lowercase().as_str() {
                        "handoff" | "handoff_to_planner" => TriageDecision::HandoffToPlanner,
                        "answer" => TriageDecision::Answer,
                        other => return degrade(format!("unrecognized decision `{other}`")),
                    };
                    TriageOutcome {
                        decision,
                        answer_content: parsed.answer_content,
                        enriched_query: parsed.enriched_query,
                        recommended_agents: parsed.recommended_agents,
                        reason: parsed.reason,
                    }
                }
                Err(e) => degrade(format!("could not parse triager JSON: {e}")),
            },
            Err(e) => degrade(format!("LLM invocation failed: {e}")),
        }
    }
}
