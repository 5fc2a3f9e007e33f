//! Planner: produces a validated task DAG from a user query, with a
//! deterministic non-LLM path for Triager-recommended multi-agent routing,
//! a scheduling-confirmation gate for recurring tasks, and a hard-coded
//! fallback for single-task investment queries.

use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;

use crate::cloudllm::llm::{strip_code_fence, LlmInvoker};
use crate::cloudllm::model::{is_valid_dag, new_id, ExecutionPlan, ScheduleConfig, Task, TaskPattern, TaskStatus, TriageOutcome, UserInput};
use crate::cloudllm::registry::RemoteAgentRegistry;
use crate::cloudllm::triager::should_fast_track;

const CONFIRMATION_TOKENS: &[&str] = &["yes", "ok", "okay", "confirm", "确认", "好", "可以"];

fn has_confirmation_token(query: &str) -> bool {
    let lower = query.to_lowercase();
    CONFIRMATION_TOKENS.iter().any(|token| lower.contains(token) || query.contains(token))
}

fn parse_hhmm(s: &str) -> Option<String> {
    let token: String = s.chars().take_while(|c| c.is_ascii_digit() || *c == ':').collect();
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let hour: u32 = parts[0].parse().ok()?;
    let minute: u32 = parts[1].parse().ok()?;
    if hour < 24 && minute < 60 {
        Some(format!("{hour:02}:{minute:02}"))
    } else {
        None
    }
}

/// Detects an explicit "every N minutes" / "daily at HH:MM" schedule
/// literally present in the query (§4.5 step 5); used to gate recurring
/// tasks behind a confirmation turn rather than invoking the LLM to decide.
fn detect_explicit_schedule(query: &str) -> Option<ScheduleConfig> {
    let lower = query.to_lowercase();

    if let Some(idx) = lower.find("every ") {
        let rest = &lower[idx + "every ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            if let Ok(n) = digits.parse::<u32>() {
                let after = rest[digits.len()..].trim_start();
                if after.starts_with("minute") || after.starts_with("min") {
                    return Some(ScheduleConfig::IntervalMinutes { interval_minutes: n });
                }
            }
        }
    }

    if let Some(idx) = lower.find("daily at ") {
        if let Some(time) = parse_hhmm(&lower[idx + "daily at ".len()..]) {
            return Some(ScheduleConfig::DailyTime { daily_time: time });
        }
    }
    if let Some(idx) = lower.find(" at ") {
        if let Some(time) = parse_hhmm(&lower[idx + " at ".len()..]) {
            return Some(ScheduleConfig::DailyTime { daily_time: time });
        }
    }
    None
}

fn describe_schedule(schedule: &ScheduleConfig) -> String {
    match schedule {
        ScheduleConfig::IntervalMinutes { interval_minutes } => format!("every {interval_minutes} minutes"),
        ScheduleConfig::DailyTime { daily_time } => format!("daily at {daily_time}"),
    }
}

/// Recognized as a terminal "consumes other agents' output" node. The
/// source names a single concrete agent ("StrategyAgent"); this
/// implementation generalizes to "any agent whose name suggests
/// synthesis", matching the Design Notes' framing ("StrategyAgent"-like).
fn is_synthesis_class(agent_name: &str) -> bool {
    agent_name.to_lowercase().contains("strategy")
}

fn investment_analysis_like(query: &str) -> bool {
    let lower = query.to_lowercase();
    ["invest", "investment", "valuation", "ipo", "stock", "should i buy"]
        .iter()
        .any(|kw| lower.contains(kw))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleConfigWire {
    interval_minutes: Option<u32>,
    daily_time: Option<String>,
}

impl ScheduleConfigWire {
    fn into_schedule(self) -> Option<ScheduleConfig> {
        match (self.interval_minutes, self.daily_time) {
            (Some(n), None) => Some(ScheduleConfig::IntervalMinutes { interval_minutes: n }),
            (None, Some(t)) => Some(ScheduleConfig::DailyTime { daily_time: t }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerTaskWire {
    task_id: Option<String>,
    title: String,
    query: String,
    agent_name: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    schedule_config: Option<ScheduleConfigWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerLlmOutput {
    tasks: Vec<PlannerTaskWire>,
    adequate: bool,
    reason: Option<String>,
    guidance_message: Option<String>,
}

/// Produces an [`ExecutionPlan`] from a user query. Grounded in
/// `core/planner/core.py`'s `Planner.plan(...)`.
pub struct Planner {
    llm: Arc<dyn LlmInvoker>,
    /// Policy toggle for the "single-task investment query" fallback
    /// substitution (§4.5 step 6 / Design Notes open question), default on.
    pub suggest_multi_agent_fallback: bool,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmInvoker>) -> Self {
        Self {
            llm,
            suggest_multi_agent_fallback: true,
        }
    }

    pub fn with_multi_agent_fallback(mut self, enabled: bool) -> Self {
        self.suggest_multi_agent_fallback = enabled;
        self
    }

    fn blank_plan(&self, input: &UserInput) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: new_id("plan"),
            conversation_id: input.meta.conversation_id.clone(),
            user_id: input.meta.user_id.clone(),
            orig_query: input.query.clone(),
            tasks: vec![],
            guidance_message: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_task(&self, input: &UserInput, thread_id: &str, agent_name: &str, title: &str, query: &str, depends_on: Vec<String>, schedule: Option<ScheduleConfig>) -> Task {
        Task {
            task_id: new_id("task"),
            conversation_id: input.meta.conversation_id.clone(),
            thread_id: thread_id.to_string(),
            user_id: input.meta.user_id.clone(),
            agent_name: agent_name.to_string(),
            status: TaskStatus::Pending,
            title: title.to_string(),
            query: query.to_string(),
            pattern: if schedule.is_some() { TaskPattern::Recurring } else { TaskPattern::Once },
            schedule_config: schedule,
            depends_on,
            remote_task_ids: vec![],
            handoff_from_super_agent: true,
            super_agent_conversation_id: Some(input.meta.conversation_id.clone()),
            created_at: chrono::Utc::now(),
        }
    }

    /// Step 1: skip the LLM entirely when the Triager already recommended
    /// ≥2 agents. Every non-synthesis agent becomes an independent task;
    /// any synthesis-class agent depends on all of them. A reliability
    /// guarantee, not an optimization — this path must never call the LLM.
    fn deterministic_plan(&self, input: &UserInput, thread_id: &str, agents: &[String]) -> ExecutionPlan {
        let (synthesis, independent): (Vec<&String>, Vec<&String>) = agents.iter().partition(|a| is_synthesis_class(a));

        let mut tasks = Vec::new();
        let mut independent_ids = Vec::new();
        for agent in &independent {
            let task = self.new_task(input, thread_id, agent, &input.query, &input.query, vec![], None);
            independent_ids.push(task.task_id.clone());
            tasks.push(task);
        }
        for agent in &synthesis {
            tasks.push(self.new_task(input, thread_id, agent, &input.query, &input.query, independent_ids.clone(), None));
        }

        let mut plan = self.blank_plan(input);
        plan.tasks = tasks;
        plan
    }

    fn fallback_three_agent_plan(&self, input: &UserInput, thread_id: &str) -> ExecutionPlan {
        let research = self.new_task(input, thread_id, "ResearchAgent", &input.query, &input.query, vec![], None);
        let news = self.new_task(input, thread_id, "NewsAgent", &input.query, &input.query, vec![], None);
        let strategy = self.new_task(
            input,
            thread_id,
            "StrategyAgent",
            &input.query,
            &input.query,
            vec![research.task_id.clone(), news.task_id.clone()],
            None,
        );
        let mut plan = self.blank_plan(input);
        plan.tasks = vec![research, news, strategy];
        plan
    }

    fn validate(&self, tasks: &[Task], registry: &RemoteAgentRegistry) -> Result<(), String> {
        for task in tasks {
            if !registry.contains(&task.agent_name) {
                return Err(format!("unknown agent `{}`", task.agent_name));
            }
            if task.title.trim().is_empty() || task.query.trim().is_empty() {
                return Err(format!("task `{}` has an empty title or query", task.task_id));
            }
            if task.pattern == TaskPattern::Recurring && task.schedule_config.is_none() {
                return Err(format!("recurring task `{}` is missing a scheduleConfig", task.task_id));
            }
        }
        if !is_valid_dag(tasks) {
            return Err("task dependencies do not form a DAG".to_string());
        }
        Ok(())
    }

    fn from_wire(&self, input: &UserInput, thread_id: &str, wire: PlannerTaskWire) -> Task {
        let schedule = wire.schedule_config.and_then(ScheduleConfigWire::into_schedule);
        let pattern = match wire.pattern.as_deref() {
            Some("recurring") | Some("RECURRING") => TaskPattern::Recurring,
            _ if schedule.is_some() => TaskPattern::Recurring,
            _ => TaskPattern::Once,
        };
        Task {
            task_id: wire.task_id.unwrap_or_else(|| new_id("task")),
            conversation_id: input.meta.conversation_id.clone(),
            thread_id: thread_id.to_string(),
            user_id: input.meta.user_id.clone(),
            agent_name: wire.agent_name,
            status: TaskStatus::Pending,
            title: wire.title,
            query: wire.query,
            pattern,
            schedule_config: schedule,
            depends_on: wire.depends_on,
            remote_task_ids: vec![],
            handoff_from_super_agent: true,
            super_agent_conversation_id: Some(input.meta.conversation_id.clone()),
            created_at: chrono::Utc::now(),
        }
    }

    /// Produces an [`ExecutionPlan`] for `input` on `thread_id` (the thread
    /// the Orchestrator opened for this turn — every task in the resulting
    /// plan shares it). `triage` carries the Triager's (possibly skipped,
    /// in the fast-track case) outcome; callers fast-tracking past the
    /// Triager pass a [`TriageOutcome`] with `recommended_agents: None`.
    pub async fn plan(&self, input: &UserInput, thread_id: &str, triage: &TriageOutcome, registry: &RemoteAgentRegistry) -> ExecutionPlan {
        if let Some(agents) = &triage.recommended_agents {
            if agents.len() >= 2 {
                info!("planner: building deterministic plan for {} recommended agents", agents.len());
                return self.deterministic_plan(input, thread_id, agents);
            }
        }

        if let Some(schedule) = detect_explicit_schedule(&input.query) {
            if !has_confirmation_token(&input.query) {
                let mut plan = self.blank_plan(input);
                plan.guidance_message = Some(format!("Please confirm: {}", describe_schedule(&schedule)));
                return plan;
            }
            let agent_name = triage
                .recommended_agents
                .as_ref()
                .and_then(|v| v.first().cloned())
                .or_else(|| registry.agent_names().into_iter().next())
                .unwrap_or_else(|| "NewsAgent".to_string());
            let task = self.new_task(input, thread_id, &agent_name, &input.query, &input.query, vec![], Some(schedule));
            let mut plan = self.blank_plan(input);
            plan.tasks = vec![task];
            return plan;
        }

        let capability_prompt = registry.all_capability_prompts().await;
        let system = format!(
            "You are the task planner for a multi-agent orchestration system. Decompose the user's \
             query into a directed acyclic graph of tasks, each delegated to exactly one specialist \
             agent. Today's date/time is {}.\n\n\
             Available specialist agents:\n{capability_prompt}\n\n\
             Respond with STRICT JSON only, matching exactly this shape:\n\
             {{\"tasks\": [{{\"taskId\": string, \"title\": string, \"query\": string, \"agentName\": string, \
             \"pattern\": \"once\"|\"recurring\", \"dependsOn\": [string], \"scheduleConfig\": {{\"intervalMinutes\": number}}|{{\"dailyTime\": string}}|null}}], \
             \"adequate\": bool, \"reason\": string|null, \"guidanceMessage\": string|null}}",
            chrono::Utc::now().to_rfc3339(),
        );

        let raw = match self.llm.invoke(&system, &input.query).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("planner: LLM invocation failed: {e}");
                let mut plan = self.blank_plan(input);
                plan.guidance_message = Some(format!("I couldn't build a plan for this request: {e}"));
                return plan;
            }
        };

        let parsed: PlannerLlmOutput = match serde_json::from_str(strip_code_fence(&raw)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("planner: malformed LLM output: {e}");
                let mut plan = self.blank_plan(input);
                plan.guidance_message = Some(format!("The planner produced malformed output: {e}"));
                return plan;
            }
        };

        if !parsed.adequate || parsed.tasks.is_empty() {
            let mut plan = self.blank_plan(input);
            plan.guidance_message = parsed
                .guidance_message
                .or(parsed.reason)
                .or_else(|| Some("I need more information to plan this request.".to_string()));
            return plan;
        }

        let mut tasks: Vec<Task> = parsed.tasks.into_iter().map(|t| self.from_wire(input, thread_id, t)).collect();

        if let Err(reason) = self.validate(&tasks, registry) {
            warn!("planner: plan failed validation: {reason}");
            let mut plan = self.blank_plan(input);
            plan.guidance_message = Some(format!("Plan validation failed: {reason}"));
            return plan;
        }

        if self.suggest_multi_agent_fallback
            && input.target_agent_name.trim().is_empty()
            && tasks.len() == 1
            && should_fast_track(input)
            && investment_analysis_like(&input.query)
        {
            info!("planner: substituting hard-coded 3-agent fallback for single-task investment query");
            return self.fallback_three_agent_plan(input, thread_id);
        }

        let mut plan = self.blank_plan(input);
        tasks.sort_by(|a, b| a.depends_on.len().cmp(&b.depends_on.len()));
        plan.tasks = tasks;
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::model::{TriageDecision, UserInputMeta};
    use crate::cloudllm::registry::{CapabilityCard, RemoteAgentClient, RemoteEventStream};
    use async_trait::async_trait;
    use std::error::Error;

    struct FakeLlm(String);

    #[async_trait]
    impl LlmInvoker for FakeLlm {
        async fn invoke(&self, _system: &str, _user: &str) -> Result<String, Box<dyn Error>> {
            Ok(self.0.clone())
        }
    }

    struct FakeClient;

    #[async_trait]
    impl RemoteAgentClient for FakeClient {
        async fn send_message(&self, _query: &str, _conversation_id: &str, _metadata: serde_json::Value) -> crate::cloudllm::error::OrchestratorResult<RemoteEventStream> {
            unimplemented!()
        }
        async fn get_card(&self) -> crate::cloudllm::error::OrchestratorResult<CapabilityCard> {
            Ok(CapabilityCard {
                name: "Agent".into(),
                description: "desc".into(),
                skills: vec![],
            })
        }
    }

    fn registry_with(agents: &[&str]) -> RemoteAgentRegistry {
        let mut r = RemoteAgentRegistry::new();
        for a in agents {
            r.register(*a, Arc::new(FakeClient));
        }
        r
    }

    fn input(query: &str) -> UserInput {
        UserInput {
            query: query.to_string(),
            target_agent_name: String::new(),
            meta: UserInputMeta {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
            },
        }
    }

    fn triage_with_agents(agents: Vec<String>) -> TriageOutcome {
        TriageOutcome {
            decision: TriageDecision::HandoffToPlanner,
            answer_content: None,
            enriched_query: None,
            recommended_agents: Some(agents),
            reason: None,
        }
    }

    fn no_recommendation_triage() -> TriageOutcome {
        TriageOutcome {
            decision: TriageDecision::HandoffToPlanner,
            answer_content: None,
            enriched_query: None,
            recommended_agents: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn deterministic_plan_never_touches_llm_and_orders_synthesis_last() {
        struct PanicLlm;
        #[async_trait]
        impl LlmInvoker for PanicLlm {
            async fn invoke(&self, _: &str, _: &str) -> Result<String, Box<dyn Error>> {
                panic!("deterministic path must not call the LLM");
            }
        }
        let planner = Planner::new(Arc::new(PanicLlm));
        let registry = registry_with(&["ResearchAgent", "NewsAgent", "StrategyAgent"]);
        let triage = triage_with_agents(vec!["ResearchAgent".into(), "NewsAgent".into(), "StrategyAgent".into()]);
        let plan = planner.plan(&input("Should I invest in OpenAI?"), "thread1", &triage, &registry).await;

        assert_eq!(plan.tasks.len(), 3);
        let strategy = plan.tasks.iter().find(|t| t.agent_name == "StrategyAgent").unwrap();
        assert_eq!(strategy.depends_on.len(), 2);
        for t in plan.tasks.iter().filter(|t| t.agent_name != "StrategyAgent") {
            assert!(t.depends_on.is_empty());
        }
    }

    #[tokio::test]
    async fn unconfirmed_schedule_requests_confirmation() {
        let planner = Planner::new(Arc::new(FakeLlm("{}".into())));
        let registry = registry_with(&["NewsAgent"]);
        let triage = no_recommendation_triage();
        let plan = planner.plan(&input("Monitor Apple earnings daily at 09:00"), "thread1", &triage, &registry).await;
        assert!(plan.needs_user_input());
        assert!(plan.guidance_message.unwrap().contains("09:00"));
    }

    #[tokio::test]
    async fn confirmed_schedule_produces_recurring_task() {
        let planner = Planner::new(Arc::new(FakeLlm("{}".into())));
        let registry = registry_with(&["NewsAgent"]);
        let triage = triage_with_agents(vec!["NewsAgent".into()]);
        let plan = planner
            .plan(&input("yes, monitor Apple earnings daily at 09:00"), "thread1", &triage, &registry)
            .await;
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].pattern, TaskPattern::Recurring);
        assert_eq!(plan.tasks[0].schedule_config, Some(ScheduleConfig::DailyTime { daily_time: "09:00".into() }));
    }

    #[tokio::test]
    async fn malformed_llm_output_yields_guidance_message() {
        let planner = Planner::new(Arc::new(FakeLlm("not json".into())));
        let registry = registry_with(&["NewsAgent"]);
        let triage = no_recommendation_triage();
        let plan = planner.plan(&input("Tell me something obscure"), "thread1", &triage, &registry).await;
        assert!(plan.needs_user_input());
    }

    #[tokio::test]
    async fn unknown_agent_in_llm_output_fails_validation() {
        let body = serde_json::json!({
            "tasks": [{"taskId": "t1", "title": "x", "query": "x", "agentName": "GhostAgent", "pattern": "once", "dependsOn": []}],
            "adequate": true,
        });
        let planner = Planner::new(Arc::new(FakeLlm(body.to_string())));
        let registry = registry_with(&["NewsAgent"]);
        let triage = no_recommendation_triage();
        let plan = planner.plan(&input("Do a thing"), "thread1", &triage, &registry).await;
        assert!(plan.needs_user_input());
    }
}
