//! The orchestrator: LLM-driven task decomposition, parallel or sequential
//! expert dispatch with handoff re-routing, and result aggregation.
//!
//! Entered when the router flags ambiguity or when a directly-dispatched
//! expert returns a handoff.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};

use mnemo_blocks::{BlockEvent, EventType};
use mnemo_context::PromptBundle;
use mnemo_provider::{ChatRequest, LlmProvider, Message, Usage};
use mnemo_routing::CapabilityMap;

use crate::error::{AgentError, Result};
use crate::events::{EventCallback, SafeCallback};
use crate::executor::{ExpertExecutor, ExpertOutcome, RunContext};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_tasks: usize,
    pub max_handoffs: u32,
    pub max_task_input_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            max_handoffs: 1,
            max_task_input_chars: 2000,
        }
    }
}

/// One decomposed sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub expert: String,
    pub input: String,
    #[serde(default)]
    pub purpose: String,
}

/// The decomposer's structured plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub analysis: String,
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub aggregate: bool,
}

/// Aggregated outcome of an orchestrated request.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub content: String,
    pub usage: Usage,
    pub tools_used: Vec<String>,
    pub handoffs: u32,
}

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    map: Arc<CapabilityMap>,
    executor: Arc<ExpertExecutor>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        map: Arc<CapabilityMap>,
        executor: Arc<ExpertExecutor>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            map,
            executor,
            settings,
        }
    }

    /// Decompose, dispatch, aggregate. `fallback_expert` is the router's
    /// best guess, used when the plan is invalid or for handoff entry.
    pub async fn run(
        &self,
        fallback_expert: &str,
        message: &str,
        ctx: &RunContext,
    ) -> Result<OrchestrationResult> {
        let safe = SafeCallback::new(ctx.callback.as_ref());

        let plan = self.decompose(message, fallback_expert).await;
        safe.emit(
            BlockEvent::new(
                EventType::Plan,
                serde_json::to_string(&plan).unwrap_or_default(),
            )
            .with_meta(serde_json::json!({ "tasks": plan.tasks.len() })),
        )?;

        // Suppress sub-expert answer streaming when we aggregate afterwards.
        let multi = plan.tasks.len() > 1;
        let aggregate = plan.aggregate && multi;

        let mut results: Vec<TaskResult> = Vec::new();
        if plan.parallel && multi {
            let mut join_set: JoinSet<(usize, Result<TaskResult>)> = JoinSet::new();
            for (i, task) in plan.tasks.iter().enumerate() {
                let this = TaskRunner {
                    executor: Arc::clone(&self.executor),
                    map: Arc::clone(&self.map),
                    max_handoffs: self.settings.max_handoffs,
                };
                let task = task.clone();
                let ctx = task_context(ctx, aggregate);
                join_set.spawn(async move { (i, this.run_task(&task, &ctx).await) });
            }
            let mut ordered: Vec<Option<Result<TaskResult>>> =
                (0..plan.tasks.len()).map(|_| None).collect();
            while let Some(joined) = join_set.join_next().await {
                if let Ok((i, result)) = joined {
                    ordered[i] = Some(result);
                }
            }
            results.extend(ordered.into_iter().flatten().filter_map(|r| match r {
                Ok(res) => Some(res),
                Err(e) => {
                    warn!(err = %e, "orchestrated task failed");
                    None
                }
            }));
        } else {
            for task in &plan.tasks {
                let runner = TaskRunner {
                    executor: Arc::clone(&self.executor),
                    map: Arc::clone(&self.map),
                    max_handoffs: self.settings.max_handoffs,
                };
                let task_ctx = task_context(ctx, aggregate);
                match runner.run_task(task, &task_ctx).await {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(err = %e, expert = %task.expert, "orchestrated task failed"),
                }
            }
        }

        if results.is_empty() {
            return Err(AgentError::NoUsableToolResults);
        }

        let mut usage = Usage::default();
        let mut tools_used = Vec::new();
        let mut handoffs = 0;
        for result in &results {
            usage = add(usage, result.usage);
            handoffs += result.handoffs;
            for tool in &result.tools_used {
                if !tools_used.contains(tool) {
                    tools_used.push(tool.clone());
                }
            }
        }

        // Aggregate ≥2 successes into one fused streamed answer; otherwise
        // the single result already streamed (or streams now via fallback).
        let content = if aggregate && results.len() >= 2 {
            self.aggregate(message, &results, ctx).await?
        } else {
            let combined = results
                .iter()
                .map(|r| r.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            if aggregate {
                // Aggregation was planned but only one task survived; its
                // answer was suppressed, so emit it here.
                ctx.callback
                    .emit(BlockEvent::new(EventType::Answer, combined.clone()))?;
            }
            combined
        };

        Ok(OrchestrationResult {
            content,
            usage,
            tools_used,
            handoffs,
        })
    }

    /// Re-dispatch after a direct expert reported inability. Used by the
    /// handler when no decomposition is wanted.
    pub async fn handoff(
        &self,
        from_expert: &str,
        ability_needed: &str,
        message: &str,
        bundle: &PromptBundle,
        ctx: &RunContext,
    ) -> Result<OrchestrationResult> {
        let runner = TaskRunner {
            executor: Arc::clone(&self.executor),
            map: Arc::clone(&self.map),
            max_handoffs: self.settings.max_handoffs,
        };
        let result = runner
            .redispatch(from_expert, ability_needed, message, Some(bundle), ctx, 1)
            .await?;
        Ok(OrchestrationResult {
            content: result.content,
            usage: result.usage,
            tools_used: result.tools_used,
            handoffs: result.handoffs,
        })
    }

    /// Single LLM call producing the structured plan. Invalid plans fall
    /// back to one task on the best-guessed expert.
    async fn decompose(&self, message: &str, fallback_expert: &str) -> TaskPlan {
        let roster = self
            .map
            .experts()
            .map(|e| format!("- {}: {}", e.name, e.description))
            .collect::<Vec<_>>()
            .join("\n");
        let system = format!(
            "You decompose a user request into expert sub-tasks.\nExperts:\n{roster}\n\
             Reply with ONLY JSON: {{\"analysis\": \"...\", \"tasks\": \
             [{{\"expert\": \"name\", \"input\": \"...\", \"purpose\": \"...\"}}], \
             \"parallel\": true|false, \"aggregate\": true|false}}. \
             Use at most {} tasks.",
            self.settings.max_tasks
        );
        let request = ChatRequest::new(
            &Default::default(),
            system,
            vec![Message::user(message.to_string())],
        );

        let fallback = || TaskPlan {
            analysis: "Single-expert fallback.".to_string(),
            tasks: vec![PlannedTask {
                expert: fallback_expert.to_string(),
                input: message.to_string(),
                purpose: "handle the request".to_string(),
            }],
            parallel: false,
            aggregate: false,
        };

        let response = match self.provider.send(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "decomposition call failed, using fallback plan");
                return fallback();
            }
        };

        match self.parse_and_validate(&response.content) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(err = %e, "invalid plan, using fallback");
                fallback()
            }
        }
    }

    fn parse_and_validate(&self, raw: &str) -> Result<TaskPlan> {
        let trimmed = raw.trim();
        let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
            _ => trimmed,
        };
        let plan: TaskPlan = serde_json::from_str(json_str)
            .map_err(|e| AgentError::InvalidPlan(e.to_string()))?;

        if plan.tasks.is_empty() {
            return Err(AgentError::InvalidPlan("no tasks".to_string()));
        }
        if plan.tasks.len() > self.settings.max_tasks {
            return Err(AgentError::InvalidPlan(format!(
                "{} tasks exceeds the cap of {}",
                plan.tasks.len(),
                self.settings.max_tasks
            )));
        }
        for task in &plan.tasks {
            if self.map.get_expert(&task.expert).is_none() {
                return Err(AgentError::InvalidPlan(format!(
                    "unknown expert: {}",
                    task.expert
                )));
            }
            if task.input.chars().count() > self.settings.max_task_input_chars {
                return Err(AgentError::InvalidPlan(format!(
                    "task input exceeds {} chars",
                    self.settings.max_task_input_chars
                )));
            }
        }
        Ok(plan)
    }

    /// Fuse ≥2 task results into one streamed answer.
    async fn aggregate(
        &self,
        message: &str,
        results: &[TaskResult],
        ctx: &RunContext,
    ) -> Result<String> {
        let mut parts = String::new();
        for result in results {
            parts.push_str(&format!("## {}\n{}\n\n", result.expert, result.content));
        }
        let system = "Fuse the expert findings below into one coherent answer to the \
                      user's request. Do not mention the experts."
            .to_string();
        let mut request = ChatRequest::new(
            &Default::default(),
            system,
            vec![Message::user(format!(
                "Request: {message}\n\nFindings:\n{parts}"
            ))],
        );
        request.stream = true;

        // Stream through the real callback so the client sees the fused
        // answer incrementally.
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let provider = Arc::clone(&self.provider);
        let producer = tokio::spawn(async move { provider.send_stream(&request, tx).await });

        let mut content = String::new();
        loop {
            let event = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    producer.abort();
                    return Err(AgentError::Cancelled);
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            match event {
                mnemo_provider::StreamEvent::TextDelta { text } => {
                    content.push_str(&text);
                    if let Err(e) = ctx.callback.emit(BlockEvent::new(EventType::Answer, text)) {
                        producer.abort();
                        return Err(e);
                    }
                }
                mnemo_provider::StreamEvent::Done { .. } => {}
                mnemo_provider::StreamEvent::Error { message } => {
                    producer.abort();
                    return Err(AgentError::Provider(
                        mnemo_provider::ProviderError::Unavailable(message),
                    ));
                }
                _ => {}
            }
        }
        match producer.await {
            Ok(Ok(())) => Ok(content),
            Ok(Err(e)) => Err(AgentError::Provider(e)),
            Err(_) => Err(AgentError::Provider(
                mnemo_provider::ProviderError::Unavailable("aggregation stream failed".to_string()),
            )),
        }
    }
}

struct TaskResult {
    expert: String,
    content: String,
    usage: Usage,
    tools_used: Vec<String>,
    handoffs: u32,
}

/// Runs one sub-task, following handoffs up to the configured cap.
struct TaskRunner {
    executor: Arc<ExpertExecutor>,
    map: Arc<CapabilityMap>,
    max_handoffs: u32,
}

impl TaskRunner {
    async fn run_task(&self, task: &PlannedTask, ctx: &RunContext) -> Result<TaskResult> {
        let safe = SafeCallback::new(ctx.callback.as_ref());
        safe.emit(
            BlockEvent::new(EventType::TaskStart, task.purpose.clone())
                .with_meta(serde_json::json!({ "expert": task.expert })),
        )?;

        let result = self.execute(&task.expert, &task.input, None, ctx, 0).await;

        safe.emit(
            BlockEvent::new(
                EventType::TaskEnd,
                match &result {
                    Ok(r) => format!("{} finished", r.expert),
                    Err(e) => format!("{} failed: {e}", task.expert),
                },
            )
            .with_meta(serde_json::json!({ "expert": task.expert, "ok": result.is_ok() })),
        )?;
        result
    }

    async fn execute(
        &self,
        expert_name: &str,
        input: &str,
        bundle: Option<&PromptBundle>,
        ctx: &RunContext,
        handoffs_so_far: u32,
    ) -> Result<TaskResult> {
        let expert = self
            .map
            .get_expert(expert_name)
            .ok_or_else(|| AgentError::UnknownExpert {
                name: expert_name.to_string(),
            })?;

        let owned_bundle;
        let bundle = match bundle {
            Some(b) => b,
            None => {
                owned_bundle = task_bundle(&expert.system_prompt, input);
                &owned_bundle
            }
        };

        match self.executor.run(expert, bundle, ctx).await? {
            ExpertOutcome::Completed {
                content,
                usage,
                tools_used,
                ..
            } => Ok(TaskResult {
                expert: expert.name.clone(),
                content,
                usage,
                tools_used,
                handoffs: handoffs_so_far,
            }),
            ExpertOutcome::Handoff { ability_needed } => {
                self.redispatch(
                    expert_name,
                    &ability_needed,
                    input,
                    None,
                    ctx,
                    handoffs_so_far + 1,
                )
                .await
            }
        }
    }

    async fn redispatch(
        &self,
        from_expert: &str,
        ability_needed: &str,
        input: &str,
        bundle: Option<&PromptBundle>,
        ctx: &RunContext,
        handoffs_so_far: u32,
    ) -> Result<TaskResult> {
        let mut from = from_expert.to_string();
        let mut ability = ability_needed.to_string();
        let mut handoffs = handoffs_so_far;
        // The caller-supplied bundle only applies to the first re-dispatch;
        // any further hop rebuilds a minimal one.
        let mut base_bundle = bundle.cloned();

        loop {
            if handoffs > self.max_handoffs {
                return Err(AgentError::NoSuitableExpert { ability });
            }
            let candidates = self.map.find_for_handoff(&ability, &from);
            let Some(alternative) = candidates.first() else {
                return Err(AgentError::NoSuitableExpert { ability });
            };
            info!(from = %from, to = %alternative.name, ability = %ability, "handoff re-dispatch");

            // The replacement gets the same input under its own system prompt.
            let run_bundle = match base_bundle.take() {
                Some(b) => PromptBundle {
                    system_prompt: alternative.system_prompt.clone(),
                    ..b
                },
                None => task_bundle(&alternative.system_prompt, input),
            };

            match self.executor.run(alternative, &run_bundle, ctx).await? {
                ExpertOutcome::Completed {
                    content,
                    usage,
                    tools_used,
                    ..
                } => {
                    return Ok(TaskResult {
                        expert: alternative.name.clone(),
                        content,
                        usage,
                        tools_used,
                        handoffs,
                    });
                }
                ExpertOutcome::Handoff {
                    ability_needed: next_ability,
                } => {
                    from = alternative.name.clone();
                    ability = next_ability;
                    handoffs += 1;
                }
            }
        }
    }
}

/// Minimal bundle for a decomposed sub-task: the expert's own system prompt
/// plus the task input, no shared history.
fn task_bundle(system_prompt: &str, input: &str) -> PromptBundle {
    PromptBundle {
        system_prompt: system_prompt.to_string(),
        history: Vec::new(),
        evidence: Vec::new(),
        episodes: Vec::new(),
        user_prefs: None,
        pending_user: input.to_string(),
        section_tokens: Default::default(),
    }
}

/// Sub-task context: same cancellation, answers optionally buffered.
fn task_context(ctx: &RunContext, suppress_answers: bool) -> RunContext {
    if !suppress_answers {
        return ctx.clone();
    }
    RunContext {
        cancel: ctx.cancel.clone(),
        callback: Arc::new(AnswerSuppressor {
            inner: Arc::clone(&ctx.callback),
        }),
        user_id: ctx.user_id,
    }
}

/// Forwards everything except `answer` events, which the aggregation step
/// replaces with a fused stream.
struct AnswerSuppressor {
    inner: Arc<dyn EventCallback>,
}

impl EventCallback for AnswerSuppressor {
    fn emit(&self, event: BlockEvent) -> Result<()> {
        if event.event_type == EventType::Answer {
            return Ok(());
        }
        self.inner.emit(event)
    }
}

fn add(a: Usage, b: Usage) -> Usage {
    Usage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cache_read_tokens: a.cache_read_tokens + b.cache_read_tokens,
        cache_write_tokens: a.cache_write_tokens + b.cache_write_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MpscCallback;
    use crate::executor::ExecutorSettings;
    use crate::tools::{ToolRegistry, REPORT_INABILITY};
    use async_trait::async_trait;
    use mnemo_provider::{ChatResponse, ProviderError, ToolCall};
    use mnemo_routing::{ExpertConfig, ExpertStrategy, RoutingRules};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Scripted provider keyed by a substring of the system prompt, so the
    /// decomposer, each expert, and the aggregator can be scripted apart.
    struct Routed {
        rules: Mutex<Vec<(String, Vec<ChatResponse>)>>,
    }

    #[async_trait]
    impl LlmProvider for Routed {
        fn name(&self) -> &str {
            "routed"
        }
        async fn send(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            let mut rules = self.rules.lock().unwrap();
            for (needle, responses) in rules.iter_mut() {
                if req.system.contains(needle.as_str()) && !responses.is_empty() {
                    return Ok(responses.remove(0));
                }
            }
            Err(ProviderError::Unavailable("no scripted response".to_string()))
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            model: "test".to_string(),
            usage: Usage::default(),
            stop_reason: "end_turn".to_string(),
            tool_calls: Vec::new(),
        }
    }

    fn inability(ability: &str) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            model: "test".to_string(),
            usage: Usage::default(),
            stop_reason: "tool_use".to_string(),
            tool_calls: vec![ToolCall {
                id: "t".to_string(),
                name: REPORT_INABILITY.to_string(),
                input: serde_json::json!({"ability_needed": ability}),
            }],
        }
    }

    fn expert(name: &str, marker: &str, description: &str) -> ExpertConfig {
        ExpertConfig {
            name: name.to_string(),
            display_name: name.to_string(),
            description: description.to_string(),
            capabilities: vec![description.to_string()],
            strategy: ExpertStrategy::React,
            system_prompt: format!("You are the {marker} expert."),
            tools: Vec::new(),
            routing: RoutingRules::default(),
            model_config: Default::default(),
        }
    }

    fn setup(rules: Vec<(&str, Vec<ChatResponse>)>) -> (Orchestrator, RunContext, tokio::sync::mpsc::UnboundedReceiver<BlockEvent>) {
        let provider: Arc<dyn LlmProvider> = Arc::new(Routed {
            rules: Mutex::new(
                rules
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
        });
        let map = Arc::new(
            CapabilityMap::from_configs(vec![
                expert("memo", "memo", "memo search and notes"),
                expert("schedule", "schedule", "schedule lookup and calendar"),
            ])
            .unwrap(),
        );
        let executor = Arc::new(ExpertExecutor::new(
            Arc::clone(&provider),
            Arc::new(ToolRegistry::new()),
            ExecutorSettings::default(),
        ));
        let orchestrator = Orchestrator::new(
            provider,
            map,
            executor,
            OrchestratorSettings::default(),
        );
        let (callback, rx) = MpscCallback::channel();
        let ctx = RunContext {
            cancel: CancellationToken::new(),
            callback: Arc::new(callback),
            user_id: 42,
        };
        (orchestrator, ctx, rx)
    }

    #[tokio::test]
    async fn parallel_plan_dispatches_both_experts_and_aggregates() {
        let plan = r#"{"analysis": "two parts", "tasks": [
            {"expert": "schedule", "input": "today's schedule", "purpose": "schedule"},
            {"expert": "memo", "input": "related notes", "purpose": "notes"}],
            "parallel": true, "aggregate": true}"#;
        let (orch, ctx, mut rx) = setup(vec![
            ("decompose a user request", vec![text(plan)]),
            ("schedule expert", vec![text("three meetings")]),
            ("memo expert", vec![text("two notes")]),
            ("Fuse the expert findings", vec![text("Your day: three meetings, two notes.")]),
        ]);

        let result = orch.run("memo", "show today's schedule and related notes", &ctx)
            .await
            .unwrap();
        assert_eq!(result.content, "Your day: three meetings, two notes.");

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types[0], EventType::Plan);
        assert_eq!(
            types.iter().filter(|t| **t == EventType::TaskStart).count(),
            2
        );
        assert_eq!(
            types.iter().filter(|t| **t == EventType::TaskEnd).count(),
            2
        );
        // Only the fused answer streams; sub-answers are suppressed.
        assert_eq!(
            types.iter().filter(|t| **t == EventType::Answer).count(),
            1
        );
    }

    #[tokio::test]
    async fn invalid_plan_falls_back_to_single_task() {
        let (orch, ctx, mut rx) = setup(vec![
            ("decompose a user request", vec![text("not json at all")]),
            ("memo expert", vec![text("fallback answer")]),
        ]);

        let result = orch.run("memo", "do something", &ctx).await.unwrap();
        assert_eq!(result.content, "fallback answer");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, EventType::Plan);
        assert!(first.content.contains("fallback"));
    }

    #[tokio::test]
    async fn handoff_redispatches_to_capable_expert() {
        let plan = r#"{"analysis": "one", "tasks": [
            {"expert": "schedule", "input": "search today's notes", "purpose": "lookup"}],
            "parallel": false, "aggregate": false}"#;
        let (orch, ctx, _rx) = setup(vec![
            ("decompose a user request", vec![text(plan)]),
            ("schedule expert", vec![inability("memo search")]),
            ("memo expert", vec![text("found the notes")]),
        ]);

        let result = orch.run("schedule", "search today's notes", &ctx).await.unwrap();
        assert_eq!(result.content, "found the notes");
        assert_eq!(result.handoffs, 1);
    }

    #[tokio::test]
    async fn handoff_without_alternative_fails_all_tasks() {
        let plan = r#"{"analysis": "one", "tasks": [
            {"expert": "schedule", "input": "forecast tomorrow", "purpose": "weather"}],
            "parallel": false, "aggregate": false}"#;
        let (orch, ctx, _rx) = setup(vec![
            ("decompose a user request", vec![text(plan)]),
            ("schedule expert", vec![inability("weather forecasting")]),
        ]);

        assert!(orch.run("schedule", "forecast tomorrow", &ctx).await.is_err());
    }

    #[tokio::test]
    async fn handoff_entry_point_works_without_a_plan() {
        let (orch, ctx, _rx) = setup(vec![("memo expert", vec![text("memo answer")])]);
        let bundle = task_bundle("original system", "search today's notes");
        let result = orch
            .handoff("schedule", "memo search", "search today's notes", &bundle, &ctx)
            .await
            .unwrap();
        assert_eq!(result.content, "memo answer");
        assert_eq!(result.handoffs, 1);
    }
}
