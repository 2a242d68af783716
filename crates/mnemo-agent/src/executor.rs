//! The expert executor: runs one expert against a prompt bundle with
//! streaming callbacks, using either the two-phase (plan → retrieve →
//! synthesize) or the ReAct (think → tool → observe) strategy.
//!
//! Handoff is an outgoing typed result: when an expert calls the
//! `report_inability` marker tool, the executor returns
//! [`ExpertOutcome::Handoff`] and the caller decides what to do next.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mnemo_blocks::{BlockEvent, EventType};
use mnemo_context::PromptBundle;
use mnemo_core::cache::TtlCache;
use mnemo_provider::{ChatRequest, LlmProvider, Message, StreamEvent, Usage};
use mnemo_routing::{ExpertConfig, ExpertStrategy};

use crate::error::{AgentError, Result};
use crate::events::{EventCallback, SafeCallback};
use crate::tools::{report_inability_definition, ToolContext, ToolRegistry, ToolResult, REPORT_INABILITY};

/// Characters of tool input/output shown on stream events.
const TOOL_INPUT_PREVIEW_CHARS: usize = 200;
const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub agent_timeout: Duration,
    pub tool_timeout: Duration,
    pub max_rounds: u32,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(45),
            max_rounds: 6,
            cache_max_entries: 256,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// What one expert run produced.
#[derive(Debug, Clone)]
pub enum ExpertOutcome {
    Completed {
        content: String,
        usage: Usage,
        tools_used: Vec<String>,
        tool_ms: u64,
        generation_ms: u64,
    },
    /// The expert cannot serve this request; `ability_needed` describes
    /// what a replacement must be able to do.
    Handoff { ability_needed: String },
}

/// Per-run context handed in by the caller. Cloneable so parallel
/// dispatch can hand each task its own copy.
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub callback: Arc<dyn EventCallback>,
    pub user_id: i64,
}

pub struct ExpertExecutor {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    /// Result cache keyed on (expert, user, normalized input).
    cache: TtlCache<String, String>,
    settings: ExecutorSettings,
}

impl ExpertExecutor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            cache: TtlCache::new(settings.cache_max_entries, settings.cache_ttl),
            settings,
        }
    }

    /// Run one expert under the agent-wide deadline.
    pub async fn run(
        &self,
        expert: &ExpertConfig,
        bundle: &PromptBundle,
        ctx: &RunContext,
    ) -> Result<ExpertOutcome> {
        let cache_key = cache_key(&expert.name, ctx.user_id, &bundle.pending_user);
        if let Some(content) = self.cache.get(&cache_key) {
            debug!(expert = %expert.name, "expert result cache hit");
            ctx.callback
                .emit(BlockEvent::new(EventType::Answer, content.clone()))?;
            return Ok(ExpertOutcome::Completed {
                content,
                usage: Usage::default(),
                tools_used: Vec::new(),
                tool_ms: 0,
                generation_ms: 0,
            });
        }

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            result = tokio::time::timeout(self.settings.agent_timeout, async {
                match expert.strategy {
                    ExpertStrategy::TwoPhase => self.run_two_phase(expert, bundle, ctx).await,
                    ExpertStrategy::React => self.run_react(expert, bundle, ctx).await,
                }
            }) => result.map_err(|_| AgentError::DeadlineExceeded {
                seconds: self.settings.agent_timeout.as_secs(),
            })??,
        };

        if let ExpertOutcome::Completed { content, .. } = &outcome {
            self.cache.insert(cache_key, content.clone());
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Two-phase: plan → parallel retrieval → streamed synthesis
    // ------------------------------------------------------------------

    async fn run_two_phase(
        &self,
        expert: &ExpertConfig,
        bundle: &PromptBundle,
        ctx: &RunContext,
    ) -> Result<ExpertOutcome> {
        let safe = SafeCallback::new(ctx.callback.as_ref());

        // Phase 1: ask the model which tools to run with what input.
        let plan = self.plan_retrieval(expert, bundle).await?;
        safe.emit(BlockEvent::new(EventType::Thinking, plan.analysis.clone()))?;

        // Phase 2: independent tools fan out in parallel. One failing tool
        // does not stop the others; zero usable results is an error.
        let tool_started = Instant::now();
        let mut join_set: JoinSet<(String, ToolResult)> = JoinSet::new();
        for call in &plan.calls {
            let Some(tool) = self.registry.get(&call.tool) else {
                warn!(tool = %call.tool, "planned tool not registered, skipping");
                continue;
            };
            if !expert.tools.contains(&call.tool) {
                warn!(tool = %call.tool, expert = %expert.name, "tool not declared by expert, skipping");
                continue;
            }
            safe.emit(
                BlockEvent::new(EventType::ToolUse, truncate(&call.input.to_string(), TOOL_INPUT_PREVIEW_CHARS))
                    .with_meta(serde_json::json!({ "tool": call.tool })),
            )?;

            let tool_ctx = ToolContext {
                cancel: ctx.cancel.clone(),
                user_id: ctx.user_id,
            };
            let input = call.input.clone();
            let name = call.tool.clone();
            let timeout = self.settings.tool_timeout;
            join_set.spawn(async move {
                let result = match tokio::time::timeout(timeout, tool.execute(&tool_ctx, input)).await
                {
                    Ok(result) => result,
                    Err(_) => ToolResult::error(format!("tool {name} timed out")),
                };
                (name, result)
            });
        }

        let mut tools_used = Vec::new();
        let mut observations: Vec<(String, String)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((name, result)) = joined else {
                warn!("tool task panicked");
                continue;
            };
            safe.emit(
                BlockEvent::new(
                    EventType::ToolResult,
                    truncate(&result.content, TOOL_RESULT_PREVIEW_CHARS),
                )
                .with_meta(serde_json::json!({ "tool": name, "is_error": result.is_error })),
            )?;
            if let Some(event) = result.domain_event.clone() {
                safe.emit(event)?;
            }
            if !result.is_error {
                tools_used.push(name.clone());
                observations.push((name, result.content));
            }
        }
        let tool_ms = tool_started.elapsed().as_millis() as u64;

        if observations.is_empty() && !plan.calls.is_empty() {
            return Err(AgentError::NoUsableToolResults);
        }

        // Phase 3: streamed synthesis over history + evidence + tool output.
        let (system, mut messages) = bundle.to_chat();
        if !observations.is_empty() {
            let mut obs = String::from("Tool results:\n");
            for (name, content) in &observations {
                obs.push_str(&format!("## {name}\n{content}\n"));
            }
            messages.push(Message::user(obs));
        }
        let mut request = ChatRequest::new(&expert.model_config, system, messages);
        request.stream = true;

        let generation_started = Instant::now();
        let (content, usage) = self.stream_answer(request, ctx).await?;
        let generation_ms = generation_started.elapsed().as_millis() as u64;

        Ok(ExpertOutcome::Completed {
            content,
            usage,
            tools_used,
            tool_ms,
            generation_ms,
        })
    }

    async fn plan_retrieval(
        &self,
        expert: &ExpertConfig,
        bundle: &PromptBundle,
    ) -> Result<RetrievalPlan> {
        let tool_list = self
            .registry
            .definitions_for(&expert.tools)
            .into_iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "{}\n\nYou are planning data retrieval. Available tools:\n{}\n\
             Reply with ONLY a JSON object: {{\"analysis\": \"one sentence\", \
             \"tools\": [{{\"tool\": \"name\", \"input\": {{...}}}}]}}. \
             Use at most 3 tools; an empty list is valid when no lookup is needed.",
            expert.system_prompt, tool_list
        );
        let request = ChatRequest::new(
            &expert.model_config,
            system,
            vec![Message::user(bundle.pending_user.clone())],
        );

        let response = self.provider.send(&request).await?;
        match parse_plan(&response.content) {
            Some(plan) => Ok(plan),
            None => {
                // Unparseable plan: degrade to the expert's first tool with
                // the raw query, so retrieval still happens.
                warn!(expert = %expert.name, "retrieval plan unparseable, using fallback");
                let calls = expert
                    .tools
                    .first()
                    .map(|tool| {
                        vec![PlannedCall {
                            tool: tool.clone(),
                            input: serde_json::json!({ "query": bundle.pending_user }),
                        }]
                    })
                    .unwrap_or_default();
                Ok(RetrievalPlan {
                    analysis: "Looking that up.".to_string(),
                    calls,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // ReAct: think → tool → observe, bounded by max_rounds
    // ------------------------------------------------------------------

    async fn run_react(
        &self,
        expert: &ExpertConfig,
        bundle: &PromptBundle,
        ctx: &RunContext,
    ) -> Result<ExpertOutcome> {
        let safe = SafeCallback::new(ctx.callback.as_ref());

        let mut tool_defs = self.registry.definitions_for(&expert.tools);
        tool_defs.push(report_inability_definition());

        let (system, mut messages) = bundle.to_chat();
        let mut usage = Usage::default();
        let mut tools_used = Vec::new();
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut tool_ms = 0u64;
        let mut last_content = String::new();

        for round in 0..self.settings.max_rounds {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let mut request =
                ChatRequest::new(&expert.model_config, system.clone(), messages.clone());
            request.tools = tool_defs.clone();

            let response = self.provider.send(&request).await?;
            usage = add_usage(usage, response.usage);
            last_content = response.content.clone();

            if response.tool_calls.is_empty() {
                info!(expert = %expert.name, round, "react loop complete");
                ctx.callback
                    .emit(BlockEvent::new(EventType::Answer, response.content.clone()))?;
                return Ok(ExpertOutcome::Completed {
                    content: response.content,
                    usage,
                    tools_used,
                    tool_ms,
                    generation_ms: 0,
                });
            }

            if !response.content.is_empty() {
                safe.emit(BlockEvent::new(EventType::Thinking, response.content.clone()))?;
            }
            messages.push(Message::assistant(if response.content.is_empty() {
                format!("Calling {}.", response.tool_calls[0].name)
            } else {
                response.content.clone()
            }));

            for call in &response.tool_calls {
                if call.name == REPORT_INABILITY {
                    let ability = call
                        .input
                        .get("ability_needed")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unspecified ability")
                        .to_string();
                    info!(expert = %expert.name, ability = %ability, "expert reported inability");
                    return Ok(ExpertOutcome::Handoff {
                        ability_needed: ability,
                    });
                }

                safe.emit(
                    BlockEvent::new(
                        EventType::ToolUse,
                        truncate(&call.input.to_string(), TOOL_INPUT_PREVIEW_CHARS),
                    )
                    .with_meta(serde_json::json!({ "tool": call.name })),
                )?;

                let started = Instant::now();
                let tool_ctx = ToolContext {
                    cancel: ctx.cancel.clone(),
                    user_id: ctx.user_id,
                };
                let result = match self.registry.get(&call.name) {
                    Some(tool) => match tokio::time::timeout(
                        self.settings.tool_timeout,
                        tool.execute(&tool_ctx, call.input.clone()),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => ToolResult::error(format!("tool {} timed out", call.name)),
                    },
                    None => ToolResult::error(format!("unknown tool: {}", call.name)),
                };
                tool_ms += started.elapsed().as_millis() as u64;

                safe.emit(
                    BlockEvent::new(
                        EventType::ToolResult,
                        truncate(&result.content, TOOL_RESULT_PREVIEW_CHARS),
                    )
                    .with_meta(serde_json::json!({ "tool": call.name, "is_error": result.is_error })),
                )?;
                if let Some(event) = result.domain_event.clone() {
                    safe.emit(event)?;
                }

                if result.is_error {
                    let count = failures.entry(call.name.clone()).or_insert(0);
                    *count += 1;
                    if *count >= 2 {
                        ctx.callback.emit(BlockEvent::new(
                            EventType::Error,
                            format!("tool {} failed repeatedly", call.name),
                        ))?;
                        return Err(AgentError::ToolRepeatedlyFailed {
                            tool: call.name.clone(),
                        });
                    }
                } else {
                    failures.remove(&call.name);
                    if !tools_used.contains(&call.name) {
                        tools_used.push(call.name.clone());
                    }
                }

                messages.push(Message::user(format!(
                    "Observation from {}: {}",
                    call.name, result.content
                )));
            }
        }

        warn!(
            expert = %expert.name,
            max_rounds = self.settings.max_rounds,
            "react loop hit maximum rounds"
        );
        ctx.callback
            .emit(BlockEvent::new(EventType::Answer, last_content.clone()))?;
        Ok(ExpertOutcome::Completed {
            content: last_content,
            usage,
            tools_used,
            tool_ms,
            generation_ms: 0,
        })
    }

    /// Drive a streaming LLM call, forwarding text deltas as `answer`
    /// events. A failed answer emit is fatal — the client is gone.
    async fn stream_answer(
        &self,
        request: ChatRequest,
        ctx: &RunContext,
    ) -> Result<(String, Usage)> {
        let safe = SafeCallback::new(ctx.callback.as_ref());
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

        let provider = Arc::clone(&self.provider);
        let producer =
            tokio::spawn(async move { provider.send_stream(&request, tx).await });

        let mut content = String::new();
        let mut usage = Usage::default();
        loop {
            let event = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    producer.abort();
                    return Err(AgentError::Cancelled);
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                StreamEvent::TextDelta { text } => {
                    content.push_str(&text);
                    if let Err(e) = ctx.callback.emit(BlockEvent::new(EventType::Answer, text)) {
                        // Client gone: answer delivery is fatal.
                        producer.abort();
                        return Err(e);
                    }
                }
                StreamEvent::Thinking { text } => {
                    safe.emit(BlockEvent::new(EventType::Thinking, text))?;
                }
                StreamEvent::ToolUse { .. } => {
                    // Synthesis calls carry no tools; ignore.
                }
                StreamEvent::Done { usage: u, .. } => {
                    usage = u;
                }
                StreamEvent::Error { message } => {
                    producer.abort();
                    return Err(AgentError::Provider(
                        mnemo_provider::ProviderError::Unavailable(message),
                    ));
                }
            }
        }

        match producer.await {
            Ok(Ok(())) => Ok((content, usage)),
            Ok(Err(e)) => Err(AgentError::Provider(e)),
            Err(_) => Err(AgentError::Provider(
                mnemo_provider::ProviderError::Unavailable("stream task failed".to_string()),
            )),
        }
    }
}

struct PlannedCall {
    tool: String,
    input: serde_json::Value,
}

struct RetrievalPlan {
    analysis: String,
    calls: Vec<PlannedCall>,
}

/// Extract the plan JSON from a model reply that may wrap it in prose or a
/// code fence.
fn parse_plan(raw: &str) -> Option<RetrievalPlan> {
    let trimmed = raw.trim();
    let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    };
    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let analysis = value
        .get("analysis")
        .and_then(|v| v.as_str())
        .unwrap_or("Planning retrieval.")
        .to_string();
    let calls = value
        .get("tools")?
        .as_array()?
        .iter()
        .filter_map(|t| {
            Some(PlannedCall {
                tool: t.get("tool")?.as_str()?.to_string(),
                input: t.get("input").cloned().unwrap_or(serde_json::json!({})),
            })
        })
        .collect();
    Some(RetrievalPlan { analysis, calls })
}

fn cache_key(expert: &str, user_id: i64, input: &str) -> String {
    let normalized = input.trim().to_lowercase();
    format!("{expert}:{user_id}:{normalized}")
}

fn add_usage(a: Usage, b: Usage) -> Usage {
    Usage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cache_read_tokens: a.cache_read_tokens + b.cache_read_tokens,
        cache_write_tokens: a.cache_write_tokens + b.cache_write_tokens,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}
