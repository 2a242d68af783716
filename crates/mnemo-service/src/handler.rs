//! The chat handler: one entry point per incoming chat, driving
//! router → (expert | orchestrator) → stream adapter while the block store
//! persists the transcript.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mnemo_agent::executor::{ExecutorSettings, ExpertExecutor, ExpertOutcome, RunContext};
use mnemo_agent::orchestrator::{Orchestrator, OrchestratorSettings};
use mnemo_agent::summarizer::maybe_summarize;
use mnemo_agent::title::spawn_title_generation;
use mnemo_agent::tools::ToolRegistry;
use mnemo_agent::{AgentError, EventCallback, MpscCallback};
use mnemo_blocks::{
    Block, BlockEvent, BlockMode, BlockStore, BlockType, EventType, SessionStats, UserInput,
};
use mnemo_context::{BuildInput, ContextBuilder, ContextError, EpisodicMemory};
use mnemo_core::config::{MnemoConfig, SummarizerConfig, MAX_MESSAGE_CHARS, SEPARATOR_COMMAND};
use mnemo_core::error::MnemoError;
use mnemo_core::types::{BlockId, ConversationId, UserId};
use mnemo_provider::{LlmProvider, Usage};
use mnemo_routing::{CapabilityMap, Router, RouterSettings, RoutingDecision, StickyManager};

use crate::cost::CostAccountant;
use crate::ratelimit::RateLimiter;
use crate::stream::{StreamAdapter, StreamFrame};

/// One incoming chat request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct ChatRequestIn {
    pub user_id: i64,
    /// Explicit conversation, or None for the user's reserved default.
    pub conversation_id: Option<i64>,
    /// Selects which reserved default conversation when none is given.
    pub agent_offset: u8,
    pub message: String,
    pub mode: BlockMode,
}

/// Assembles a [`ChatService`] from its collaborators.
pub struct ChatServiceBuilder {
    config: MnemoConfig,
    store: Arc<BlockStore>,
    sticky: Arc<StickyManager>,
    map: Arc<CapabilityMap>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    cost: Arc<CostAccountant>,
    episodic: Option<Arc<dyn EpisodicMemory>>,
}

impl ChatServiceBuilder {
    pub fn new(
        config: MnemoConfig,
        store: Arc<BlockStore>,
        sticky: Arc<StickyManager>,
        map: Arc<CapabilityMap>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        cost: Arc<CostAccountant>,
    ) -> Self {
        Self {
            config,
            store,
            sticky,
            map,
            provider,
            registry,
            cost,
            episodic: None,
        }
    }

    pub fn with_episodic(mut self, episodic: Arc<dyn EpisodicMemory>) -> Self {
        self.episodic = Some(episodic);
        self
    }

    pub fn build(self) -> ChatService {
        let router = Router::new(
            Arc::clone(&self.map),
            Arc::clone(&self.sticky),
            RouterSettings {
                cache_ttl: Duration::from_secs(self.config.router.cache_ttl_seconds),
                cache_max_entries: self.config.router.cache_max_entries,
                ..RouterSettings::default()
            },
        );
        let executor = Arc::new(ExpertExecutor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            ExecutorSettings {
                agent_timeout: Duration::from_secs(self.config.agent.timeout_seconds),
                tool_timeout: Duration::from_secs(self.config.agent.tool_timeout_seconds),
                max_rounds: self.config.agent.max_rounds,
                cache_max_entries: self.config.cache.expert_max_entries,
                cache_ttl: Duration::from_secs(self.config.cache.expert_ttl_seconds),
            },
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.map),
            Arc::clone(&executor),
            OrchestratorSettings {
                max_tasks: self.config.orchestrator.max_tasks,
                max_handoffs: self.config.orchestrator.max_handoffs,
                max_task_input_chars: self.config.orchestrator.max_task_input_chars,
            },
        );
        let context_builder = ContextBuilder::new(&self.config.context, &self.config.summarizer);
        let rate_limiter = RateLimiter::new(&self.config.rate_limit);

        ChatService {
            summarizer_config: self.config.summarizer.clone(),
            store: self.store,
            sticky: self.sticky,
            map: self.map,
            router,
            executor,
            orchestrator,
            context_builder,
            episodic: self.episodic,
            rate_limiter,
            cost: self.cost,
            provider: self.provider,
            active: DashMap::new(),
            draining: AtomicBool::new(false),
        }
    }
}

/// Process-wide chat service. All shared state is owned here with explicit
/// lifecycle: constructed at startup, drained at shutdown.
pub struct ChatService {
    summarizer_config: SummarizerConfig,
    store: Arc<BlockStore>,
    sticky: Arc<StickyManager>,
    map: Arc<CapabilityMap>,
    router: Router,
    executor: Arc<ExpertExecutor>,
    orchestrator: Orchestrator,
    context_builder: ContextBuilder,
    episodic: Option<Arc<dyn EpisodicMemory>>,
    rate_limiter: RateLimiter,
    cost: Arc<CostAccountant>,
    provider: Arc<dyn LlmProvider>,
    /// In-flight requests by block id, for cancellation and drain.
    active: DashMap<String, CancellationToken>,
    draining: AtomicBool,
}

impl ChatService {
    /// Handle one chat request, streaming frames into `out`.
    ///
    /// Pre-block failures (validation, rate limit, budget) return an error
    /// directly; once a block exists, failures are recorded on the block
    /// and surfaced as an error frame, and the typed error is still
    /// returned for the transport.
    pub async fn handle_chat(
        &self,
        request: ChatRequestIn,
        out: mpsc::UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<BlockId, MnemoError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(MnemoError::Internal("service is shutting down".to_string()));
        }

        let user_id = UserId(request.user_id);
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(MnemoError::InvalidInput("message is empty".to_string()));
        }
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(MnemoError::InvalidInput(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        self.rate_limiter.try_acquire(user_id)?;
        self.cost.check_budget(user_id)?;

        let conversation = match request.conversation_id {
            Some(id) => self
                .store
                .get_conversation(ConversationId(id))
                .map_err(block_err)?
                .ok_or_else(|| MnemoError::InvalidInput(format!("unknown conversation: {id}")))?,
            None => self
                .store
                .get_or_create_fixed(user_id, request.agent_offset, "assistant")
                .map_err(block_err)?,
        };

        // "---" inserts a context separator instead of chatting.
        if message == SEPARATOR_COMMAND {
            let block = self
                .store
                .create_separator(conversation.id)
                .map_err(block_err)?;
            let _ = out.send(StreamFrame {
                event_type: EventType::SessionStats.as_str().to_string(),
                event_data: String::new(),
                event_meta: None,
                done: true,
                block_summary: Some(serde_json::json!({ "block_id": block.id.as_str() })),
            });
            return Ok(block.id);
        }

        let block = self
            .store
            .create_block(
                conversation.id,
                BlockType::Message,
                request.mode,
                vec![UserInput::new(message.clone())],
            )
            .map_err(block_err)?;

        self.active.insert(block.id.to_string(), cancel.clone());
        let result = self
            .run_block(user_id, conversation.id, &block, &message, out, cancel)
            .await;
        self.active.remove(block.id.as_str());
        result.map(|_| block.id)
    }

    async fn run_block(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        block: &Block,
        message: &str,
        out: mpsc::UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) -> Result<(), MnemoError> {
        let started = Instant::now();

        // Event pump: executor events → outbound frames + batched persists.
        let (callback, mut rx) = MpscCallback::channel();
        let mut adapter = StreamAdapter::new(out, Arc::clone(&self.store), block.id.clone());
        let pump_cancel = cancel.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !adapter.handle(event) {
                    // Client went away: stop producing.
                    pump_cancel.cancel();
                }
            }
            adapter
        });

        let callback: Arc<dyn EventCallback> = Arc::new(callback);
        let _ = callback.emit(BlockEvent::new(EventType::UserMessage, message.to_string()));

        let decision = self
            .router
            .route(user_id, conversation_id, message)
            .map_err(|e| MnemoError::Internal(e.to_string()))?;
        info!(
            expert = %decision.expert,
            intent = %decision.intent,
            confidence = decision.confidence,
            orchestrate = decision.needs_orchestration,
            "routed"
        );

        let ctx = RunContext {
            cancel: cancel.clone(),
            callback: Arc::clone(&callback),
            user_id: user_id.as_i64(),
        };
        let outcome = self.execute(&decision, conversation_id, message, &ctx).await;

        // Closing the callback ends the pump; collect the adapter back.
        drop(ctx);
        drop(callback);
        let adapter = pump
            .await
            .map_err(|_| MnemoError::Internal("event pump failed".to_string()))?;

        match outcome {
            Ok(execution) => {
                self.finish_block(
                    adapter, block, user_id, conversation_id, &decision, execution, started,
                    message,
                )
            }
            Err(error) => {
                let reason = if matches!(error, MnemoError::Cancelled) {
                    "cancelled".to_string()
                } else {
                    error.to_string()
                };
                warn!(block = %block.id, err = %reason, "chat failed");

                let mut adapter = adapter;
                if !matches!(error, MnemoError::Cancelled) {
                    adapter.handle(
                        BlockEvent::new(EventType::Error, reason.clone())
                            .with_meta(serde_json::json!({ "code": error.code() })),
                    );
                }
                // On cancellation the stream just ends without further
                // frames; either way the block records the failure.
                let _ = adapter.abort();
                let partial_stats = SessionStats {
                    total_ms: started.elapsed().as_millis() as u64,
                    had_error: true,
                    model: Some(decision.model_config.model.clone()),
                    ..SessionStats::default()
                };
                let _ = self.store.mark_error(
                    &block.id,
                    BlockEvent::new(EventType::Error, reason),
                    partial_stats,
                );
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_block(
        &self,
        adapter: StreamAdapter,
        block: &Block,
        user_id: UserId,
        conversation_id: ConversationId,
        decision: &RoutingDecision,
        execution: Execution,
        started: Instant,
        message: &str,
    ) -> Result<(), MnemoError> {
        let mut adapter = adapter;
        let mut stats = SessionStats {
            input_tokens: execution.usage.input_tokens,
            output_tokens: execution.usage.output_tokens,
            cache_read_tokens: execution.usage.cache_read_tokens,
            cache_write_tokens: execution.usage.cache_write_tokens,
            total_tokens: execution.usage.total(),
            tool_call_count: execution.tools_used.len() as u32,
            tools_used: execution.tools_used.clone(),
            model: Some(decision.model_config.model.clone()),
            tool_ms: execution.tool_ms,
            generation_ms: execution.generation_ms,
            total_ms: started.elapsed().as_millis() as u64,
            ..SessionStats::default()
        };
        stats.cost_usd = self
            .cost
            .charge(user_id, &decision.model_config.model, &execution.usage);

        if self.cost.over_session_threshold(user_id, stats.cost_usd) {
            adapter.handle(BlockEvent::new(
                EventType::Warning,
                format!(
                    "session cost {:.4} USD passed the soft threshold",
                    stats.cost_usd
                ),
            ));
        }
        if execution.handoffs > 0 {
            let mut meta = serde_json::Map::new();
            meta.insert(
                "handoffs".to_string(),
                serde_json::Value::from(execution.handoffs),
            );
            let _ = self.store.merge_block_metadata(&block.id, meta);
        }

        let answer = adapter.finish(&stats);
        self.store
            .complete_block(&block.id, Some(&answer), stats)
            .map_err(block_err)?;

        let _ = self.sticky.record(
            conversation_id,
            decision.intent,
            &execution.expert,
            execution.tools_used.first().map(String::as_str),
            None,
        );

        if block.round_number == 1 {
            spawn_title_generation(
                Arc::clone(&self.store),
                Arc::clone(&self.provider),
                conversation_id,
                message.to_string(),
            );
        }
        let temporary = self
            .store
            .get_conversation(conversation_id)
            .ok()
            .flatten()
            .map(|c| c.temporary)
            .unwrap_or(false);
        if !temporary {
            maybe_summarize(
                Arc::clone(&self.store),
                Arc::clone(&self.provider),
                self.summarizer_config.clone(),
                conversation_id,
            );
        }
        Ok(())
    }

    /// Dispatch one routed turn: direct expert, orchestrator on ambiguity,
    /// orchestrator handoff path when the direct expert reports inability.
    async fn execute(
        &self,
        decision: &RoutingDecision,
        conversation_id: ConversationId,
        message: &str,
        ctx: &RunContext,
    ) -> Result<Execution, MnemoError> {
        if decision.needs_orchestration || self.map.get_expert(&decision.expert).is_none() {
            let fallback = if self.map.get_expert(&decision.expert).is_some() {
                decision.expert.clone()
            } else {
                self.map
                    .experts()
                    .next()
                    .map(|e| e.name.clone())
                    .unwrap_or_default()
            };
            let result = self
                .orchestrator
                .run(&fallback, message, ctx)
                .await
                .map_err(map_agent_error)?;
            return Ok(Execution {
                expert: fallback,
                usage: result.usage,
                tools_used: result.tools_used,
                handoffs: result.handoffs,
                tool_ms: 0,
                generation_ms: 0,
            });
        }

        let expert = self
            .map
            .get_expert(&decision.expert)
            .ok_or_else(|| MnemoError::Internal("expert vanished".to_string()))?;

        let bundle = self
            .context_builder
            .build(
                &self.store,
                self.episodic.as_deref(),
                BuildInput {
                    conversation_id,
                    user_id: ctx.user_id,
                    system_prompt: &expert.system_prompt,
                    pending_message: message,
                    user_prefs: None,
                    retrieval: &[],
                    intent: decision.intent,
                },
            )
            .await
            .map_err(context_err)?;

        match self
            .executor
            .run(expert, &bundle, ctx)
            .await
            .map_err(map_agent_error)?
        {
            ExpertOutcome::Completed {
                content: _,
                usage,
                tools_used,
                tool_ms,
                generation_ms,
            } => Ok(Execution {
                expert: expert.name.clone(),
                usage,
                tools_used,
                handoffs: 0,
                tool_ms,
                generation_ms,
            }),
            ExpertOutcome::Handoff { ability_needed } => {
                let result = self
                    .orchestrator
                    .handoff(&expert.name, &ability_needed, message, &bundle, ctx)
                    .await
                    .map_err(map_agent_error)?;
                Ok(Execution {
                    expert: expert.name.clone(),
                    usage: result.usage,
                    tools_used: result.tools_used,
                    handoffs: result.handoffs,
                    tool_ms: 0,
                    generation_ms: 0,
                })
            }
        }
    }

    /// Cancel a specific in-flight block (e.g. a /stop command).
    pub fn cancel_block(&self, block_id: &str) -> bool {
        match self.active.get(block_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Bounded drain: reject new requests, wait for in-flight ones, cancel
    /// stragglers, flush the cost persister.
    pub async fn shutdown(&self, timeout: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for entry in self.active.iter() {
            entry.value().cancel();
        }
        self.cost.flush();
        info!("chat service drained");
    }
}

struct Execution {
    expert: String,
    usage: Usage,
    tools_used: Vec<String>,
    handoffs: u32,
    tool_ms: u64,
    generation_ms: u64,
}

fn block_err(e: mnemo_blocks::BlockError) -> MnemoError {
    MnemoError::Database(e.to_string())
}

fn context_err(e: ContextError) -> MnemoError {
    match e {
        ContextError::ContextTooLarge { needed, budget } => {
            MnemoError::ContextTooLarge { needed, budget }
        }
        ContextError::Block(b) => MnemoError::Database(b.to_string()),
    }
}

fn map_agent_error(e: AgentError) -> MnemoError {
    match e {
        AgentError::Cancelled => MnemoError::Cancelled,
        AgentError::NoSuitableExpert { ability } => MnemoError::NoSuitableExpert { ability },
        AgentError::Provider(p) => MnemoError::LlmProvider(p.to_string()),
        AgentError::DeadlineExceeded { seconds } => {
            MnemoError::LlmProvider(format!("agent deadline of {seconds}s exceeded"))
        }
        other => MnemoError::Internal(other.to_string()),
    }
}
