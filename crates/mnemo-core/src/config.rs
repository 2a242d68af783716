use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Hard cap on a single chat message, enforced by the handler façade.
pub const MAX_MESSAGE_CHARS: usize = 1000;
/// Marker message that inserts a context separator instead of chatting.
pub const SEPARATOR_COMMAND: &str = "---";

/// Top-level config (mnemo.toml + MNEMO_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MnemoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Expiry for routing cache entries.
    #[serde(default = "default_router_cache_ttl")]
    pub cache_ttl_seconds: u64,
    /// LRU cap for the routing cache.
    #[serde(default = "default_router_cache_max")]
    pub cache_max_entries: usize,
    /// Validity window for sticky routing decisions.
    #[serde(default = "default_sticky_ttl")]
    pub sticky_ttl_seconds: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_router_cache_ttl(),
            cache_max_entries: default_router_cache_max(),
            sticky_ttl_seconds: default_sticky_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: u32,
    /// Tokens reserved for the system prompt before ratios apply.
    #[serde(default = "default_system_prompt_tokens")]
    pub system_prompt_tokens: u32,
    #[serde(default = "default_user_prefs_ratio")]
    pub user_prefs_ratio: f64,
    /// Ratios over the remainder when retrieval evidence is present.
    #[serde(default = "default_short_term_ratio")]
    pub short_term_ratio: f64,
    #[serde(default = "default_long_term_ratio")]
    pub long_term_ratio: f64,
    #[serde(default = "default_retrieval_ratio")]
    pub retrieval_ratio: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            system_prompt_tokens: default_system_prompt_tokens(),
            user_prefs_ratio: default_user_prefs_ratio(),
            short_term_ratio: default_short_term_ratio(),
            long_term_ratio: default_long_term_ratio(),
            retrieval_ratio: default_retrieval_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    #[serde(default = "default_vector_limit")]
    pub vector_limit: usize,
    #[serde(default = "default_bm25_limit")]
    pub bm25_limit: usize,
    /// K constant in the reciprocal-rank-fusion formula w / (K + rank).
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    /// Semantic search only considers memos created in this window.
    #[serde(default = "default_recency_days")]
    pub recency_days: i64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            vector_limit: default_vector_limit(),
            bm25_limit: default_bm25_limit(),
            rrf_k: default_rrf_k(),
            recency_days: default_recency_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Documents are truncated to this many characters before reranking.
    #[serde(default = "default_doc_truncate_chars")]
    pub doc_truncate_chars: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            doc_truncate_chars: default_doc_truncate_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wall-clock budget for one expert run.
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
    /// Per-tool-call deadline.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,
    /// Maximum ReAct iterations.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_agent_timeout(),
            tool_timeout_seconds: default_tool_timeout(),
            max_rounds: default_max_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: u32,
    /// Cap on a single decomposed task's input length, in characters.
    #[serde(default = "default_task_input_chars")]
    pub max_task_input_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            max_handoffs: default_max_handoffs(),
            max_task_input_chars: default_task_input_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Blocks since the last checkpoint before a summary is produced.
    #[serde(default = "default_message_threshold")]
    pub message_threshold: usize,
    /// Global token ceiling that also triggers summarization.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    /// Content above this many characters counts as "large" for cool-zone rules.
    #[serde(default = "default_large_message_threshold")]
    pub large_message_threshold: usize,
    /// Blocks newer than this many rounds keep large content verbatim.
    #[serde(default = "default_hot_zone_rounds")]
    pub hot_zone_rounds: i64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            message_threshold: default_message_threshold(),
            token_threshold: default_token_threshold(),
            large_message_threshold: default_large_message_threshold(),
            hot_zone_rounds: default_hot_zone_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_burst_per_user")]
    pub burst_per_user: u32,
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_per_user: default_burst_per_user(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Per-user daily spend cap in USD. `None` = unlimited.
    #[serde(default)]
    pub daily_budget_usd: Option<f64>,
    /// Soft per-session threshold — exceeded sessions get a warning event.
    #[serde(default = "default_session_threshold")]
    pub per_session_threshold_usd: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: None,
            per_session_threshold_usd: default_session_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_expert_cache_max")]
    pub expert_max_entries: usize,
    #[serde(default = "default_expert_cache_ttl")]
    pub expert_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expert_max_entries: default_expert_cache_max(),
            expert_ttl_seconds: default_expert_cache_ttl(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mnemo/mnemo.db", home)
}
fn default_router_cache_ttl() -> u64 {
    900
}
fn default_router_cache_max() -> usize {
    500
}
fn default_sticky_ttl() -> u64 {
    300
}
fn default_context_max_tokens() -> u32 {
    4096
}
fn default_system_prompt_tokens() -> u32 {
    500
}
fn default_user_prefs_ratio() -> f64 {
    0.10
}
fn default_short_term_ratio() -> f64 {
    0.40
}
fn default_long_term_ratio() -> f64 {
    0.15
}
fn default_retrieval_ratio() -> f64 {
    0.45
}
fn default_vector_limit() -> usize {
    20
}
fn default_bm25_limit() -> usize {
    20
}
fn default_rrf_k() -> u32 {
    60
}
fn default_recency_days() -> i64 {
    90
}
fn default_doc_truncate_chars() -> usize {
    5000
}
fn default_agent_timeout() -> u64 {
    60
}
fn default_tool_timeout() -> u64 {
    45
}
fn default_max_rounds() -> u32 {
    6
}
fn default_max_tasks() -> usize {
    5
}
fn default_max_handoffs() -> u32 {
    1
}
fn default_task_input_chars() -> usize {
    2000
}
fn default_message_threshold() -> usize {
    11
}
fn default_token_threshold() -> u64 {
    2_000_000
}
fn default_large_message_threshold() -> usize {
    1_000_000
}
fn default_hot_zone_rounds() -> i64 {
    5
}
fn default_burst_per_user() -> u32 {
    20
}
fn default_refill_per_second() -> f64 {
    2.0
}
fn default_session_threshold() -> f64 {
    1.0
}
fn default_expert_cache_max() -> usize {
    256
}
fn default_expert_cache_ttl() -> u64 {
    300
}

impl MnemoConfig {
    /// Load config from a TOML file with MNEMO_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.mnemo/mnemo.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MnemoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MNEMO_").split("_"))
            .extract()
            .map_err(|e| crate::error::MnemoError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mnemo/mnemo.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MnemoConfig::default();
        assert_eq!(cfg.router.cache_ttl_seconds, 900);
        assert_eq!(cfg.router.cache_max_entries, 500);
        assert_eq!(cfg.router.sticky_ttl_seconds, 300);
        assert_eq!(cfg.context.max_tokens, 4096);
        assert_eq!(cfg.context.system_prompt_tokens, 500);
        assert_eq!(cfg.retriever.rrf_k, 60);
        assert_eq!(cfg.agent.max_rounds, 6);
        assert_eq!(cfg.orchestrator.max_tasks, 5);
        assert_eq!(cfg.orchestrator.max_handoffs, 1);
        assert_eq!(cfg.summarizer.message_threshold, 11);
        assert_eq!(cfg.rate_limit.burst_per_user, 20);
        assert!(cfg.cost.daily_budget_usd.is_none());
    }
}
