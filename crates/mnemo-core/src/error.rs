use thiserror::Error;

/// Top-level error surfaced to callers of the chat service.
///
/// Lower layers carry their own error enums; this one exists so the façade
/// can hand a single typed error (with a stable short code) to transports.
#[derive(Debug, Error)]
pub enum MnemoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rate limit exceeded for user {user_id}")]
    RateLimitExceeded { user_id: i64 },

    #[error("Daily budget exceeded: spent {spent_usd:.4} of {budget_usd:.4} USD")]
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },

    #[error("No suitable expert for ability: {ability}")]
    NoSuitableExpert { ability: String },

    #[error("Context too large: system prompt and query need {needed} tokens, budget is {budget}")]
    ContextTooLarge { needed: u32, budget: u32 },

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    /// Short error code string carried on error stream frames.
    pub fn code(&self) -> &'static str {
        match self {
            MnemoError::Config(_) => "CONFIG_ERROR",
            MnemoError::InvalidInput(_) => "INVALID_INPUT",
            MnemoError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            MnemoError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            MnemoError::NoSuitableExpert { .. } => "NO_SUITABLE_EXPERT",
            MnemoError::ContextTooLarge { .. } => "CONTEXT_TOO_LARGE",
            MnemoError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            MnemoError::Database(_) => "DATABASE_ERROR",
            MnemoError::Serialization(_) => "SERIALIZATION_ERROR",
            MnemoError::Cancelled => "CANCELLED",
            MnemoError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MnemoError>;
