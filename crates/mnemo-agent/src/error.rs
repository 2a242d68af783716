use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM provider error: {0}")]
    Provider(#[from] mnemo_provider::ProviderError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] mnemo_retrieval::RetrievalError),

    #[error("No tool produced a usable result")]
    NoUsableToolResults,

    #[error("Tool {tool} failed repeatedly")]
    ToolRepeatedlyFailed { tool: String },

    #[error("Invalid plan from decomposer: {0}")]
    InvalidPlan(String),

    #[error("No suitable expert for ability: {ability}")]
    NoSuitableExpert { ability: String },

    #[error("Unknown expert: {name}")]
    UnknownExpert { name: String },

    #[error("Agent deadline of {seconds}s exceeded")]
    DeadlineExceeded { seconds: u64 },

    #[error("event stream closed by consumer")]
    CallbackClosed,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;
