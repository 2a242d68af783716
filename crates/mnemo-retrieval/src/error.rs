use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: String, end: String },

    #[error("Hybrid search failed on both paths: vector: {vector}; bm25: {bm25}")]
    BothBackendsFailed { vector: String, bm25: String },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
