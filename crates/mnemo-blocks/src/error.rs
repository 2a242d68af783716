use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: i64 },

    #[error("Block not found: {id}")]
    BlockNotFound { id: String },

    #[error("Block {id} is {status}: {operation} is not allowed")]
    InvalidState {
        id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BlockError>;
