use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Context too large: system prompt and query need {needed} tokens, budget is {budget}")]
    ContextTooLarge { needed: u32, budget: u32 },

    #[error(transparent)]
    Block(#[from] mnemo_blocks::BlockError),
}

pub type Result<T> = std::result::Result<T, ContextError>;
