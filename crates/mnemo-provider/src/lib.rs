//! Capability interfaces consumed by the orchestration core.
//!
//! The wire protocols behind these traits (Anthropic, OpenAI, local models,
//! embedding services, cross-encoder rerankers) live outside this workspace;
//! the core only depends on the contracts defined here.

pub mod embed;
pub mod provider;
pub mod retry;
pub mod stream;

pub use embed::{Embedder, RerankResult, Reranker};
pub use provider::{
    ChatRequest, ChatResponse, LlmProvider, Message, ModelConfig, ProviderError, Role, ToolCall,
    ToolDefinition, Usage,
};
pub use retry::RetryProvider;
pub use stream::StreamEvent;
