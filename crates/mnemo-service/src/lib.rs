//! The chat service façade: glues router, experts, orchestrator, context
//! builder, transcript store, stream adapter, rate limiting, and cost
//! accounting behind one `handle_chat` entry point. Transports (gRPC, WS,
//! HTTP) live outside this workspace and only consume the frame stream.

pub mod cost;
pub mod episodic;
pub mod handler;
pub mod ratelimit;
pub mod stream;

pub use cost::{CostAccountant, ModelRate, UserCostSettings};
pub use episodic::RetrievalEpisodic;
pub use handler::{ChatRequestIn, ChatService, ChatServiceBuilder};
pub use ratelimit::RateLimiter;
pub use stream::{StreamAdapter, StreamFrame};
