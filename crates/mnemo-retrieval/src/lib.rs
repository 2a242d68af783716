//! Adaptive hybrid retrieval: nine named strategies over vector + BM25
//! backends, reciprocal-rank fusion, a result-quality heuristic, and a
//! rerank gate. Shared by concurrent chats; every I/O path is cancellable.

pub mod engine;
pub mod error;
pub mod quality;
pub mod rrf;
pub mod store;
pub mod types;

pub use engine::{RetrievalOutcome, Retriever, RetrieverSettings};
pub use error::{RetrievalError, Result};
pub use store::{Bm25Query, Bm25Search, MemoListing, MemoStore, RetrievalBackend, ScheduleScan, VectorQuery, VectorSearch};
pub use types::*;
