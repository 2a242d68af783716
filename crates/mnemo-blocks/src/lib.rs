//! Append-only turn transcript: Conversations own Blocks, Blocks own an
//! ordered event stream and session stats. The store is the single writer;
//! every streaming append is its own short transaction.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{BlockError, Result};
pub use store::{BlockFilter, BlockStore};
pub use types::*;
