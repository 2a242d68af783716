//! Token-budgeted prompt assembly: heuristic token estimation, section
//! budget allocation, priority-ranked truncation, and the context builder
//! that turns transcript + evidence + pending input into a PromptBundle.

pub mod builder;
pub mod error;
pub mod ranker;
pub mod segment;
pub mod token;

pub use builder::{BuildInput, ContextBuilder, Episode, EpisodicMemory, PromptBundle, SectionTally};
pub use error::{ContextError, Result};
pub use ranker::rank_and_fit;
pub use segment::{ContextSegment, SegmentRole};
pub use token::{estimate_tokens, BudgetAllocator, SectionBudgets};
