//! Intent routing: a declarative capability map, a two-layer router
//! (cache → keyword-weight rules), and persisted sticky-route metadata.
//! The router never calls an LLM — ambiguity is flagged for the
//! orchestrator to resolve.

pub mod capability;
pub mod error;
pub mod router;
pub mod sticky;

pub use capability::{
    CapabilityMap, ExpertConfig, ExpertStrategy, FastPath, RoutingRules, WeightConfig,
};
pub use error::{Result, RoutingError};
pub use router::{Router, RouterSettings, RoutingDecision};
pub use sticky::{RoutingMetadata, StickyManager, WorkingState};
