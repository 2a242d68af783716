pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use error::{MnemoError, Result};
