//! `jobgate-core` — configuration, job definitions and shared identifiers.

pub mod config;
pub mod error;
pub mod job;
pub mod types;

pub use config::JobgateConfig;
pub use error::{JobgateError, Result};
pub use job::{ConcurrencySpec, JobSpec, SplaySpec, WhenSpec};
pub use types::{DispatchId, NodeId};
