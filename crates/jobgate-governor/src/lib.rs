//! `jobgate-governor` — distributed counting semaphore over a coordination service.
//!
//! A [`ConcurrencyGovernor`] bounds how many nodes may run the same job at
//! once. Each held slot is an ephemeral node under a coordination path; the
//! service itself is a collaborator behind [`CoordinationClient`].
//!
//! | Strategy          | Behaviour                                                    |
//! |-------------------|--------------------------------------------------------------|
//! | `Sequential`      | Ordered ephemeral node, wait until fewer than N nodes ahead  |
//! | `CountThenCreate` | Count, create named node, re-check and back off on overshoot |

pub mod client;
pub mod error;
pub mod governor;
pub mod memory;

pub use client::{CoordinationClient, CreateOutcome, LockSlot};
pub use error::{GovernorError, Result};
pub use governor::{AcquireOutcome, ConcurrencyGovernor};
pub use jobgate_core::config::AcquireStrategy;
pub use memory::{MemoryCoordinator, MemoryTree};
