//! `jobgate-scheduler` — temporal job table, tick loop and dispatch.
//!
//! # Overview
//!
//! A [`Scheduler`] owns a [`JobTable`] of named jobs. Each tick evaluates every
//! enabled job against one shared `now`, stores the outcome on the job's
//! run-state and hands due jobs to a [`Dispatcher`]. A job whose rule is
//! malformed carries the message in its `_error` status field and is skipped;
//! its siblings are unaffected.
//!
//! # Rules
//!
//! | Rule               | Fires                                                   |
//! |--------------------|---------------------------------------------------------|
//! | `seconds`..`days`  | On first sight, then every summed interval              |
//! | `cron`             | At each occurrence of a 5- or 6-field expression        |
//! | `once`             | Once, at the first tick at or after the instant         |
//! | `when`             | Once per label, resolved through the `whens` lookup     |
//!
//! Modifiers apply in order: `until` / `after`, job-level `splay`,
//! `run_on_start`, `range`, `skip_during_range` (per job or table-wide) with
//! `run_after_skip_range`, then explicit skips. [`Scheduler::skip_job`] and
//! [`Scheduler::postpone_job`] add one-off skip and run instants to a job.
//!
//! Dispatch units ([`JobRunner`]) apply the node's splay delay, cap runs in
//! flight per node at `maxrunning`, and take a governor slot around the call
//! when the job sets `concurrency`.

pub mod datetime;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod splay;
pub mod table;
pub mod types;

pub use db::StateStore;
pub use dispatch::{
    ChannelDispatcher, Dispatcher, FunctionRegistry, JobRunner, RunOutcome, SpawnDispatcher,
};
pub use engine::{Scheduler, SchedulerHandle};
pub use error::{JobError, Result, SchedulerError};
pub use evaluate::{evaluate, EvalContext};
pub use splay::SplayComputer;
pub use table::{JobEntry, JobTable};
pub use types::{DispatchRequest, Evaluation, JobRunState, JobStatus, TickReport};
