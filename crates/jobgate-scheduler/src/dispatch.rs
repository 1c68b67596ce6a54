//! Handing due jobs off the tick loop.
//!
//! The engine only ever calls [`Dispatcher::run`], which must not block. Work
//! that takes time (splay sleep, governor admission, the function itself) lives
//! in [`JobRunner::execute`] and runs on a spawned task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jobgate_core::config::{JobgateConfig, SchedulerConfig, DEFAULT_LOCK_ROOT, DEFAULT_SPLAY_SIZE};
use jobgate_core::types::{DispatchId, NodeId};
use jobgate_governor::ConcurrencyGovernor;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::splay::SplayComputer;
use crate::types::DispatchRequest;

/// Receives due jobs from the tick loop. Must return promptly.
pub trait Dispatcher: Send + Sync {
    fn run(&self, request: DispatchRequest);
}

impl<F> Dispatcher for F
where
    F: Fn(DispatchRequest) + Send + Sync,
{
    fn run(&self, request: DispatchRequest) {
        self(request)
    }
}

/// Forwards requests over a bounded mpsc channel.
///
/// `try_send` keeps the tick loop from stalling; a full or closed channel
/// drops the request with a warning.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<DispatchRequest>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Channel sized by `scheduler.dispatch_capacity`.
    pub fn from_config(config: &SchedulerConfig) -> (Self, mpsc::Receiver<DispatchRequest>) {
        Self::channel(config.dispatch_capacity)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn run(&self, request: DispatchRequest) {
        let job = request.job.clone();
        let jid = request.jid.clone();
        if self.tx.try_send(request).is_err() {
            warn!(%job, %jid, "dispatch channel full or closed, request dropped");
        }
    }
}

/// Resolves a job's `function` reference and invokes it.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn call(
        &self,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> std::result::Result<Value, String>;
}

/// Result of one dispatch unit.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { jid: DispatchId, value: Value },
    Failed { jid: DispatchId, reason: String },
    /// `maxrunning` was reached on this node, or the governor had no free
    /// slot within the job's timeout.
    NotAdmitted { jid: DispatchId },
}

/// Runs one dispatch: splay delay, local `maxrunning` check, governor
/// admission, function call, release.
pub struct JobRunner {
    identity: NodeId,
    splay_size: u32,
    registry: Arc<dyn FunctionRegistry>,
    governor: Option<Arc<ConcurrencyGovernor>>,
    lock_root: String,
    /// Job name → runs in flight on this node.
    running: DashMap<String, usize>,
}

impl JobRunner {
    pub fn new(identity: NodeId, registry: Arc<dyn FunctionRegistry>) -> Self {
        Self {
            identity,
            splay_size: DEFAULT_SPLAY_SIZE,
            registry,
            governor: None,
            lock_root: DEFAULT_LOCK_ROOT.to_string(),
            running: DashMap::new(),
        }
    }

    /// Identity, splay bucket size and lock root from config. The governor,
    /// if any, is attached separately with [`JobRunner::with_governor`].
    pub fn from_config(config: &JobgateConfig, registry: Arc<dyn FunctionRegistry>) -> Self {
        let mut runner = Self::new(config.node.id.clone(), registry).with_splay_size(config.splay.size);
        runner.lock_root = config.governor.lock_root.trim_end_matches('/').to_string();
        runner
    }

    pub fn with_splay_size(mut self, size: u32) -> Self {
        self.splay_size = size;
        self
    }

    pub fn with_governor(mut self, governor: Arc<ConcurrencyGovernor>, lock_root: &str) -> Self {
        self.governor = Some(governor);
        self.lock_root = lock_root.trim_end_matches('/').to_string();
        self
    }

    pub fn identity(&self) -> &NodeId {
        &self.identity
    }

    pub fn lock_root(&self) -> &str {
        &self.lock_root
    }

    /// Runs of `job` currently in flight on this node.
    pub fn running(&self, job: &str) -> usize {
        self.running.get(job).map(|count| *count).unwrap_or(0)
    }

    /// Execute `request` to completion.
    ///
    /// Splay and governor errors are returned before the function is called;
    /// a function failure is a `RunOutcome::Failed`, not an `Err`.
    pub async fn execute(&self, request: DispatchRequest) -> Result<RunOutcome> {
        let jid = request.jid.clone();

        if let Some(splaytime) = request.splaytime {
            let splay = SplayComputer::with_size(splaytime, self.splay_size)?;
            let delay = splay.delay(self.identity.as_bytes());
            debug!(job = %request.job, %jid, delay_secs = delay.as_secs(), "splaying");
            tokio::time::sleep(delay).await;
        }

        let _running = match request.maxrunning {
            Some(max) => match RunningGuard::enter(&self.running, &request.job, max) {
                Some(guard) => Some(guard),
                None => {
                    info!(job = %request.job, %jid, maxrunning = max, "maxrunning reached, not admitted");
                    return Ok(RunOutcome::NotAdmitted { jid });
                }
            },
            None => None,
        };

        // Each dispatch holds its slot under its own name so several runs
        // from one node count separately.
        let holder = format!("{}-{}", self.identity, jid);
        let slot = match (&request.concurrency, &self.governor) {
            (Some(limit), Some(governor)) => {
                let path = limit
                    .path
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}", self.lock_root, request.job));
                let timeout = limit.timeout_secs.and_then(timeout_from_secs);
                let outcome = governor
                    .acquire_outcome(&path, limit.max, timeout, &holder)
                    .await?;
                if !outcome.is_locked() {
                    info!(job = %request.job, %jid, %path, max = limit.max, "not admitted");
                    return Ok(RunOutcome::NotAdmitted { jid });
                }
                Some((Arc::clone(governor), path))
            }
            (Some(_), None) => {
                warn!(job = %request.job, "concurrency limit set but no governor configured, running ungoverned");
                None
            }
            (None, _) => None,
        };

        let result = self
            .registry
            .call(&request.function, &request.args, &request.kwargs)
            .await;

        if let Some((governor, path)) = slot {
            if let Err(e) = governor.release(&path, &holder).await {
                error!(job = %request.job, %path, "slot release failed: {e}");
            }
        }

        Ok(match result {
            Ok(value) => {
                info!(job = %request.job, %jid, function = %request.function, "job completed");
                RunOutcome::Completed { jid, value }
            }
            Err(reason) => {
                warn!(job = %request.job, %jid, function = %request.function, "job failed: {reason}");
                RunOutcome::Failed { jid, reason }
            }
        })
    }
}

/// Governor timeout from configured seconds. NaN and infinity wait forever,
/// and so does a value too large for a `Duration`.
fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

/// One slot in a job's local running count; dropping it frees the slot.
struct RunningGuard<'a> {
    running: &'a DashMap<String, usize>,
    job: String,
}

impl<'a> RunningGuard<'a> {
    fn enter(running: &'a DashMap<String, usize>, job: &str, max: u32) -> Option<Self> {
        let mut count = running.entry(job.to_string()).or_insert(0);
        if *count >= max as usize {
            return None;
        }
        *count += 1;
        Some(Self {
            running,
            job: job.to_string(),
        })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.running.get_mut(&self.job) {
            *count = count.saturating_sub(1);
        }
        self.running.remove_if(&self.job, |_, count| *count == 0);
    }
}

/// Spawns each request as an independent task running [`JobRunner::execute`].
pub struct SpawnDispatcher {
    runner: Arc<JobRunner>,
    handle: Handle,
}

impl SpawnDispatcher {
    pub fn new(runner: Arc<JobRunner>, handle: Handle) -> Self {
        Self { runner, handle }
    }

    /// Bind to the runtime of the calling context.
    pub fn from_current(runner: Arc<JobRunner>) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| SchedulerError::Runtime(e.to_string()))?;
        Ok(Self::new(runner, handle))
    }
}

impl Dispatcher for SpawnDispatcher {
    fn run(&self, request: DispatchRequest) {
        let runner = Arc::clone(&self.runner);
        self.handle.spawn(async move {
            let job = request.job.clone();
            if let Err(e) = runner.execute(request).await {
                error!(%job, "dispatch failed: {e}");
            }
        });
    }
}
