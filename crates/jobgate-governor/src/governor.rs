use std::sync::Arc;
use std::time::Duration;

use jobgate_core::config::{AcquireStrategy, GovernorConfig};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{CoordinationClient, CreateOutcome};
use crate::error::{GovernorError, Result};

/// Separates the holder identity from the sequence number in sequential node names.
const SEQ_MARKER: &str = "__lock__";

/// Terminal state of one acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Locked,
    /// A slot for this identity already exists under the path.
    Failed,
    TimedOut,
}

impl AcquireOutcome {
    pub fn is_locked(self) -> bool {
        matches!(self, AcquireOutcome::Locked)
    }
}

/// Distributed counting semaphore.
///
/// Owns its client handle; independent governors (one per session) can
/// coexist in the same process.
pub struct ConcurrencyGovernor {
    client: Arc<dyn CoordinationClient>,
    identity: String,
    poll_interval: Duration,
    strategy: AcquireStrategy,
}

impl ConcurrencyGovernor {
    pub fn open(
        client: Arc<dyn CoordinationClient>,
        identity: impl Into<String>,
        config: &GovernorConfig,
    ) -> Self {
        Self {
            client,
            identity: identity.into(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            strategy: config.strategy,
        }
    }

    /// Close the underlying session. Slots still held are dropped by the service.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn strategy(&self) -> AcquireStrategy {
        self.strategy
    }

    /// Acquire one of `max` slots under `path` for this governor's identity.
    pub async fn lock(&self, path: &str, max: u32, timeout: Option<Duration>) -> Result<bool> {
        self.acquire(path, max, timeout, &self.identity).await
    }

    pub async fn unlock(&self, path: &str) -> Result<bool> {
        self.release(path, &self.identity).await
    }

    pub async fn acquire(
        &self,
        path: &str,
        max: u32,
        timeout: Option<Duration>,
        identity: &str,
    ) -> Result<bool> {
        Ok(self
            .acquire_outcome(path, max, timeout, identity)
            .await?
            .is_locked())
    }

    /// Acquire a slot, polling until one frees up or `timeout` elapses.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` makes a single attempt.
    /// A timeout too large to add to the clock also waits forever.
    /// Only connectivity problems are returned as errors.
    pub async fn acquire_outcome(
        &self,
        path: &str,
        max: u32,
        timeout: Option<Duration>,
        identity: &str,
    ) -> Result<AcquireOutcome> {
        validate(path, max, identity)?;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self.client.ensure_path(path).await?;

        let outcome = match self.strategy {
            AcquireStrategy::Sequential => {
                self.acquire_sequential(path, max, deadline, identity).await?
            }
            AcquireStrategy::CountThenCreate => {
                self.acquire_counted(path, max, deadline, identity).await?
            }
        };

        match outcome {
            AcquireOutcome::Locked => info!(path, identity, max, "slot acquired"),
            AcquireOutcome::Failed => warn!(path, identity, "slot already held by this identity"),
            AcquireOutcome::TimedOut => info!(path, identity, max, "slot acquisition timed out"),
        }
        Ok(outcome)
    }

    /// Delete every slot `identity` holds under `path`. Releasing a slot that
    /// is not held succeeds.
    pub async fn release(&self, path: &str, identity: &str) -> Result<bool> {
        let children = match self.client.children(path).await {
            Ok(children) => children,
            // No path means nothing was ever held there.
            Err(GovernorError::Coordination(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        let mut released = 0usize;
        for child in children.iter().filter(|c| holder_of(c) == identity) {
            if self.client.delete(&format!("{path}/{child}")).await? {
                released += 1;
            }
        }
        if released == 0 {
            debug!(path, identity, "release: no slot held");
        } else {
            info!(path, identity, "slot released");
        }
        Ok(true)
    }

    /// Identities currently holding (or, for sequential, waiting on) a slot.
    pub async fn holders(&self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<(u64, String)> = self
            .client
            .children(path)
            .await?
            .iter()
            .map(|c| (sequence_of(c).unwrap_or(0), holder_of(c).to_string()))
            .collect();
        names.sort();
        Ok(names.into_iter().map(|(_, holder)| holder).collect())
    }

    async fn acquire_counted(
        &self,
        path: &str,
        max: u32,
        deadline: Option<Instant>,
        identity: &str,
    ) -> Result<AcquireOutcome> {
        let node = format!("{path}/{identity}");
        let limit = max as usize;
        loop {
            let count = self.client.children(path).await?.len();
            if count < limit {
                match self.client.create_ephemeral(&node, identity.as_bytes()).await? {
                    CreateOutcome::AlreadyExists => return Ok(AcquireOutcome::Failed),
                    CreateOutcome::Created => {
                        let count = self.client.children(path).await?.len();
                        if count <= limit {
                            return Ok(AcquireOutcome::Locked);
                        }
                        debug!(path, identity, count, "lost acquisition race, backing off");
                        self.client.delete(&node).await?;
                    }
                }
            } else {
                debug!(path, identity, count, max, "all slots taken, waiting");
            }
            if !self.pause(deadline).await {
                return Ok(AcquireOutcome::TimedOut);
            }
        }
    }

    async fn acquire_sequential(
        &self,
        path: &str,
        max: u32,
        deadline: Option<Instant>,
        identity: &str,
    ) -> Result<AcquireOutcome> {
        let existing = self.client.children(path).await?;
        if existing.iter().any(|c| holder_of(c) == identity) {
            return Ok(AcquireOutcome::Failed);
        }

        let prefix = format!("{path}/{identity}{SEQ_MARKER}");
        let node = self
            .client
            .create_sequential(&prefix, identity.as_bytes())
            .await?;
        let own = node
            .rsplit('/')
            .next()
            .and_then(sequence_of)
            .ok_or_else(|| {
                GovernorError::Coordination(format!("unexpected sequential node name {node}"))
            })?;

        // Another acquire for the same identity may have passed the check above
        // concurrently. Whoever sees a sibling steps back.
        let duplicate = self
            .client
            .children(path)
            .await?
            .iter()
            .any(|c| holder_of(c) == identity && sequence_of(c) != Some(own));
        if duplicate {
            self.client.delete(&node).await?;
            return Ok(AcquireOutcome::Failed);
        }

        loop {
            let ahead = self
                .client
                .children(path)
                .await?
                .iter()
                .filter_map(|c| sequence_of(c))
                .filter(|seq| *seq < own)
                .count();
            if ahead < max as usize {
                return Ok(AcquireOutcome::Locked);
            }
            debug!(path, identity, ahead, max, "waiting for a slot");
            if !self.pause(deadline).await {
                self.client.delete(&node).await?;
                return Ok(AcquireOutcome::TimedOut);
            }
        }
    }

    /// Sleep one poll interval, clipped to the deadline. Returns false once
    /// the deadline has passed.
    async fn pause(&self, deadline: Option<Instant>) -> bool {
        let wait = match deadline {
            None => self.poll_interval,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                self.poll_interval.min(d - now)
            }
        };
        tokio::time::sleep(wait).await;
        true
    }
}

fn validate(path: &str, max: u32, identity: &str) -> Result<()> {
    if max == 0 {
        return Err(GovernorError::Config(
            "max concurrency must be at least 1".to_string(),
        ));
    }
    if !path.starts_with('/') {
        return Err(GovernorError::Config(format!(
            "coordination path must be absolute, got {path:?}"
        )));
    }
    if identity.is_empty() || identity.contains('/') || identity.contains(SEQ_MARKER) {
        return Err(GovernorError::Config(format!(
            "invalid holder identity {identity:?}"
        )));
    }
    Ok(())
}

/// Holder identity encoded in a child node name.
fn holder_of(child: &str) -> &str {
    child
        .split_once(SEQ_MARKER)
        .map(|(holder, _)| holder)
        .unwrap_or(child)
}

fn sequence_of(child: &str) -> Option<u64> {
    child.rsplit_once(SEQ_MARKER)?.1.parse().ok()
}
