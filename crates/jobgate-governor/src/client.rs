use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Result of creating a named ephemeral node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// One held concurrency unit, as seen in the coordination tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSlot {
    pub path: String,
    pub holder: String,
    pub created_at: DateTime<Utc>,
}

/// Narrow view of a hierarchical, session-based coordination service.
///
/// Ephemeral nodes belong to the client's session and disappear when the
/// session is closed. Paths are `/`-separated; `children` returns bare child
/// names, not full paths.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create `path` and any missing ancestors as persistent nodes. Idempotent.
    async fn ensure_path(&self, path: &str) -> Result<()>;

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome>;

    /// Create an ephemeral node named `prefix` + a zero-padded, service-wide
    /// increasing sequence number. Returns the full path of the new node.
    async fn create_sequential(&self, prefix: &str, data: &[u8]) -> Result<String>;

    /// Returns whether the node existed.
    async fn delete(&self, path: &str) -> Result<bool>;

    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn slot(&self, path: &str) -> Result<Option<LockSlot>>;

    /// End the session, dropping every ephemeral node it owns.
    async fn close(&self) -> Result<()>;
}
