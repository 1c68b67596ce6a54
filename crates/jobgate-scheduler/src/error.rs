use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Splay settings are unusable; raised before any sleep or dispatch.
    #[error("Invalid splay configuration: {0}")]
    SplayConfig(String),

    /// No job with the given name exists in the table.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("Governor error: {0}")]
    Governor(#[from] jobgate_governor::GovernorError),

    /// Stored run-state could not be decoded.
    #[error("Corrupt run-state for {name}: {reason}")]
    CorruptState { name: String, reason: String },

    /// No async runtime was available to spawn dispatch units on.
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

/// Per-job validation failure. Captured on the job's run-state, never raised
/// out of a tick. `Display` is the stored `_error` text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Bad cron/once/when/window syntax or an invalid rule combination.
    #[error("{0}")]
    ConfigValidation(String),

    /// A window or splay whose end does not come after its start.
    #[error("{0}")]
    RangeOrder(String),

    /// A window or the `whens` lookup is not a mapping.
    #[error("{0}")]
    TypeMismatch(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
