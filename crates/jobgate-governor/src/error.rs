use thiserror::Error;

/// Errors surfaced by the governor. Ordinary contention is never an error;
/// see [`crate::AcquireOutcome`].
#[derive(Debug, Error)]
pub enum GovernorError {
    /// The coordination service cannot be reached or the session is gone.
    #[error("Coordination service unreachable: {0}")]
    Connectivity(String),

    /// The service rejected an operation (e.g. missing parent node).
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Invalid acquire parameters.
    #[error("Governor configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GovernorError>;
