use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobgateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job definition ({job}): {reason}")]
    InvalidJob { job: String, reason: String },
}

impl JobgateError {
    /// Short, stable error code for status output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            JobgateError::Config(_) => "CONFIG_ERROR",
            JobgateError::InvalidJob { .. } => "INVALID_JOB",
        }
    }
}

pub type Result<T> = std::result::Result<T, JobgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(JobgateError::Config("x".into()).code(), "CONFIG_ERROR");
        let err = JobgateError::InvalidJob {
            job: "backup".into(),
            reason: "missing function".into(),
        };
        assert_eq!(err.code(), "INVALID_JOB");
        assert_eq!(
            err.to_string(),
            "Invalid job definition (backup): missing function"
        );
    }
}
