use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Variants are `Clone` so a group-level failure (connection, transfer) can be
/// attached to every job of the group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error ({host}): {message}")]
    Connection { host: String, message: String },

    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RunError {
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        RunError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Errors worth retrying on the next poll tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunError::Connection { .. } | RunError::Parse(_))
    }
}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RunError {
    fn from(e: serde_json::Error) -> Self {
        RunError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Per-job outcome of a batch call.
pub type JobResult = std::result::Result<crate::job::Job, RunError>;
