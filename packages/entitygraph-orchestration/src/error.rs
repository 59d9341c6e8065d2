use crate::config::ConfigError;
use entitygraph_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Pipeline is already running (phase: {phase})")]
    AlreadyRunning { phase: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Item failed: {0}")]
    Item(String),

    #[error("Concurrent update conflict on '{key}' after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    #[error("No handler registered for job '{0}'")]
    HandlerNotFound(String),

    #[error("Invalid arguments for job '{job}': {reason}")]
    InvalidArguments { job: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn invalid_arguments(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// Where this error sits in the job-boundary taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::RateLimited(_) => ErrorCategory::Backpressure,
            PipelineError::Item(_) => ErrorCategory::Item,
            PipelineError::Conflict { .. } => ErrorCategory::Persistence,
            PipelineError::Storage(e) if e.is_persistence() => ErrorCategory::Persistence,
            _ => ErrorCategory::Fatal,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error category driving retry and escalation at the job boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Rate-limit class: re-raised to the queue, cursor not advanced
    Backpressure,
    /// Single item failed: counted, batch moves on
    Item,
    /// Storage constraint or write conflict: invocation aborted and retried
    Persistence,
    /// Anything else: the pipeline is marked failed
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Backpressure => "backpressure",
            ErrorCategory::Item => "item",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::Fatal => "fatal",
        }
    }

    /// Whether the queue should retry an invocation that failed this way
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Backpressure | ErrorCategory::Persistence)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backpressure_and_persistence_retry() {
        assert!(ErrorCategory::Backpressure.is_retryable());
        assert!(ErrorCategory::Persistence.is_retryable());
        assert!(!ErrorCategory::Item.is_retryable());
        assert_eq!(ErrorCategory::Persistence.to_string(), "persistence");
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            PipelineError::RateLimited("429".into()).category(),
            ErrorCategory::Backpressure
        );
        assert_eq!(
            PipelineError::Storage(StorageError::constraint("dup")).category(),
            ErrorCategory::Persistence
        );
        assert_eq!(
            PipelineError::Storage(StorageError::entity_not_found(3)).category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            PipelineError::Conflict {
                key: "k".into(),
                attempts: 3
            }
            .category(),
            ErrorCategory::Persistence
        );
        assert!(!ErrorCategory::Fatal.is_retryable());
    }
}
