//! Error types for the sandbox execution service

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox execution service
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed execution request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every instance is unhealthy, draining or behind an open breaker
    #[error("No available instance: {0}")]
    NoAvailableInstance(String),

    /// The instance picked by the balancer disappeared or went unhealthy before it could be leased
    #[error("Instance {0} is no longer available")]
    InstanceUnavailable(String),

    /// Processor queue is at capacity
    #[error("Queue full: capacity {capacity} reached")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// Execution exceeded its wall-clock limit
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// No pool slot freed up in time
    #[error("Timed out after {0:?} waiting for a worker")]
    AcquireTimeout(Duration),

    /// Breaker for the instance is open
    #[error("Circuit open for instance {instance}")]
    CircuitOpen {
        /// Instance whose breaker rejected the call
        instance: String,
    },

    /// Non-zero exit or runtime failure inside the sandbox
    #[error("Execution failed with exit code {exit_code:?}: {stderr}")]
    Execution {
        /// Process exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
        /// Whether the failure is a transient resource signal worth retrying
        transient: bool,
    },

    /// The isolation primitive ran out of resources before running the code
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Isolation backend failure
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// The service or processor is shutting down
    #[error("Shutting down")]
    ShuttingDown,

    /// Queued work was cancelled before it started
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error carrying the correlation id of the request that produced it
    #[error("[{correlation_id}] {source}")]
    Tagged {
        /// Request correlation id
        correlation_id: Uuid,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

/// Flat error discriminant used for metrics and API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    NoAvailableInstance,
    QueueFull,
    Timeout,
    CircuitOpen,
    Execution,
    ResourceExhausted,
    Sandbox,
    ShuttingDown,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Validation => "validation",
            ErrorKind::NoAvailableInstance => "no_available_instance",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Execution => "execution",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Attach a correlation id. Already tagged errors keep their original id.
    pub fn tagged(self, correlation_id: Uuid) -> Self {
        match self {
            Error::Tagged { .. } => self,
            other => Error::Tagged {
                correlation_id,
                source: Box::new(other),
            },
        }
    }

    /// Correlation id, if the error has been tagged
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Error::Tagged { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    /// The error with any correlation tag removed
    pub fn untagged(&self) -> &Error {
        match self {
            Error::Tagged { source, .. } => source.untagged(),
            other => other,
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self.untagged() {
            Error::Config(_) => ErrorKind::Config,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NoAvailableInstance(_) | Error::InstanceUnavailable(_) => {
                ErrorKind::NoAvailableInstance
            }
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::Timeout(_) | Error::AcquireTimeout(_) => ErrorKind::Timeout,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Execution { .. } => ErrorKind::Execution,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Sandbox(_) | Error::Io(_) => ErrorKind::Sandbox,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Json(_) | Error::Internal(_) | Error::Tagged { .. } => ErrorKind::Internal,
        }
    }

    /// Check if the failure is transient and the request may be re-routed and retried
    pub fn is_retryable(&self) -> bool {
        match self.untagged() {
            Error::Timeout(_)
            | Error::AcquireTimeout(_)
            | Error::ResourceExhausted(_)
            | Error::InstanceUnavailable(_)
            | Error::CircuitOpen { .. } => true,
            Error::Execution { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self.untagged(), Error::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::ResourceExhausted("eagain".into()).is_retryable());
        assert!(!Error::Validation("empty".into()).is_retryable());
        assert!(!Error::NoAvailableInstance("all open".into()).is_retryable());
        assert!(!Error::QueueFull { capacity: 4 }.is_retryable());

        let permanent = Error::Execution {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "boom".into(),
            transient: false,
        };
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_tagging_is_transparent() {
        let id = Uuid::new_v4();
        let err = Error::Timeout(Duration::from_millis(5)).tagged(id);
        assert_eq!(err.correlation_id(), Some(id));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
        assert!(err.to_string().contains(&id.to_string()));

        // Re-tagging keeps the first id
        let again = err.tagged(Uuid::new_v4());
        assert_eq!(again.correlation_id(), Some(id));
    }
}
