//! Error types for the stepline runtime.
//!
//! Transport failures that survive the retry layer, configuration mistakes,
//! and lifecycle violations all surface through [`SteplineError`]. Application
//! handler errors are deliberately *not* part of this taxonomy: handlers
//! return `anyhow::Error` and are routed through the worker's escalation
//! policy instead of the transport error path.

use thiserror::Error;

/// The main error type for stepline operations.
#[derive(Debug, Error)]
pub enum SteplineError {
    /// A transport operation failed permanently, after retry exhaustion.
    #[error("transport error: {0}")]
    Transport(String),

    /// A component was started while it was already running.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Caller-supplied input was rejected before reaching the transport.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced message is unknown to the service.
    #[error("message not found: {0}")]
    NotFound(String),

    /// A step was completed a second time for the same message.
    #[error("step '{step}' already completed for message {id}")]
    AlreadyCompleted {
        /// The message identifier.
        id: String,
        /// The step that was already completed.
        step: String,
    },

    /// A referenced step is not part of the message's route.
    #[error("step '{step}' is not on the route of message {id}")]
    StepNotOnRoute {
        /// The message identifier.
        id: String,
        /// The missing step.
        step: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SteplineError {
    /// Creates a transport error from any displayable cause.
    #[must_use]
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }

    /// Creates an invalid-input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Returns true if the error is worth retrying at the transport layer.
    ///
    /// Configuration and lifecycle errors are never retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SteplineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        let err = SteplineError::transport("connection refused");
        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[test]
    fn test_already_running_display() {
        let err = SteplineError::AlreadyRunning("pipe");
        assert_eq!(err.to_string(), "pipe is already running");
    }

    #[test]
    fn test_transient_classification() {
        assert!(SteplineError::transport("timeout").is_transient());
        assert!(!SteplineError::invalid_input("payload required").is_transient());
        assert!(!SteplineError::AlreadyRunning("worker").is_transient());
    }

    #[test]
    fn test_already_completed_display() {
        let err = SteplineError::AlreadyCompleted {
            id: "abc".to_string(),
            step: "resize".to_string(),
        };
        assert!(err.to_string().contains("resize"));
        assert!(err.to_string().contains("abc"));
    }
}
