//! Error types for a3s-session

use thiserror::Error;

/// Errors that can occur in the session core
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live session with this id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session already has a turn in flight
    #[error("Session '{0}' is already processing a turn")]
    Busy(String),

    /// The session (or one of its channels) has been closed
    #[error("Session closed: {0}")]
    Closed(String),

    /// Approval plan failed validation
    #[error("Invalid approval plan: {0}")]
    InvalidPlan(String),

    /// Model-query engine failure (startup, output stream, interrupt, close)
    #[error("Engine error: {0}")]
    Engine(String),

    /// Persistence collaborator failure
    #[error("Store error: {0}")]
    Store(String),

    /// Audit sink failure
    #[error("Audit error: {0}")]
    Audit(String),

    /// Policy collaborator failure (not a denial; the check itself broke)
    #[error("Policy check error: {0}")]
    Policy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
