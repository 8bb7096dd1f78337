//! Error types for the compliance core.

use thiserror::Error;

/// Result type alias for compliance operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for compliance operations.
///
/// Policy denials (rate limit exceeded, missing consent, unsubscribed
/// recipient) are **not** errors — they are returned as structured
/// decision values. This enum covers operational failures and invalid
/// request states only.
#[derive(Debug, Error)]
pub enum Error {
    /// Persistent store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Workflow invariant violation (e.g. confirming a completed deletion)
    #[error("Invalid request state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Export artifact failure
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
