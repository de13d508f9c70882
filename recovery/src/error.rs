//! Error types for the recovery layer itself.
//!
//! Failures of wrapped operations are not represented here; those travel back
//! to the caller inside [`crate::RecoveryResult`] with their original type.

use thiserror::Error;

/// Recovery result type alias
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Errors raised by the recovery layer and its backend collaborators.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Retry policy failed validation.
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),

    /// HTTP request to the backend failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// There is no stored session that could be refreshed.
    #[error("No active session to refresh")]
    NoSession,

    /// The refresh endpoint answered with a non-success status.
    #[error("Session refresh rejected with status {status}: {body}")]
    RefreshRejected { status: u16, body: String },

    /// The connectivity probe got an answer, but not a healthy one.
    #[error("Backend unhealthy: HTTP {0}")]
    Unhealthy(u16),

    /// The backend answered with a body we could not make sense of.
    #[error("Invalid session response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
