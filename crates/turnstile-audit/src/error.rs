//! Error types for the audit event sink.

use thiserror::Error;

/// Errors that can occur while handling audit events.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to serialize an event.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
