//! Error types for crescendo-api
//!
//! Defines service-specific error types using thiserror for clear error
//! propagation. Webhook handlers map these onto the HTTP status contract:
//! malformed payload -> 400, referenced entity missing -> 404 (provider
//! retries later), anything else -> 500.

use thiserror::Error;

/// Main error type for the crescendo-api service
#[derive(Error, Debug)]
pub enum Error {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Errors bubbled up from the common library
    #[error(transparent)]
    Common(#[from] crescendo_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Webhook payload missing required fields or unparseable
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Referenced local record does not exist yet (provider should retry)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Split set passed to a bulk update spans more than one revision
    #[error("Splits span revisions for song {0}")]
    MixedRevisions(i64),

    /// Outbound HTTP (staging forward, purchase verification) failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Result alias for service operations
pub type Result<T> = std::result::Result<T, Error>;
