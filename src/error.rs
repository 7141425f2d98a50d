//! Error types for pulse-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed job (unknown kind, missing or mistyped payload field).
    /// Never retried.
    #[error("invalid job payload: {0}")]
    Validation(String),

    #[error("broker handle is closed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a job failing with this error should be retried.
    ///
    /// Infrastructure failures (store or broker unreachable) are transient;
    /// payload and state errors will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_) | Error::InvalidTransition { .. } | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
