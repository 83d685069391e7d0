//! Error types for passgate-core
//!
//! Store and gate failures are "unavailable" outcomes: the caller re-prompts
//! the user. Token rejections are not errors at all, see
//! [`crate::token::TokenRejection`].

use thiserror::Error;

/// Errors raised by a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or a transaction failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A uniqueness constraint was violated (e.g. token string already recorded)
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Build an `Unavailable` error from a backend error with context
    pub fn backend(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable(format!("{}: {}", context, err))
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors raised by the transport sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("destination rejected message: {0}")]
    Rejected(String),
}

/// Errors surfaced by the access flow and service layer
#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// External redirect service returned a failure
    #[error("external gate failed: {0}")]
    GateFailed(String),

    /// External redirect service did not answer in time
    #[error("external gate timed out after {0}ms")]
    GateTimeout(u64),

    #[error(transparent)]
    Token(#[from] crate::token::TokenError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Whether the user should be invited to try again
    pub fn is_retryable(&self) -> bool {
        match self {
            GateError::Store(StoreError::Unavailable(_))
            | GateError::GateFailed(_)
            | GateError::GateTimeout(_) => true,
            GateError::Store(_) | GateError::Token(_) | GateError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GateError::GateTimeout(10_000).is_retryable());
        assert!(GateError::GateFailed("bad status".into()).is_retryable());
        assert!(GateError::Store(StoreError::Unavailable("io".into())).is_retryable());
        assert!(!GateError::Store(StoreError::Serialization("eof".into())).is_retryable());
        assert!(!GateError::Config("missing secret".into()).is_retryable());
    }

    #[test]
    fn test_backend_context() {
        let err = StoreError::backend("Failed to begin write", "disk full");
        assert_eq!(err.to_string(), "store unavailable: Failed to begin write: disk full");
    }
}
