//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Deterministic failures only (malformed caller input, unparsable identifiers or
/// statuses). Storage and runtime concerns belong to the crates built on top.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Caller-supplied input failed validation (e.g. mismatched parallel lengths).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted status string did not match any known variant.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// A value could not be serialized to or from JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_status(msg: impl Into<String>) -> Self {
        Self::InvalidStatus(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
