//! Error definitions for payload transformation

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// No transform registered under this name
    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Transform {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Transform {0} panicked")]
    Panicked(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
