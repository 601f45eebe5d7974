//! Error definitions for the bridge engine

use crate::expr::ExprError;
use crate::mqtt::connection::ConnectionState;
use crate::transform::TransformError;
use thiserror::Error;

/// Errors surfaced by the bridge library
///
/// Per-message faults (bad payloads, failing scripts or expressions) are logged
/// at the dispatch site and never reach the caller as a `BridgeError`. What does
/// reach the caller either stops the run loop or is a configuration problem.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker client refused a request (request queue full or closed)
    #[error("Broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Subscribe failed while subscribe failures are configured as fatal
    #[error("Subscribe failed for {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Unsubscribe failed while subscribe failures are configured as fatal
    #[error("Unsubscribe failed for {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Communication with the host side of the bridge failed
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Background task failure
    #[error("Task error: {0}")]
    ThreadError(String),
}
