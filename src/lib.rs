//! MQTT bridge for a host automation server.
//!
//! Broker messages become structured data, archive and command events for the
//! host. Host device values and commands go out to the broker, buffered while
//! the link is down. A scan mode streams the live topic namespace as a tree.

pub mod config;
pub mod error;
pub mod expr;
pub mod host;
pub mod model;
pub mod mqtt;
pub mod publish;
pub mod routing;
pub mod scan;
pub mod transform;

pub use config::BridgeConfig;
pub use error::BridgeError;
