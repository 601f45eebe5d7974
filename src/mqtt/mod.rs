//! # Broker Connection
//!
//! Everything that touches the MQTT broker lives here. The engine in
//! `mqtt_handler` owns the routing state and reacts to host commands and broker
//! events; `mqtt_handle` runs it as a tokio task next to the `rumqttc` event
//! loop and handles reconnects.
//!
//! ```text
//! mqtt/
//! ├── broker_link.rs   - request trait over the client, test recorder
//! ├── config.rs        - MqttOptions from the broker section of the config
//! ├── connection.rs    - connection states, transition table, counters
//! ├── mqtt_handle.rs   - task spawn, event loop, reconnect timer
//! └── mqtt_handler.rs  - command and event dispatch
//! ```
//!
//! ## Connection Lifecycle
//!
//! The task starts in `connecting`. Every ConnAck moves to `connected` and
//! re-runs the entry actions: publish the online message, flush offline
//! buffers, subscribe every routed topic. Transport errors move to `offline`
//! (network trouble) or `error` (refused, protocol). After the configured
//! delay the loop polls again, which makes `rumqttc` reconnect.
//!
//! Channels are marked `link_down` once per outage, on the first transition
//! into a degraded state.

pub mod broker_link;
pub mod config;
pub mod connection;
pub mod mqtt_handle;
pub mod mqtt_handler;

pub use broker_link::BrokerLink;
pub use connection::{ConnectionLifecycle, ConnectionState, MqttStatus};
pub use mqtt_handle::MqttHandle;
pub use mqtt_handler::{Flow, HandlerSettings, MqttHandler};
