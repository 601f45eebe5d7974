//! # Message Transformer
//!
//! Turns a raw `(topic, payload)` pair from the broker into host events:
//!
//! - fan-out topics emit one data event per channel id with the payload as is,
//!   or an archive batch when the payload is a JSON array of `{value, ts}`
//! - node topics run the registered transform and emit one event per child
//! - topics that only carry command descriptors emit at most one command event
//!
//! Per-message faults are logged here and never escape [`MessageTransformer::transform`].

pub mod error;
pub mod message_transformer;
pub mod node_script;
pub mod timestamp;

pub use error::TransformError;
pub use message_transformer::{Dispatch, MessageTransformer, TransformSettings};
pub use node_script::{FnTransform, JsonFieldsTransform, NodeOutput, NodeResult, NodeTransform, TransformRegistry};
pub use timestamp::parse_timestamp;
