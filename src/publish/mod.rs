//! Outbound publishing and the offline buffers used while the broker is away

pub mod buffer;
pub mod publish_manager;

pub use buffer::{Envelope, TopicBuffer};
pub use publish_manager::{format_outgoing, PublishManager, PublishOutcome};
