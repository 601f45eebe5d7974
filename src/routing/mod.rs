//! Topic routing: which channels, node children and command descriptors a
//! broker topic feeds, and which extra channel publishes a device property.

pub mod routing_table;

pub use routing_table::{ExtraRoute, NodeChild, NodeEntry, RoutingTable, TopicChange};
