//! # Topic discovery
//!
//! Operator-triggered scan of the broker namespace. While a session is active
//! the bridge is subscribed to the scan wildcard and every message feeds a
//! [`TopicTree`]; clients receive a full snapshot once and incremental diffs
//! afterwards.

pub mod scan_session;
pub mod topic_tree;

pub use scan_session::{ScanEvent, ScanSession, ScanStart, ScanState, Scanner};
pub use topic_tree::{TopicTree, TreeChange, TreeNode};
