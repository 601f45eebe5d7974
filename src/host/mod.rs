//! Host link: line-delimited JSON commands in, events out

pub mod stdio;

pub use stdio::{read_commands, write_events};
