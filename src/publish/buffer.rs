use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::PublishOptions;

/// Wire form of a buffered value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub value: Value,
    /// Epoch milliseconds
    pub ts: i64,
}

impl Envelope {
    pub fn new(value: Value, ts: i64) -> Self {
        Self { value, ts }
    }

    pub fn now(value: Value) -> Self {
        Self::new(value, Utc::now().timestamp_millis())
    }
}

/// Bounded FIFO for one topic, the oldest entry is evicted when full
#[derive(Debug, Clone)]
pub struct TopicBuffer {
    capacity: usize,
    options: PublishOptions,
    queue: VecDeque<Envelope>,
}

impl TopicBuffer {
    pub fn new(capacity: usize, options: PublishOptions) -> Self {
        Self {
            capacity,
            options,
            queue: VecDeque::with_capacity(capacity),
        }
    }

    /// Applies the latest descriptor settings, trimming from the front if needed
    pub fn reconfigure(&mut self, capacity: usize, options: PublishOptions) -> usize {
        self.capacity = capacity;
        self.options = options;
        let mut evicted = 0;
        while self.queue.len() > self.capacity {
            self.queue.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Returns the evicted entry, if any
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        if self.capacity == 0 {
            return Some(envelope);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(envelope);
        evicted
    }

    /// Empties the queue and returns its entries, oldest first
    pub fn take(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn options(&self) -> PublishOptions {
        self.options
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }
}
