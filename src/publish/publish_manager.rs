use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::expr::{strip_quotes, value_to_text, ExprError};
use crate::model::PublishOptions;
use crate::mqtt::broker_link::BrokerLink;
use crate::mqtt::connection::ConnectionState;
use crate::publish::buffer::{Envelope, TopicBuffer};
use crate::routing::ExtraRoute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Buffered,
    Dropped,
}

/// Value as it goes onto the wire for a publish descriptor: calc applied,
/// one pair of surrounding quotes stripped from strings
pub fn format_outgoing(route: &ExtraRoute, value: &Value) -> Result<Value, ExprError> {
    let formatted = match &route.calc {
        Some(calc) => calc.eval(value)?.to_json(),
        None => value.clone(),
    };
    Ok(match formatted {
        Value::String(s) => Value::String(strip_quotes(&s).to_string()),
        other => other,
    })
}

fn send<L: BrokerLink + ?Sized>(
    link: &mut L,
    topic: &str,
    message: &str,
    options: PublishOptions,
) -> bool {
    match link.publish(topic, message, options) {
        Ok(()) => {
            debug!("PUBLISH: {} {}", topic, message);
            true
        }
        Err(e) => {
            error!("Publish to {} failed: {}", topic, e);
            false
        }
    }
}

/// Outbound delivery with per-topic offline buffers
#[derive(Debug, Default)]
pub struct PublishManager {
    buffers: IndexMap<String, TopicBuffer>,
}

impl PublishManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, failures are logged only
    pub fn publish<L: BrokerLink + ?Sized>(
        &self,
        link: &mut L,
        topic: &str,
        message: &str,
        options: PublishOptions,
    ) -> bool {
        send(link, topic, message, options)
    }

    /// With `buffer_length > 0` the payload is a `{value, ts}` envelope and is
    /// buffered whenever it cannot be sent. Without a buffer, values that
    /// cannot be sent are dropped.
    pub fn publish_or_buffer<L: BrokerLink + ?Sized>(
        &mut self,
        link: &mut L,
        state: ConnectionState,
        topic: &str,
        value: Value,
        options: PublishOptions,
        buffer_length: usize,
    ) -> PublishOutcome {
        let connected = state == ConnectionState::Connected;

        if buffer_length == 0 {
            let message = value_to_text(&value);
            if connected && send(link, topic, &message, options) {
                return PublishOutcome::Sent;
            }
            debug!("Dropping {} for {} ({}, no buffer)", message, topic, state);
            return PublishOutcome::Dropped;
        }

        let envelope = Envelope::now(value);
        if connected {
            match serde_json::to_string(&envelope) {
                Ok(message) => {
                    if send(link, topic, &message, options) {
                        return PublishOutcome::Sent;
                    }
                }
                Err(e) => error!("Failed to serialize envelope for {}: {}", topic, e),
            }
        }

        self.buffer(topic, envelope, options, buffer_length);
        PublishOutcome::Buffered
    }

    fn buffer(&mut self, topic: &str, envelope: Envelope, options: PublishOptions, capacity: usize) {
        let buffer = self
            .buffers
            .entry(topic.to_string())
            .or_insert_with(|| TopicBuffer::new(capacity, options));
        let trimmed = buffer.reconfigure(capacity, options);
        if trimmed > 0 {
            debug!("Buffer for {} shrunk, {} old entries dropped", topic, trimmed);
        }
        if let Some(evicted) = buffer.push(envelope) {
            trace!("Buffer for {} full, evicted entry from {}", topic, evicted.ts);
        }
        trace!("Buffered for {}: {}/{}", topic, buffer.len(), buffer.capacity());
    }

    /// Publishes every non-empty buffer as one JSON array, in the order the
    /// topics were first buffered. Queues are emptied whether or not the
    /// publish succeeds. Returns the number of topics flushed.
    pub fn flush<L: BrokerLink + ?Sized>(&mut self, link: &mut L) -> usize {
        let mut flushed = 0;
        for (topic, buffer) in self.buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let options = buffer.options();
            let batch = buffer.take();
            match serde_json::to_string(&batch) {
                Ok(payload) => {
                    if send(link, topic, &payload, options) {
                        flushed += 1;
                    } else {
                        warn!("Flush of {} failed, {} buffered values lost", topic, batch.len());
                    }
                }
                Err(e) => error!("Failed to serialize buffer for {}: {}", topic, e),
            }
        }
        if flushed > 0 {
            info!("Flushed offline buffers of {} topics", flushed);
        }
        flushed
    }

    pub fn buffer_for(&self, topic: &str) -> Option<&TopicBuffer> {
        self.buffers.get(topic)
    }

    /// Values waiting across all topics
    pub fn pending(&self) -> usize {
        self.buffers.values().map(TopicBuffer::len).sum()
    }
}
