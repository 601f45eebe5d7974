//! Broker boundary used by the engine
//!
//! The engine never talks to `rumqttc` directly; it goes through [`BrokerLink`]
//! so the dispatch logic can be driven without a broker in tests.

use rumqttc::{AsyncClient, QoS, SubscribeFilter};

use crate::error::BridgeError;
use crate::model::PublishOptions;

pub fn qos_from_u8(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Non-blocking requests to the broker connection
pub trait BrokerLink: Send {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BridgeError>;

    /// One SUBSCRIBE request for all `topics`
    fn subscribe_many(&mut self, topics: &[String], qos: QoS) -> Result<(), BridgeError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BridgeError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> Result<(), BridgeError>;

    fn disconnect(&mut self) -> Result<(), BridgeError>;
}

impl BrokerLink for AsyncClient {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BridgeError> {
        self.try_subscribe(topic, qos)?;
        Ok(())
    }

    fn subscribe_many(&mut self, topics: &[String], qos: QoS) -> Result<(), BridgeError> {
        self.try_subscribe_many(
            topics
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), qos)),
        )?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        self.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        options: PublishOptions,
    ) -> Result<(), BridgeError> {
        self.try_publish(
            topic,
            qos_from_u8(options.qos),
            options.retain,
            payload.as_bytes().to_vec(),
        )?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BridgeError> {
        self.try_disconnect()?;
        Ok(())
    }
}
