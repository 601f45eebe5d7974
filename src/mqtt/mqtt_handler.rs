//! Dispatch engine between broker and host
//!
//! [`MqttHandler`] owns every piece of routing state and reacts to two kinds of
//! input: host commands and broker events. It is driven from a single task,
//! so none of its state needs locking. Host events collect in an outbox that
//! the run loop hands to the host with backpressure.

use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::expr::render_template;
use crate::model::{
    ActItem, Channel, ChannelRef, ChannelStatus, ChannelUpdate, DeviceValue, ExtraChannel,
    ExtraChannelUpdate, ExtraKind, HostCommand, HostEvent, PublishItem, PublishOptions,
};
use crate::mqtt::broker_link::{qos_from_u8, BrokerLink};
use crate::mqtt::connection::{ConnectionLifecycle, ConnectionState, MqttStatus};
use crate::publish::{format_outgoing, PublishManager, PublishOutcome};
use crate::routing::{ExtraRoute, RoutingTable, TopicChange};
use crate::scan::{ScanStart, Scanner};
use crate::transform::MessageTransformer;

/// Filters per SUBSCRIBE request when resubscribing
const SUBSCRIBE_BATCH: usize = 32;

/// Whether the run loop keeps going after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Message published to the will topic on every connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineMessage {
    pub topic: String,
    pub payload: String,
    pub options: PublishOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    pub subscribe_qos: u8,
    pub fatal_subscribe_errors: bool,
    pub scan_topic: String,
    pub scan_grace: Duration,
    pub online: Option<OnlineMessage>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            subscribe_qos: 0,
            fatal_subscribe_errors: false,
            scan_topic: "#".to_string(),
            scan_grace: Duration::from_millis(1000),
            online: None,
        }
    }
}

impl HandlerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        let online = config.broker.will.as_ref().and_then(|will| {
            let payload = will.online_payload.clone()?;
            (!will.topic.is_empty()).then(|| OnlineMessage {
                topic: will.topic.clone(),
                payload,
                options: PublishOptions {
                    qos: will.qos,
                    retain: will.retain,
                },
            })
        });
        Self {
            subscribe_qos: config.bridge.subscribe_qos,
            fatal_subscribe_errors: config.bridge.fatal_subscribe_errors,
            scan_topic: config.bridge.scan_topic.clone(),
            scan_grace: config.bridge.scan_grace(),
            online,
        }
    }
}

pub struct MqttHandler<L: BrokerLink> {
    link: L,
    routing: RoutingTable,
    transformer: MessageTransformer,
    publisher: PublishManager,
    lifecycle: ConnectionLifecycle,
    scanner: Scanner,
    settings: HandlerSettings,
    outbox: Vec<HostEvent>,
    scan_deadline: Option<Instant>,
}

impl<L: BrokerLink> MqttHandler<L> {
    pub fn new(link: L, settings: HandlerSettings, transformer: MessageTransformer) -> Self {
        let scanner = Scanner::new(settings.scan_topic.clone());
        MqttHandler {
            link,
            routing: RoutingTable::new(),
            transformer,
            publisher: PublishManager::new(),
            lifecycle: ConnectionLifecycle::new(),
            scanner,
            settings,
            outbox: Vec::new(),
            scan_deadline: None,
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.watch()
    }

    pub fn status(&self) -> &MqttStatus {
        self.lifecycle.status()
    }

    pub fn publisher(&self) -> &PublishManager {
        &self.publisher
    }

    /// When the running scan grace period ends
    pub fn scan_deadline(&self) -> Option<Instant> {
        self.scan_deadline
    }

    /// Takes the host events produced since the last call, oldest first
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn emit(&mut self, event: HostEvent) {
        self.outbox.push(event);
    }

    fn emit_state_change(&mut self, changed: bool) {
        if changed {
            self.emit(HostEvent::Connection {
                state: self.lifecycle.state(),
            });
        }
    }

    // ---- broker requests ----

    fn subscribe_qos(&self) -> QoS {
        qos_from_u8(self.settings.subscribe_qos)
    }

    fn subscribe_failed(&self, topic: String, e: BridgeError) -> Result<(), BridgeError> {
        if self.settings.fatal_subscribe_errors {
            return Err(BridgeError::Subscribe {
                topic,
                reason: e.to_string(),
            });
        }
        error!("Subscribe to {} failed: {}", topic, e);
        Ok(())
    }

    fn subscribe_topic(&mut self, topic: &str) -> Result<(), BridgeError> {
        if !self.lifecycle.is_connected() {
            debug!("Not connected, {} will be subscribed on connect", topic);
            return Ok(());
        }
        info!("SUBSCRIBE: {}", topic);
        let qos = self.subscribe_qos();
        match self.link.subscribe(topic, qos) {
            Ok(()) => Ok(()),
            Err(e) => self.subscribe_failed(topic.to_string(), e),
        }
    }

    /// Subscribes `topics` with as few requests as possible
    fn subscribe_topics(&mut self, topics: &[String]) -> Result<(), BridgeError> {
        if !self.lifecycle.is_connected() {
            debug!("Not connected, {} topics wait for connect", topics.len());
            return Ok(());
        }
        let qos = self.subscribe_qos();
        for batch in topics.chunks(SUBSCRIBE_BATCH) {
            let joined = batch.join(", ");
            info!("SUBSCRIBE: {}", joined);
            if let Err(e) = self.link.subscribe_many(batch, qos) {
                self.subscribe_failed(joined, e)?;
            }
        }
        Ok(())
    }

    fn unsubscribe_topic(&mut self, topic: &str) -> Result<(), BridgeError> {
        if !self.lifecycle.is_connected() {
            debug!("Not connected, skipping unsubscribe of {}", topic);
            return Ok(());
        }
        info!("UNSUBSCRIBE: {}", topic);
        match self.link.unsubscribe(topic) {
            Ok(()) => Ok(()),
            Err(e) if self.settings.fatal_subscribe_errors => Err(BridgeError::Unsubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => {
                error!("Unsubscribe from {} failed: {}", topic, e);
                Ok(())
            }
        }
    }

    fn apply_change(&mut self, change: TopicChange) -> Result<(), BridgeError> {
        if let Some(topic) = change.unsubscribe {
            self.unsubscribe_topic(&topic)?;
        }
        if let Some(topic) = change.subscribe {
            self.subscribe_topic(&topic)?;
        }
        Ok(())
    }

    /// Every routed topic plus the scan wildcard while a scan runs
    fn subscribe_routes(&mut self) -> Result<(), BridgeError> {
        let mut topics = self.routing.topics();
        if self.scanner.is_active() && !topics.contains(&self.settings.scan_topic) {
            topics.push(self.settings.scan_topic.clone());
        }
        self.subscribe_topics(&topics)
    }

    // ---- channels ----

    /// Bulk initial load; also used for incremental adds
    pub fn load_channels(&mut self, channels: Vec<Channel>) -> Result<(), BridgeError> {
        for channel in channels {
            if let Some(topic) = self.routing.register_channel(&channel) {
                self.subscribe_topic(&topic)?;
            }
        }
        Ok(())
    }

    pub fn update_channels(&mut self, updates: Vec<ChannelUpdate>) -> Result<(), BridgeError> {
        for update in updates {
            let change = self.routing.update_channel(&update.old_id, &update.channel);
            self.apply_change(change)?;
        }
        Ok(())
    }

    pub fn delete_channels(&mut self, refs: Vec<ChannelRef>) -> Result<(), BridgeError> {
        for channel in refs {
            if self.routing.find_topic_for_channel(&channel.old_id).is_none() {
                debug!("Delete of unknown channel {}", channel.old_id);
                continue;
            }
            if let Some(topic) = self.routing.unregister_channel(&channel.old_id) {
                self.unsubscribe_topic(&topic)?;
            }
        }
        Ok(())
    }

    // ---- extra channels ----

    /// Bulk initial load; tells the host which devices to stream
    pub fn load_extra(&mut self, items: Vec<ExtraChannel>) -> Result<(), BridgeError> {
        self.add_extra_items(items)?;
        self.emit_device_filter();
        Ok(())
    }

    fn add_extra_items(&mut self, items: Vec<ExtraChannel>) -> Result<bool, BridgeError> {
        let mut publish_changed = false;
        for item in items {
            let id = item.id.clone();
            let route = match ExtraRoute::compile(item) {
                Ok(route) => route,
                Err(e) => {
                    warn!("Extra channel {} has an invalid calc expression: {}", id, e);
                    continue;
                }
            };
            match route.descriptor.kind {
                ExtraKind::Publish => publish_changed |= self.routing.register_publish_target(route),
                ExtraKind::Set | ExtraKind::Cmd => {
                    if let Some(topic) = self.routing.register_command(route) {
                        self.subscribe_topic(&topic)?;
                    }
                }
            }
        }
        Ok(publish_changed)
    }

    fn remove_extra(&mut self, id: &str) -> Result<bool, BridgeError> {
        if let Some(topic) = self.routing.unregister_command(id) {
            self.unsubscribe_topic(&topic)?;
        }
        Ok(self.routing.unregister_publish_target(id))
    }

    pub fn add_extra(&mut self, items: Vec<ExtraChannel>) -> Result<(), BridgeError> {
        if self.add_extra_items(items)? {
            self.emit_device_filter();
        }
        Ok(())
    }

    pub fn update_extra(&mut self, updates: Vec<ExtraChannelUpdate>) -> Result<(), BridgeError> {
        let mut publish_changed = false;
        for update in updates {
            let new_id = update.extra.id.clone();
            let old_id = update.old_id;
            let is_command = matches!(update.extra.kind, ExtraKind::Set | ExtraKind::Cmd);
            if is_command && self.routing.has_command(&old_id) {
                match ExtraRoute::compile(update.extra) {
                    Ok(route) => {
                        let change = self.routing.update_command(&old_id, route);
                        self.apply_change(change)?;
                        publish_changed |= self.routing.unregister_publish_target(&old_id);
                    }
                    Err(e) => warn!(
                        "Extra channel {} has an invalid calc expression, keeping {}: {}",
                        new_id, old_id, e
                    ),
                }
                continue;
            }
            // Register first so a command topic that stays the same is not unsubscribed
            if old_id == new_id {
                publish_changed |= self.remove_extra(&old_id)?;
                publish_changed |= self.add_extra_items(vec![update.extra])?;
            } else {
                publish_changed |= self.add_extra_items(vec![update.extra])?;
                publish_changed |= self.remove_extra(&old_id)?;
            }
        }
        if publish_changed {
            self.emit_device_filter();
        }
        Ok(())
    }

    pub fn delete_extra(&mut self, refs: Vec<ChannelRef>) -> Result<(), BridgeError> {
        let mut publish_changed = false;
        for item in refs {
            publish_changed |= self.remove_extra(&item.old_id)?;
        }
        if publish_changed {
            self.emit_device_filter();
        }
        Ok(())
    }

    fn emit_device_filter(&mut self) {
        let device_ids = self.routing.publish_device_ids();
        if device_ids.is_empty() {
            return;
        }
        debug!("Device filter: {}", device_ids.join(","));
        self.emit(HostEvent::DeviceFilter { device_ids });
    }

    // ---- host commands ----

    pub fn handle_command(&mut self, command: HostCommand) -> Result<Flow, BridgeError> {
        match command {
            HostCommand::AddChannels { data } => self.load_channels(data)?,
            HostCommand::UpdateChannels { data } => self.update_channels(data)?,
            HostCommand::DeleteChannels { data } => self.delete_channels(data)?,
            HostCommand::AddExtra { data } => self.add_extra(data)?,
            HostCommand::UpdateExtra { data } => self.update_extra(data)?,
            HostCommand::DeleteExtra { data } => self.delete_extra(data)?,
            HostCommand::Act { data } => self.act(data),
            HostCommand::Sub { data } => self.device_values(data),
            HostCommand::Publish { data } => self.publish_items(data.into_vec()),
            HostCommand::Scan { stop: true, .. } => self.scan_stop()?,
            HostCommand::Scan { uuid: Some(uuid), .. } => self.scan_request(uuid)?,
            HostCommand::Scan { .. } => warn!("Scan request without uuid ignored"),
            HostCommand::Exit => {
                info!("Exit requested by host");
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn count_sent(&mut self, sent: bool) {
        let status = self.lifecycle.status_mut();
        if sent {
            status.messages_sent += 1;
        } else {
            status.dropped += 1;
        }
    }

    /// Outbound commands rendered from message templates
    pub fn act(&mut self, items: Vec<ActItem>) {
        for item in items {
            if item.topic.is_empty() {
                warn!("Act item without topic ignored");
                continue;
            }
            let message = match render_template(item.message.as_deref(), &item.value) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Act template for {} failed: {}", item.topic, e);
                    continue;
                }
            };
            let sent =
                self.publisher
                    .publish(&mut self.link, &item.topic, &message, PublishOptions::default());
            self.count_sent(sent);
        }
    }

    /// Device state notifications for the publish map
    pub fn device_values(&mut self, items: Vec<DeviceValue>) {
        let state = self.lifecycle.state();
        for item in items {
            let Some(route) = self.routing.publish_target(&item.device_id, &item.property) else {
                trace!("No publish target for {}.{}", item.device_id, item.property);
                continue;
            };
            let value = match format_outgoing(route, &item.value) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Calc for {}.{} failed on {}: {}",
                        item.device_id, item.property, item.value, e
                    );
                    continue;
                }
            };
            let topic = route.descriptor.topic.clone();
            let options = route.descriptor.options();
            let buffer_length = route.descriptor.buffer_length;

            let outcome = self.publisher.publish_or_buffer(
                &mut self.link,
                state,
                &topic,
                value,
                options,
                buffer_length,
            );
            let status = self.lifecycle.status_mut();
            match outcome {
                PublishOutcome::Sent => status.messages_sent += 1,
                PublishOutcome::Buffered => status.buffered += 1,
                PublishOutcome::Dropped => status.dropped += 1,
            }
        }
    }

    pub fn publish_items(&mut self, items: Vec<PublishItem>) {
        for item in items {
            if item.topic.is_empty() {
                warn!("Publish item without topic ignored");
                continue;
            }
            if item.message.is_empty() {
                debug!("Publish to {} without message ignored", item.topic);
                continue;
            }
            let sent = self
                .publisher
                .publish(&mut self.link, &item.topic, &item.message, item.options);
            self.count_sent(sent);
        }
    }

    // ---- scan ----

    pub fn scan_request(&mut self, uuid: String) -> Result<(), BridgeError> {
        match self.scanner.request(uuid) {
            ScanStart::Started => {
                self.scan_deadline = Some(Instant::now() + self.settings.scan_grace);
                let topic = self.settings.scan_topic.clone();
                self.subscribe_topic(&topic)?;
            }
            ScanStart::Joined => {}
            ScanStart::Snapshot(event) => self.emit(HostEvent::Scan(event)),
        }
        Ok(())
    }

    pub fn scan_stop(&mut self) -> Result<(), BridgeError> {
        self.scan_deadline = None;
        if !self.scanner.stop() {
            debug!("Scan stop without active session");
            return Ok(());
        }
        let topic = self.settings.scan_topic.clone();
        self.unsubscribe_topic(&topic)?;
        self.subscribe_routes()
    }

    pub fn on_scan_grace_elapsed(&mut self) {
        self.scan_deadline = None;
        for event in self.scanner.grace_expired() {
            self.emit(HostEvent::Scan(event));
        }
    }

    // ---- broker events ----

    pub fn on_connecting(&mut self) {
        match self.lifecycle.transition(ConnectionState::Connecting) {
            Ok(changed) => self.emit_state_change(changed),
            Err(e) => warn!("{}", e),
        }
    }

    /// Runs on every ConnAck, including reconnects done by the transport
    pub fn on_connected(&mut self) -> Result<(), BridgeError> {
        match self.lifecycle.transition(ConnectionState::Connected) {
            Ok(changed) => self.emit_state_change(changed),
            Err(e) => warn!("{}", e),
        }
        self.lifecycle.touch();

        if let Some(online) = self.settings.online.clone() {
            let sent =
                self.publisher
                    .publish(&mut self.link, &online.topic, &online.payload, online.options);
            self.count_sent(sent);
        }

        let flushed = self.publisher.flush(&mut self.link);
        if flushed > 0 {
            self.lifecycle.status_mut().messages_sent += flushed;
        }

        self.subscribe_routes()
    }

    /// Connection lost or refused; `state` is one of the degraded states
    pub fn on_transport_fault(&mut self, state: ConnectionState, reason: &str) {
        warn!("Broker connection {}: {}", state, reason);
        self.lifecycle.record_error(reason);
        match self.lifecycle.transition(state) {
            Ok(changed) => self.emit_state_change(changed),
            Err(e) => {
                warn!("{}", e);
                return;
            }
        }

        if self.lifecycle.take_degraded_notification() {
            let ids = self.routing.channel_ids();
            if !ids.is_empty() {
                debug!("Marking {} channels as link down", ids.len());
                self.emit(HostEvent::Status {
                    ids,
                    status: ChannelStatus::LinkDown,
                });
            }
        }
    }

    pub fn on_message(&mut self, topic: &str, payload: &str) {
        trace!("GET: {} {}", topic, payload);
        let status = self.lifecycle.status_mut();
        status.messages_received += 1;
        self.lifecycle.touch();

        if self.scanner.is_active() {
            for event in self.scanner.process(topic, payload) {
                self.emit(HostEvent::Scan(event));
            }
        }

        let scenes: Vec<String> = self
            .routing
            .start_scenes(topic)
            .map(|(_, scene_id)| scene_id.to_string())
            .collect();
        for id in scenes {
            self.emit(HostEvent::StartScene {
                id,
                topic: topic.to_string(),
                message: payload.to_string(),
            });
        }

        let dispatch = self.transformer.transform(&self.routing, topic, payload);
        if !dispatch.data.is_empty() {
            self.emit(HostEvent::Data {
                data: dispatch.data,
            });
        }
        if !dispatch.archive.is_empty() {
            self.emit(HostEvent::Archive {
                data: dispatch.archive,
            });
        }
        if let Some(command) = dispatch.command {
            self.emit(HostEvent::Command(command));
        }
    }

    /// Broker answer to a subscribe; `failures` counts rejected filters
    pub fn on_suback(&mut self, pkid: u16, failures: usize) -> Result<(), BridgeError> {
        if failures == 0 {
            trace!("SubAck {} ok", pkid);
            return Ok(());
        }
        let reason = format!("broker rejected {} filter(s)", failures);
        if self.settings.fatal_subscribe_errors {
            return Err(BridgeError::Subscribe {
                topic: format!("pkid {}", pkid),
                reason,
            });
        }
        error!("SubAck {}: {}", pkid, reason);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Err(e) = self.link.disconnect() {
            debug!("Disconnect request failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandEvent, CommandKind, DataEvent, OneOrMany};
    use crate::mqtt::broker_link::testing::{LinkCall, RecordingLink};
    use crate::scan::{ScanEvent, TreeNode};
    use crate::transform::{TransformRegistry, TransformSettings};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transformer() -> MessageTransformer {
        MessageTransformer::new(TransformSettings::default(), TransformRegistry::with_builtins())
    }

    fn handler_with(settings: HandlerSettings) -> MqttHandler<RecordingLink> {
        MqttHandler::new(RecordingLink::default(), settings, transformer())
    }

    fn handler() -> MqttHandler<RecordingLink> {
        handler_with(HandlerSettings::default())
    }

    fn connect(handler: &mut MqttHandler<RecordingLink>) {
        handler.on_connecting();
        handler.on_connected().unwrap();
    }

    fn drain<L: BrokerLink>(handler: &mut MqttHandler<L>) -> Vec<HostEvent> {
        handler.drain_events()
    }

    fn collect_ids(nodes: &[TreeNode], out: &mut Vec<String>) {
        for node in nodes {
            out.push(node.id.clone());
            collect_ids(&node.children, out);
        }
    }

    fn publish_extra(id: &str, device: &str, buffer_length: usize) -> ExtraChannel {
        ExtraChannel {
            id: id.to_string(),
            topic: format!("out/{}", device),
            kind: ExtraKind::Publish,
            calc_expression: None,
            retain: false,
            qos: 0,
            buffer_length,
            device_id: Some(device.to_string()),
            property: Some("state".to_string()),
            trigger: None,
        }
    }

    fn cmd_extra(id: &str, topic: &str, trigger: &str) -> ExtraChannel {
        ExtraChannel {
            id: id.to_string(),
            topic: topic.to_string(),
            kind: ExtraKind::Cmd,
            calc_expression: None,
            retain: false,
            qos: 0,
            buffer_length: 0,
            device_id: Some("lamp1".to_string()),
            property: Some("toggle".to_string()),
            trigger: Some(trigger.to_string()),
        }
    }

    #[test]
    fn connect_publishes_online_flushes_then_subscribes() {
        let settings = HandlerSettings {
            online: Some(OnlineMessage {
                topic: "bridge/status".to_string(),
                payload: "online".to_string(),
                options: PublishOptions { qos: 1, retain: true },
            }),
            ..HandlerSettings::default()
        };
        let mut handler = handler_with(settings);
        handler
            .load_channels(vec![Channel::new("a", "t/1"), Channel::new("b", "t/2")])
            .unwrap();
        handler.load_extra(vec![publish_extra("p", "lamp", 5)]).unwrap();
        handler.device_values(vec![DeviceValue {
            device_id: "lamp".to_string(),
            property: "state".to_string(),
            value: json!(1),
        }]);
        // Offline: nothing reaches the broker yet
        assert!(handler.link.calls.is_empty());

        connect(&mut handler);

        let calls = &handler.link.calls;
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], LinkCall::Publish { topic, payload, .. } if topic == "bridge/status" && payload == "online"));
        assert!(matches!(&calls[1], LinkCall::Publish { topic, .. } if topic == "out/lamp"));
        assert_eq!(
            calls[2],
            LinkCall::SubscribeMany(vec!["t/1".to_string(), "t/2".to_string()])
        );

        let events = drain(&mut handler);
        assert_eq!(
            events[0],
            HostEvent::DeviceFilter {
                device_ids: vec!["lamp".to_string()]
            }
        );
        assert!(events.contains(&HostEvent::Connection {
            state: ConnectionState::Connected
        }));
    }

    #[test]
    fn reconnect_reruns_entry_actions() {
        let mut handler = handler();
        handler.load_channels(vec![Channel::new("a", "t/1")]).unwrap();
        connect(&mut handler);
        handler.link.clear();

        // Transport reconnected on its own, ConnAck arrives again
        handler.on_connected().unwrap();
        assert_eq!(handler.link.subscribed(), vec!["t/1".to_string()]);
    }

    #[test]
    fn rename_keeps_subscription_untouched() {
        let mut handler = handler();
        handler.load_channels(vec![Channel::new("a", "t/1")]).unwrap();
        connect(&mut handler);
        handler.link.clear();

        handler
            .handle_command(HostCommand::UpdateChannels {
                data: vec![ChannelUpdate {
                    old_id: "a".to_string(),
                    channel: Channel::new("a2", "t/1"),
                }],
            })
            .unwrap();
        assert!(handler.link.calls.is_empty());

        handler
            .handle_command(HostCommand::UpdateChannels {
                data: vec![ChannelUpdate {
                    old_id: "a2".to_string(),
                    channel: Channel::new("a2", "t/9"),
                }],
            })
            .unwrap();
        assert_eq!(
            handler.link.calls,
            vec![
                LinkCall::Unsubscribe("t/1".to_string()),
                LinkCall::Subscribe("t/9".to_string()),
            ]
        );
    }

    #[test]
    fn messages_become_data_and_scene_events() {
        let mut handler = handler();
        let mut bell = Channel::new("bell", "door/bell");
        bell.start_scene_id = Some("ring".to_string());
        handler.load_channels(vec![bell]).unwrap();
        connect(&mut handler);
        drain(&mut handler);

        handler.on_message("door/bell", "pressed");

        assert_eq!(
            drain(&mut handler),
            vec![
                HostEvent::StartScene {
                    id: "ring".to_string(),
                    topic: "door/bell".to_string(),
                    message: "pressed".to_string(),
                },
                HostEvent::Data {
                    data: vec![DataEvent::new("bell", json!("pressed"))]
                },
            ]
        );
        assert_eq!(handler.status().messages_received, 1);
    }

    #[test]
    fn cmd_topic_forwards_command_on_trigger_only() {
        let mut handler = handler();
        handler.load_extra(vec![cmd_extra("c", "cmd/lamp", "on")]).unwrap();
        connect(&mut handler);
        drain(&mut handler);

        handler.on_message("cmd/lamp", "off");
        assert!(drain(&mut handler).is_empty());

        handler.on_message("cmd/lamp", "on");
        assert_eq!(
            drain(&mut handler),
            vec![HostEvent::Command(CommandEvent {
                command: CommandKind::Device,
                device_id: "lamp1".to_string(),
                property: Some("toggle".to_string()),
                value: None,
            })]
        );
    }

    #[test]
    fn link_down_batch_once_per_outage() {
        let mut handler = handler();
        handler
            .load_channels(vec![Channel::new("a", "t/1"), Channel::new("b", "t/2")])
            .unwrap();
        connect(&mut handler);
        drain(&mut handler);

        handler.on_transport_fault(ConnectionState::Offline, "connection reset");
        handler.on_connecting();
        handler.on_transport_fault(ConnectionState::Error, "refused");

        let statuses: Vec<HostEvent> = drain(&mut handler)
            .into_iter()
            .filter(|e| matches!(e, HostEvent::Status { .. }))
            .collect();
        assert_eq!(
            statuses,
            vec![HostEvent::Status {
                ids: vec!["a".to_string(), "b".to_string()],
                status: ChannelStatus::LinkDown,
            }]
        );
        assert_eq!(handler.status().last_error.as_deref(), Some("refused"));

        handler.on_connected().unwrap();
        handler.on_transport_fault(ConnectionState::Disconnected, "broker shutdown");
        assert!(drain(&mut handler)
            .iter()
            .any(|e| matches!(e, HostEvent::Status { .. })));
    }

    #[test]
    fn scan_session_round_trip() {
        let mut handler = handler();
        handler.load_channels(vec![Channel::new("a", "t/1")]).unwrap();
        connect(&mut handler);
        handler.link.clear();
        drain(&mut handler);

        handler
            .handle_command(HostCommand::Scan {
                uuid: Some("u1".to_string()),
                stop: false,
            })
            .unwrap();
        assert_eq!(handler.link.subscribed(), vec!["#".to_string()]);
        assert!(handler.scan_deadline().is_some());

        handler.on_message("x/y", "1");
        // Collecting: unknown topic produces nothing yet
        assert!(drain(&mut handler).is_empty());

        handler.on_scan_grace_elapsed();
        let events = drain(&mut handler);
        let listed = match &events[..] {
            [HostEvent::Scan(ScanEvent::List { uuid, data })] if uuid == "u1" => {
                let mut ids = Vec::new();
                collect_ids(data, &mut ids);
                ids
            }
            other => panic!("expected one list event, got {other:?}"),
        };

        handler.on_message("x/z", "2");
        match &drain(&mut handler)[..] {
            [HostEvent::Scan(ScanEvent::Add { parent_id, .. })] => {
                assert!(listed.contains(parent_id), "{parent_id} not in {listed:?}")
            }
            other => panic!("expected one add event, got {other:?}"),
        }

        handler.link.clear();
        handler
            .handle_command(HostCommand::Scan {
                uuid: None,
                stop: true,
            })
            .unwrap();
        assert_eq!(handler.link.unsubscribed(), vec!["#".to_string()]);
        assert_eq!(handler.link.subscribed(), vec!["t/1".to_string()]);
        assert!(handler.scan_deadline().is_none());
    }

    #[test]
    fn stop_during_collection_still_resubscribes() {
        let mut handler = handler();
        handler.load_channels(vec![Channel::new("a", "t/1")]).unwrap();
        connect(&mut handler);
        handler.scan_request("u1".to_string()).unwrap();
        handler.link.clear();

        handler.scan_stop().unwrap();
        handler.on_scan_grace_elapsed();

        assert_eq!(handler.link.unsubscribed(), vec!["#".to_string()]);
        assert_eq!(handler.link.subscribed(), vec!["t/1".to_string()]);
        assert!(!drain(&mut handler)
            .iter()
            .any(|e| matches!(e, HostEvent::Scan(_))));
    }

    #[test]
    fn subscribe_failures_are_fatal_only_when_configured() {
        let mut handler = handler();
        connect(&mut handler);
        handler.link.fail_subscribe = true;
        assert!(handler.load_channels(vec![Channel::new("a", "t/1")]).is_ok());
        assert!(handler.on_suback(1, 1).is_ok());

        let mut handler = handler_with(HandlerSettings {
            fatal_subscribe_errors: true,
            ..HandlerSettings::default()
        });
        connect(&mut handler);
        handler.link.fail_subscribe = true;
        assert!(matches!(
            handler.load_channels(vec![Channel::new("a", "t/1")]),
            Err(BridgeError::Subscribe { .. })
        ));
        assert!(handler.on_suback(2, 1).is_err());
    }

    #[test]
    fn act_and_publish_commands() {
        let mut handler = handler();
        connect(&mut handler);
        handler.link.clear();

        handler
            .handle_command(HostCommand::Act {
                data: vec![
                    ActItem {
                        topic: "lamp/set".to_string(),
                        message: Some("{\"level\": ${value * 2}}".to_string()),
                        value: json!(20),
                    },
                    ActItem {
                        topic: "lamp/raw".to_string(),
                        message: None,
                        value: json!("ON"),
                    },
                ],
            })
            .unwrap();
        handler
            .handle_command(HostCommand::Publish {
                data: OneOrMany::One(PublishItem {
                    topic: "direct".to_string(),
                    message: "hello".to_string(),
                    options: PublishOptions::default(),
                }),
            })
            .unwrap();

        assert_eq!(
            handler.link.published(),
            vec![
                ("lamp/set".to_string(), "{\"level\": 40}".to_string()),
                ("lamp/raw".to_string(), "ON".to_string()),
                ("direct".to_string(), "hello".to_string()),
            ]
        );
        assert_eq!(handler.status().messages_sent, 3);
    }

    #[test]
    fn extra_updates_keep_command_subscription() {
        let mut handler = handler();
        connect(&mut handler);
        handler.load_extra(vec![cmd_extra("c1", "cmd/lamp", "on")]).unwrap();
        handler.link.clear();

        handler
            .update_extra(vec![ExtraChannelUpdate {
                old_id: "c1".to_string(),
                extra: cmd_extra("c2", "cmd/lamp", "go"),
            }])
            .unwrap();
        assert!(handler.link.calls.is_empty());

        handler
            .add_extra(vec![publish_extra("p1", "heater", 0)])
            .unwrap();
        assert!(drain(&mut handler).contains(&HostEvent::DeviceFilter {
            device_ids: vec!["heater".to_string()]
        }));

        handler
            .delete_extra(vec![ChannelRef {
                old_id: "c2".to_string(),
            }])
            .unwrap();
        assert_eq!(handler.link.unsubscribed(), vec!["cmd/lamp".to_string()]);
    }

    #[test]
    fn exit_command_stops_the_loop() {
        let mut handler = handler();
        assert_eq!(handler.handle_command(HostCommand::Exit).unwrap(), Flow::Exit);
        assert_eq!(
            handler
                .handle_command(HostCommand::AddChannels { data: vec![] })
                .unwrap(),
            Flow::Continue
        );
    }

    #[tokio::test]
    async fn resubscribe_fits_the_request_queue() {
        use rumqttc::{AsyncClient, MqttOptions};

        let options = MqttOptions::new("bridge-test", "localhost", 1883);
        // The event loop stays idle, requests pile up in the bounded queue
        let (client, _eventloop) = AsyncClient::new(options, 10);
        let mut handler = MqttHandler::new(
            client,
            HandlerSettings {
                fatal_subscribe_errors: true,
                ..HandlerSettings::default()
            },
            transformer(),
        );
        let channels = (0..100)
            .map(|i| Channel::new(format!("c{i}"), format!("room/{i}")))
            .collect();
        handler.load_channels(channels).unwrap();

        handler.on_connecting();
        assert!(handler.on_connected().is_ok());
    }

    #[test]
    fn resubscribe_is_batched() {
        let mut handler = handler();
        let channels = (0..70)
            .map(|i| Channel::new(format!("c{i}"), format!("room/{i}")))
            .collect();
        handler.load_channels(channels).unwrap();
        handler.scan_request("u1".to_string()).unwrap();

        connect(&mut handler);

        let sizes: Vec<usize> = handler
            .link
            .calls
            .iter()
            .map(|call| match call {
                LinkCall::SubscribeMany(topics) => topics.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![32, 32, 7]);
        assert_eq!(handler.link.subscribed().last().map(String::as_str), Some("#"));
    }

    #[test]
    fn trigger_change_keeps_command_route() {
        let mut handler = handler();
        connect(&mut handler);
        handler.load_extra(vec![cmd_extra("c1", "cmd/lamp", "on")]).unwrap();
        handler.link.clear();
        drain(&mut handler);

        handler
            .update_extra(vec![ExtraChannelUpdate {
                old_id: "c1".to_string(),
                extra: cmd_extra("c1", "cmd/lamp", "go"),
            }])
            .unwrap();
        assert!(handler.link.calls.is_empty());

        handler.on_message("cmd/lamp", "on");
        assert!(drain(&mut handler).is_empty());
        handler.on_message("cmd/lamp", "go");
        assert!(matches!(
            &drain(&mut handler)[..],
            [HostEvent::Command(CommandEvent { device_id, .. })] if device_id == "lamp1"
        ));
    }

    #[test]
    fn publish_without_message_is_skipped() {
        let mut handler = handler();
        connect(&mut handler);
        handler.link.clear();

        handler.publish_items(vec![
            PublishItem {
                topic: "direct".to_string(),
                message: String::new(),
                options: PublishOptions::default(),
            },
            PublishItem {
                topic: "direct".to_string(),
                message: "1".to_string(),
                options: PublishOptions::default(),
            },
        ]);

        assert_eq!(
            handler.link.published(),
            vec![("direct".to_string(), "1".to_string())]
        );
        assert_eq!(handler.status().dropped, 0);
    }
}
