use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::model::{CommandEvent, CommandKind, DataEvent, ExtraKind};
use crate::routing::{ExtraRoute, NodeEntry, RoutingTable};
use crate::transform::node_script::TransformRegistry;
use crate::transform::timestamp::{backfill_timestamps, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSettings {
    /// JSON array payloads on fan-out topics are archive batches
    pub archive_arrays: bool,
    pub extract_ts: bool,
    pub ts_field: String,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            archive_arrays: true,
            extract_ts: false,
            ts_field: "ts".to_string(),
        }
    }
}

/// Everything one inbound message turns into
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dispatch {
    pub data: Vec<DataEvent>,
    /// Archive events, ascending by timestamp
    pub archive: Vec<DataEvent>,
    pub command: Option<CommandEvent>,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.archive.is_empty() && self.command.is_none()
    }
}

/// Converts raw broker messages into host events
#[derive(Debug, Clone)]
pub struct MessageTransformer {
    settings: TransformSettings,
    transforms: TransformRegistry,
}

impl MessageTransformer {
    pub fn new(settings: TransformSettings, transforms: TransformRegistry) -> Self {
        Self {
            settings,
            transforms,
        }
    }

    pub fn settings(&self) -> &TransformSettings {
        &self.settings
    }

    pub fn transforms_mut(&mut self) -> &mut TransformRegistry {
        &mut self.transforms
    }

    pub fn transform(&self, routing: &RoutingTable, topic: &str, payload: &str) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let subscribers = routing.subscribers(topic);
        let node = routing.node(topic);

        if !subscribers.is_empty() {
            match self.archive_batch(topic, subscribers, payload) {
                Some(events) => dispatch.archive = events,
                None => dispatch.data.extend(
                    subscribers
                        .iter()
                        .map(|id| DataEvent::new(id.as_str(), Value::String(payload.to_string()))),
                ),
            }
        }

        if let Some(node) = node {
            dispatch.data.extend(self.run_node(topic, node, payload));
        }

        if subscribers.is_empty() && node.is_none() {
            dispatch.command = match_command(topic, routing.commands(topic), payload);
        }

        if self.settings.extract_ts && !self.settings.ts_field.is_empty() && !dispatch.data.is_empty() {
            if let Err(e) = backfill_timestamps(&mut dispatch.data, &self.settings.ts_field) {
                warn!(
                    "Timestamp extraction failed for {}, expected JSON with \"{}\" property: {}",
                    topic, self.settings.ts_field, e
                );
            }
        }

        dispatch
    }

    fn archive_batch(&self, topic: &str, ids: &[String], payload: &str) -> Option<Vec<DataEvent>> {
        if !self.settings.archive_arrays || !payload.trim_start().starts_with('[') {
            return None;
        }
        let elements: Vec<Value> = match serde_json::from_str(payload) {
            Ok(elements) => elements,
            Err(e) => {
                debug!("Payload on {} looks like an array but is not JSON: {}", topic, e);
                return None;
            }
        };

        let readings: Vec<(Value, i64)> = elements
            .into_iter()
            .filter_map(|element| {
                let reading = element
                    .get("value")
                    .cloned()
                    .zip(element.get("ts").and_then(parse_timestamp));
                if reading.is_none() {
                    warn!("Skipping archive element without value/ts on {}: {}", topic, element);
                }
                reading
            })
            .collect();

        let mut events: Vec<DataEvent> = ids
            .iter()
            .flat_map(|id| {
                readings
                    .iter()
                    .map(move |(value, ts)| DataEvent::new(id.as_str(), value.clone()).with_ts(Some(*ts)))
            })
            .collect();
        // sort_by_key is stable, equal timestamps keep per-id emission order
        events.sort_by_key(|event| event.ts);

        trace!("Archive batch on {}: {} events", topic, events.len());
        Some(events)
    }

    fn run_node(&self, topic: &str, node: &NodeEntry, payload: &str) -> Vec<DataEvent> {
        let mut result = match self.transforms.invoke(&node.script_ref, payload) {
            Ok(result) => result,
            Err(e) => {
                warn!("Node transform on {} failed: {} (payload: {})", topic, e, payload);
                return Vec::new();
            }
        };

        node.children
            .iter()
            .filter_map(|child| {
                result
                    .remove(&child.channel_name)
                    .map(|output| output.into_event(&child.channel_id))
            })
            .collect()
    }
}

fn match_command(topic: &str, routes: &[ExtraRoute], payload: &str) -> Option<CommandEvent> {
    for route in routes {
        let descriptor = &route.descriptor;
        let Some(device_id) = descriptor.device_id.clone() else {
            debug!("Command channel {} has no deviceId, skipping", descriptor.id);
            continue;
        };

        match descriptor.kind {
            ExtraKind::Set => {
                let raw = Value::String(payload.to_string());
                let value = match &route.calc {
                    Some(calc) => match calc.eval(&raw) {
                        Ok(result) => result.to_json(),
                        Err(e) => {
                            warn!(
                                "Calc expression '{}' failed on {} for payload {}: {}",
                                calc.source(),
                                topic,
                                payload,
                                e
                            );
                            continue;
                        }
                    },
                    None => raw,
                };
                return Some(CommandEvent {
                    command: CommandKind::Setval,
                    device_id,
                    property: descriptor.property.clone(),
                    value: Some(value),
                });
            }
            ExtraKind::Cmd if descriptor.trigger.as_deref() == Some(payload) => {
                return Some(CommandEvent {
                    command: CommandKind::Device,
                    device_id,
                    property: descriptor.property.clone(),
                    value: None,
                });
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, ExtraChannel};
    use crate::transform::node_script::{FnTransform, NodeResult};
    use crate::transform::TransformError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transformer() -> MessageTransformer {
        MessageTransformer::new(TransformSettings::default(), TransformRegistry::with_builtins())
    }

    fn command(id: &str, kind: ExtraKind, trigger: Option<&str>) -> ExtraRoute {
        ExtraRoute::compile(ExtraChannel {
            id: id.to_string(),
            topic: "cmd/lamp".to_string(),
            kind,
            calc_expression: None,
            retain: false,
            qos: 0,
            buffer_length: 0,
            device_id: Some("lamp1".to_string()),
            property: Some("power".to_string()),
            trigger: trigger.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn plain_payload_fans_out_verbatim() {
        let mut routing = RoutingTable::new();
        routing.register_channel(&Channel::new("a", "home/temp"));
        routing.register_channel(&Channel::new("b", "home/temp"));

        let dispatch = transformer().transform(&routing, "home/temp", "21.5");

        assert_eq!(
            dispatch.data,
            vec![
                DataEvent::new("a", json!("21.5")),
                DataEvent::new("b", json!("21.5")),
            ]
        );
        assert!(dispatch.archive.is_empty());
        assert!(dispatch.command.is_none());
    }

    #[test]
    fn archive_batch_is_sorted_stably_by_timestamp() {
        let mut routing = RoutingTable::new();
        routing.register_channel(&Channel::new("a", "meter"));
        routing.register_channel(&Channel::new("b", "meter"));

        let dispatch = transformer().transform(
            &routing,
            "meter",
            r#"[{"value":"a","ts":100},{"value":"b","ts":50}]"#,
        );

        let order: Vec<(&str, Option<i64>)> = dispatch
            .archive
            .iter()
            .map(|e| (e.id.as_str(), e.ts))
            .collect();
        assert_eq!(
            order,
            vec![("a", Some(50)), ("b", Some(50)), ("a", Some(100)), ("b", Some(100))]
        );
        assert_eq!(dispatch.archive[0].value, json!("b"));
        assert!(dispatch.data.is_empty());
    }

    #[test]
    fn arrays_are_plain_data_when_archive_mode_is_off() {
        let mut routing = RoutingTable::new();
        routing.register_channel(&Channel::new("a", "list"));
        let settings = TransformSettings {
            archive_arrays: false,
            ..TransformSettings::default()
        };

        let dispatch = MessageTransformer::new(settings, TransformRegistry::new())
            .transform(&routing, "list", "[1,2]");

        assert_eq!(dispatch.data, vec![DataEvent::new("a", json!("[1,2]"))]);
    }

    #[test]
    fn node_children_receive_their_fields() {
        let mut routing = RoutingTable::new();
        for (id, name) in [("t", "temperature"), ("h", "humidity"), ("p", "pressure")] {
            let mut channel = Channel::new(id, name);
            channel.parent_topic = Some("climate".to_string());
            channel.script_ref = Some("json".to_string());
            routing.register_channel(&channel);
        }

        let dispatch =
            transformer().transform(&routing, "climate", r#"{"temperature": 20, "humidity": 55}"#);

        assert_eq!(
            dispatch.data,
            vec![DataEvent::new("t", json!(20)), DataEvent::new("h", json!(55))]
        );
    }

    #[test]
    fn failing_node_transform_yields_nothing() {
        let mut registry = TransformRegistry::new();
        registry.register(
            "strict",
            FnTransform::new("strict", |_: &str| -> Result<NodeResult, TransformError> {
                Err(TransformError::Failed {
                    name: "strict".to_string(),
                    reason: "nope".to_string(),
                })
            }),
        );
        let mut routing = RoutingTable::new();
        let mut channel = Channel::new("c", "x");
        channel.parent_topic = Some("node".to_string());
        channel.script_ref = Some("strict".to_string());
        routing.register_channel(&channel);
        routing.register_channel(&Channel::new("other", "plain"));

        let transformer = MessageTransformer::new(TransformSettings::default(), registry);
        assert!(transformer.transform(&routing, "node", "{}").is_empty());
        assert_eq!(transformer.transform(&routing, "plain", "1").data.len(), 1);
    }

    #[test]
    fn cmd_fires_only_on_trigger() {
        let mut routing = RoutingTable::new();
        routing.register_command(command("x", ExtraKind::Cmd, Some("on")));

        let dispatch = transformer().transform(&routing, "cmd/lamp", "on");
        assert_eq!(
            dispatch.command,
            Some(CommandEvent {
                command: CommandKind::Device,
                device_id: "lamp1".to_string(),
                property: Some("power".to_string()),
                value: None,
            })
        );
        assert!(transformer().transform(&routing, "cmd/lamp", "off").is_empty());
    }

    #[test]
    fn set_uses_calc_and_first_match_wins() {
        let mut routing = RoutingTable::new();
        let mut first = command("s1", ExtraKind::Set, None);
        first.calc = Some("value * 10".parse().unwrap());
        routing.register_command(first);
        routing.register_command(command("s2", ExtraKind::Set, None));

        let dispatch = transformer().transform(&routing, "cmd/lamp", "4");
        let event = dispatch.command.unwrap();
        assert_eq!(event.command, CommandKind::Setval);
        assert_eq!(event.value, Some(json!(40)));
        assert!(dispatch.data.is_empty());
    }

    #[test]
    fn failed_calc_falls_through_to_next_route() {
        let mut routing = RoutingTable::new();
        let mut broken = command("s1", ExtraKind::Set, None);
        broken.calc = Some("value / 0".parse().unwrap());
        routing.register_command(broken);
        routing.register_command(command("s2", ExtraKind::Set, None));

        let event = transformer()
            .transform(&routing, "cmd/lamp", "4")
            .command
            .unwrap();
        assert_eq!(event.command, CommandKind::Setval);
        assert_eq!(event.value, Some(json!("4")));
    }

    #[test]
    fn commands_are_ignored_on_data_topics() {
        let mut routing = RoutingTable::new();
        routing.register_command(command("s1", ExtraKind::Set, None));
        routing.register_channel(&Channel::new("a", "cmd/lamp"));

        let dispatch = transformer().transform(&routing, "cmd/lamp", "1");
        assert!(dispatch.command.is_none());
        assert_eq!(dispatch.data.len(), 1);
    }

    #[test]
    fn timestamps_are_backfilled_when_enabled() {
        let mut routing = RoutingTable::new();
        routing.register_channel(&Channel::new("a", "t"));
        let settings = TransformSettings {
            extract_ts: true,
            ..TransformSettings::default()
        };
        let transformer = MessageTransformer::new(settings, TransformRegistry::new());

        let dispatch = transformer.transform(&routing, "t", r#"{"v": 1, "ts": 5000}"#);
        assert_eq!(dispatch.data[0].ts, Some(5000));

        // Unparsable payloads are still delivered
        let dispatch = transformer.transform(&routing, "t", "plain text");
        assert_eq!(dispatch.data[0].ts, None);
        assert_eq!(dispatch.data[0].value, json!("plain text"));
    }
}
