use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use crate::expr::{ExprError, Expression};
use crate::model::{Channel, ExtraChannel, PublishKey};

/// One node child: the transform result under `channel_name` belongs to `channel_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChild {
    pub channel_name: String,
    pub channel_id: String,
}

/// Parent topic whose payload is split by a transform into child channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub script_ref: String,
    pub children: Vec<NodeChild>,
}

/// Extra channel with its compiled calc expression
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraRoute {
    pub descriptor: ExtraChannel,
    pub calc: Option<Expression>,
}

impl ExtraRoute {
    pub fn compile(descriptor: ExtraChannel) -> Result<Self, ExprError> {
        let calc = match descriptor.calc_expression.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => Some(Expression::parse(source)?),
            _ => None,
        };
        Ok(Self { descriptor, calc })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SceneBinding {
    channel_id: String,
    scene_id: String,
}

/// Broker traffic implied by a routing change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicChange {
    pub subscribe: Option<String>,
    pub unsubscribe: Option<String>,
}

impl TopicChange {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_none() && self.unsubscribe.is_none()
    }
}

/// Topic routing state of the bridge.
///
/// A topic is "routed" while at least one of the fan-out lists, node entries or
/// command lists holds it. The register/unregister calls report the moment a
/// topic becomes routed or stops being routed, which is exactly when the
/// broker subscription has to change. No key is ever left with an empty list.
#[derive(Debug, Default)]
pub struct RoutingTable {
    subscriptions: IndexMap<String, Vec<String>>,
    nodes: IndexMap<String, NodeEntry>,
    commands: IndexMap<String, Vec<ExtraRoute>>,
    publish_targets: IndexMap<PublishKey, ExtraRoute>,
    start_scenes: IndexMap<String, Vec<SceneBinding>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_routed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
            || self.nodes.contains_key(topic)
            || self.commands.contains_key(topic)
    }

    /// Adds a channel; returns the topic if it just became routed
    pub fn register_channel(&mut self, channel: &Channel) -> Option<String> {
        let topic = channel.wire_topic().to_string();
        let was_routed = self.is_routed(&topic);

        let inserted = match channel.node_binding() {
            Some((parent, script)) => {
                let entry = self
                    .nodes
                    .entry(parent.to_string())
                    .or_insert_with(|| NodeEntry {
                        script_ref: script.to_string(),
                        children: Vec::new(),
                    });
                if entry.script_ref != script {
                    warn!(
                        "Node {} already uses transform {}, ignoring {} for channel {}",
                        parent, entry.script_ref, script, channel.id
                    );
                }
                if entry.children.iter().any(|c| c.channel_id == channel.id) {
                    false
                } else {
                    entry.children.push(NodeChild {
                        channel_name: channel.topic.clone(),
                        channel_id: channel.id.clone(),
                    });
                    true
                }
            }
            None => {
                let ids = self.subscriptions.entry(topic.clone()).or_default();
                if ids.contains(&channel.id) {
                    false
                } else {
                    ids.push(channel.id.clone());
                    true
                }
            }
        };

        if let Some(scene_id) = &channel.start_scene_id {
            self.bind_scene(&topic, &channel.id, scene_id);
        }

        if inserted && !was_routed {
            Some(topic)
        } else {
            None
        }
    }

    /// Removes a channel by id; returns the topic if it is no longer routed
    pub fn unregister_channel(&mut self, id: &str) -> Option<String> {
        self.unbind_scenes(id);
        let topic = self.remove_channel_id(id)?;
        if self.is_routed(&topic) {
            None
        } else {
            Some(topic)
        }
    }

    /// Replaces `old_id` with `channel`.
    ///
    /// If the channel keeps its place (same topic, same fan-out list or node)
    /// the id is swapped in place and no broker traffic is needed.
    pub fn update_channel(&mut self, old_id: &str, channel: &Channel) -> TopicChange {
        if self.replace_in_place(old_id, channel) {
            self.unbind_scenes(old_id);
            if let Some(scene_id) = &channel.start_scene_id {
                self.bind_scene(channel.wire_topic(), &channel.id, scene_id);
            }
            debug!("Channel {} renamed to {} in place", old_id, channel.id);
            return TopicChange::default();
        }

        let unsubscribe = self.unregister_channel(old_id);
        let subscribe = self.register_channel(channel);
        if unsubscribe.is_some() && unsubscribe == subscribe {
            return TopicChange::default();
        }
        TopicChange {
            subscribe,
            unsubscribe,
        }
    }

    fn replace_in_place(&mut self, old_id: &str, channel: &Channel) -> bool {
        match channel.node_binding() {
            None => {
                let Some(ids) = self.subscriptions.get_mut(channel.wire_topic()) else {
                    return false;
                };
                let Some(pos) = ids.iter().position(|id| id == old_id) else {
                    return false;
                };
                if old_id != channel.id && ids.contains(&channel.id) {
                    ids.remove(pos);
                } else {
                    ids[pos] = channel.id.clone();
                }
                true
            }
            Some((parent, _)) => {
                let Some(entry) = self.nodes.get_mut(parent) else {
                    return false;
                };
                let Some(pos) = entry.children.iter().position(|c| c.channel_id == old_id) else {
                    return false;
                };
                if old_id != channel.id
                    && entry.children.iter().any(|c| c.channel_id == channel.id)
                {
                    entry.children.remove(pos);
                } else {
                    entry.children[pos] = NodeChild {
                        channel_name: channel.topic.clone(),
                        channel_id: channel.id.clone(),
                    };
                }
                true
            }
        }
    }

    fn remove_channel_id(&mut self, id: &str) -> Option<String> {
        let plain = self
            .subscriptions
            .iter()
            .find(|(_, ids)| ids.iter().any(|x| x == id))
            .map(|(topic, _)| topic.clone());
        if let Some(topic) = plain {
            if let Some(ids) = self.subscriptions.get_mut(&topic) {
                ids.retain(|x| x != id);
                if ids.is_empty() {
                    self.subscriptions.shift_remove(&topic);
                }
            }
            return Some(topic);
        }

        let node = self
            .nodes
            .iter()
            .find(|(_, entry)| entry.children.iter().any(|c| c.channel_id == id))
            .map(|(topic, _)| topic.clone())?;
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.children.retain(|c| c.channel_id != id);
            if entry.children.is_empty() {
                self.nodes.shift_remove(&node);
            }
        }
        Some(node)
    }

    /// Wire topic a channel id is currently routed on
    pub fn find_topic_for_channel(&self, id: &str) -> Option<&str> {
        self.subscriptions
            .iter()
            .find(|(_, ids)| ids.iter().any(|x| x == id))
            .map(|(topic, _)| topic.as_str())
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|(_, entry)| entry.children.iter().any(|c| c.channel_id == id))
                    .map(|(topic, _)| topic.as_str())
            })
    }

    fn bind_scene(&mut self, topic: &str, channel_id: &str, scene_id: &str) {
        let bindings = self.start_scenes.entry(topic.to_string()).or_default();
        if !bindings.iter().any(|b| b.channel_id == channel_id) {
            bindings.push(SceneBinding {
                channel_id: channel_id.to_string(),
                scene_id: scene_id.to_string(),
            });
        }
    }

    fn unbind_scenes(&mut self, channel_id: &str) {
        self.start_scenes.retain(|_, bindings| {
            bindings.retain(|b| b.channel_id != channel_id);
            !bindings.is_empty()
        });
    }

    /// Adds an inbound command route; returns the topic if it just became routed
    pub fn register_command(&mut self, route: ExtraRoute) -> Option<String> {
        let topic = route.descriptor.topic.clone();
        let was_routed = self.is_routed(&topic);
        let routes = self.commands.entry(topic.clone()).or_default();
        if routes.iter().any(|r| r.descriptor.id == route.descriptor.id) {
            return None;
        }
        routes.push(route);
        if was_routed {
            None
        } else {
            Some(topic)
        }
    }

    pub fn unregister_command(&mut self, id: &str) -> Option<String> {
        let topic = self
            .commands
            .iter()
            .find(|(_, routes)| routes.iter().any(|r| r.descriptor.id == id))
            .map(|(topic, _)| topic.clone())?;
        if let Some(routes) = self.commands.get_mut(&topic) {
            routes.retain(|r| r.descriptor.id != id);
            if routes.is_empty() {
                self.commands.shift_remove(&topic);
            }
        }
        if self.is_routed(&topic) {
            None
        } else {
            Some(topic)
        }
    }

    pub fn has_command(&self, id: &str) -> bool {
        self.commands
            .values()
            .any(|routes| routes.iter().any(|r| r.descriptor.id == id))
    }

    /// Replaces the command route `old_id` with `route`.
    ///
    /// A route that stays on its topic is swapped in place, keeping its
    /// position, and needs no broker traffic.
    pub fn update_command(&mut self, old_id: &str, route: ExtraRoute) -> TopicChange {
        if let Some(routes) = self.commands.get_mut(&route.descriptor.topic) {
            if let Some(pos) = routes.iter().position(|r| r.descriptor.id == old_id) {
                let new_id = route.descriptor.id.clone();
                routes[pos] = route;
                let mut index = 0;
                routes.retain(|r| {
                    let keep = index == pos || r.descriptor.id != new_id;
                    index += 1;
                    keep
                });
                debug!("Command route {} replaced by {} in place", old_id, new_id);
                return TopicChange::default();
            }
        }

        let unsubscribe = self.unregister_command(old_id);
        let subscribe = self.register_command(route);
        if unsubscribe.is_some() && unsubscribe == subscribe {
            return TopicChange::default();
        }
        TopicChange {
            subscribe,
            unsubscribe,
        }
    }

    /// First registration for a `(device, property)` pair wins
    pub fn register_publish_target(&mut self, route: ExtraRoute) -> bool {
        let Some(key) = route.descriptor.publish_key() else {
            warn!(
                "Publish channel {} has no deviceId/property, ignoring",
                route.descriptor.id
            );
            return false;
        };
        if let Some(existing) = self.publish_targets.get(&key) {
            debug!(
                "Publish target {}/{} already bound to {}, ignoring {}",
                key.device_id, key.property, existing.descriptor.id, route.descriptor.id
            );
            return false;
        }
        self.publish_targets.insert(key, route);
        true
    }

    pub fn unregister_publish_target(&mut self, id: &str) -> bool {
        let before = self.publish_targets.len();
        self.publish_targets.retain(|_, route| route.descriptor.id != id);
        self.publish_targets.len() != before
    }

    pub fn publish_target(&self, device_id: &str, property: &str) -> Option<&ExtraRoute> {
        self.publish_targets
            .get(&PublishKey::new(device_id, property))
    }

    /// Channel ids fanned out from `topic`
    pub fn subscribers(&self, topic: &str) -> &[String] {
        self.subscriptions
            .get(topic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn node(&self, topic: &str) -> Option<&NodeEntry> {
        self.nodes.get(topic)
    }

    pub fn commands(&self, topic: &str) -> &[ExtraRoute] {
        self.commands
            .get(topic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// `(channel id, scene id)` pairs to start when `topic` delivers
    pub fn start_scenes(&self, topic: &str) -> impl Iterator<Item = (&str, &str)> {
        self.start_scenes
            .get(topic)
            .into_iter()
            .flatten()
            .map(|b| (b.channel_id.as_str(), b.scene_id.as_str()))
    }

    /// Every routed topic, each once
    pub fn topics(&self) -> Vec<String> {
        let topics: IndexSet<&String> = self
            .subscriptions
            .keys()
            .chain(self.commands.keys())
            .chain(self.nodes.keys())
            .collect();
        topics.into_iter().cloned().collect()
    }

    /// Every channel id with live routing
    pub fn channel_ids(&self) -> Vec<String> {
        self.subscriptions
            .values()
            .flatten()
            .cloned()
            .chain(
                self.nodes
                    .values()
                    .flat_map(|entry| entry.children.iter().map(|c| c.channel_id.clone())),
            )
            .collect()
    }

    /// Devices referenced by publish targets, each once
    pub fn publish_device_ids(&self) -> Vec<String> {
        let ids: IndexSet<&String> = self.publish_targets.keys().map(|k| &k.device_id).collect();
        ids.into_iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.nodes.is_empty()
            && self.commands.is_empty()
            && self.publish_targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtraKind;
    use pretty_assertions::assert_eq;

    fn node_channel(id: &str, name: &str, parent: &str) -> Channel {
        let mut channel = Channel::new(id, name);
        channel.parent_topic = Some(parent.to_string());
        channel.script_ref = Some("json".to_string());
        channel
    }

    fn extra(id: &str, topic: &str, kind: ExtraKind) -> ExtraChannel {
        ExtraChannel {
            id: id.to_string(),
            topic: topic.to_string(),
            kind,
            calc_expression: None,
            retain: false,
            qos: 0,
            buffer_length: 0,
            device_id: Some("dev1".to_string()),
            property: Some("state".to_string()),
            trigger: None,
        }
    }

    fn assert_no_empty_lists(table: &RoutingTable) {
        assert!(table.subscriptions.values().all(|ids| !ids.is_empty()));
        assert!(table.nodes.values().all(|n| !n.children.is_empty()));
        assert!(table.commands.values().all(|r| !r.is_empty()));
        assert!(table.start_scenes.values().all(|b| !b.is_empty()));
    }

    #[test]
    fn fan_out_subscribes_once() {
        let mut table = RoutingTable::new();
        assert_eq!(
            table.register_channel(&Channel::new("a", "home/temp")),
            Some("home/temp".to_string())
        );
        assert_eq!(table.register_channel(&Channel::new("b", "home/temp")), None);
        // Duplicate ids are ignored
        assert_eq!(table.register_channel(&Channel::new("a", "home/temp")), None);
        assert_eq!(table.subscribers("home/temp"), ["a", "b"]);

        assert_eq!(table.unregister_channel("a"), None);
        assert_eq!(table.unregister_channel("b"), Some("home/temp".to_string()));
        assert!(table.subscribers("home/temp").is_empty());
        assert!(table.is_empty());
        assert_no_empty_lists(&table);
    }

    #[test]
    fn rename_on_same_topic_causes_no_traffic() {
        let mut table = RoutingTable::new();
        table.register_channel(&Channel::new("a", "t/1"));
        table.register_channel(&Channel::new("b", "t/1"));

        let change = table.update_channel("a", &Channel::new("a2", "t/1"));

        assert!(change.is_empty());
        assert_eq!(table.subscribers("t/1"), ["a2", "b"]);
        assert_eq!(table.find_topic_for_channel("a2"), Some("t/1"));
        assert_eq!(table.find_topic_for_channel("a"), None);
    }

    #[test]
    fn topic_change_unsubscribes_only_when_last_id_leaves() {
        let mut table = RoutingTable::new();
        table.register_channel(&Channel::new("a", "t/old"));
        table.register_channel(&Channel::new("b", "t/old"));

        let change = table.update_channel("a", &Channel::new("a", "t/new"));
        assert_eq!(
            change,
            TopicChange {
                subscribe: Some("t/new".to_string()),
                unsubscribe: None,
            }
        );

        let change = table.update_channel("b", &Channel::new("b", "t/new"));
        assert_eq!(
            change,
            TopicChange {
                subscribe: None,
                unsubscribe: Some("t/old".to_string()),
            }
        );
        assert_eq!(table.topics(), vec!["t/new".to_string()]);
        assert_no_empty_lists(&table);
    }

    #[test]
    fn node_children_share_the_parent_subscription() {
        let mut table = RoutingTable::new();
        assert_eq!(
            table.register_channel(&node_channel("c1", "temperature", "sensors/climate")),
            Some("sensors/climate".to_string())
        );
        assert_eq!(
            table.register_channel(&node_channel("c2", "humidity", "sensors/climate")),
            None
        );

        let node = table.node("sensors/climate").unwrap();
        assert_eq!(node.script_ref, "json");
        assert_eq!(node.children.len(), 2);
        assert_eq!(table.find_topic_for_channel("c2"), Some("sensors/climate"));

        let change = table.update_channel("c1", &node_channel("c1", "temp", "sensors/climate"));
        assert!(change.is_empty());
        assert_eq!(table.node("sensors/climate").unwrap().children[0].channel_name, "temp");

        assert_eq!(table.unregister_channel("c1"), None);
        assert_eq!(
            table.unregister_channel("c2"),
            Some("sensors/climate".to_string())
        );
        assert!(table.node("sensors/climate").is_none());
    }

    #[test]
    fn command_and_channel_on_one_topic_subscribe_once() {
        let mut table = RoutingTable::new();
        let route = ExtraRoute::compile(extra("x1", "cmd/lamp", ExtraKind::Set)).unwrap();
        assert_eq!(table.register_command(route), Some("cmd/lamp".to_string()));
        assert_eq!(table.register_channel(&Channel::new("a", "cmd/lamp")), None);

        assert_eq!(table.unregister_command("x1"), None);
        assert_eq!(table.unregister_channel("a"), Some("cmd/lamp".to_string()));
    }

    #[test]
    fn command_update_swaps_in_place_or_moves() {
        let mut table = RoutingTable::new();
        let mut first = extra("x1", "cmd/lamp", ExtraKind::Cmd);
        first.trigger = Some("on".to_string());
        table.register_command(ExtraRoute::compile(first).unwrap());
        table.register_command(
            ExtraRoute::compile(extra("x2", "cmd/lamp", ExtraKind::Set)).unwrap(),
        );

        let mut retriggered = extra("x1", "cmd/lamp", ExtraKind::Cmd);
        retriggered.trigger = Some("go".to_string());
        let change = table.update_command("x1", ExtraRoute::compile(retriggered).unwrap());
        assert!(change.is_empty());
        let routes = table.commands("cmd/lamp");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].descriptor.id, "x1");
        assert_eq!(routes[0].descriptor.trigger.as_deref(), Some("go"));
        assert!(table.has_command("x2"));

        let change = table.update_command(
            "x2",
            ExtraRoute::compile(extra("x2", "cmd/heater", ExtraKind::Set)).unwrap(),
        );
        assert_eq!(
            change,
            TopicChange {
                subscribe: Some("cmd/heater".to_string()),
                unsubscribe: None,
            }
        );
        assert_eq!(table.commands("cmd/lamp").len(), 1);
        assert!(!table.has_command("x3"));
        assert_no_empty_lists(&table);
    }

    #[test]
    fn first_publish_target_wins() {
        let mut table = RoutingTable::new();
        let first = ExtraRoute::compile(extra("p1", "out/a", ExtraKind::Publish)).unwrap();
        let second = ExtraRoute::compile(extra("p2", "out/b", ExtraKind::Publish)).unwrap();

        assert!(table.register_publish_target(first));
        assert!(!table.register_publish_target(second));
        assert_eq!(
            table.publish_target("dev1", "state").unwrap().descriptor.id,
            "p1"
        );
        assert_eq!(table.publish_device_ids(), vec!["dev1".to_string()]);

        assert!(table.unregister_publish_target("p1"));
        assert!(table.publish_target("dev1", "state").is_none());
    }

    #[test]
    fn invalid_calc_expression_does_not_compile() {
        let mut descriptor = extra("p1", "out/a", ExtraKind::Publish);
        descriptor.calc_expression = Some("value *".to_string());
        assert!(ExtraRoute::compile(descriptor).is_err());
    }

    #[test]
    fn start_scene_bindings_follow_channels() {
        let mut table = RoutingTable::new();
        let mut channel = Channel::new("a", "door/bell");
        channel.start_scene_id = Some("ring".to_string());
        table.register_channel(&channel);

        assert_eq!(
            table.start_scenes("door/bell").collect::<Vec<_>>(),
            vec![("a", "ring")]
        );
        table.unregister_channel("a");
        assert_eq!(table.start_scenes("door/bell").count(), 0);
        assert_no_empty_lists(&table);
    }

    #[test]
    fn mixed_sequence_keeps_topics_consistent() {
        let mut table = RoutingTable::new();
        let mut subscribed: IndexSet<String> = IndexSet::new();
        fn apply(change: TopicChange, subscribed: &mut IndexSet<String>) {
            if let Some(topic) = change.unsubscribe {
                assert!(subscribed.shift_remove(&topic), "unsubscribe of unknown {topic}");
            }
            if let Some(topic) = change.subscribe {
                assert!(subscribed.insert(topic.clone()), "double subscribe {topic}");
            }
        }

        for (id, topic) in [("a", "t/1"), ("b", "t/1"), ("c", "t/2"), ("d", "t/3")] {
            let subscribe = table.register_channel(&Channel::new(id, topic));
            apply(TopicChange { subscribe, unsubscribe: None }, &mut subscribed);
        }
        let change = table.update_channel("c", &Channel::new("c", "t/1"));
        apply(change, &mut subscribed);
        let change = table.update_channel("d", &node_channel("d", "x", "t/4"));
        apply(change, &mut subscribed);
        let unsubscribe = table.unregister_channel("a");
        apply(TopicChange { subscribe: None, unsubscribe }, &mut subscribed);

        let mut expected: Vec<String> = subscribed.into_iter().collect();
        let mut actual = table.topics();
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
        assert_eq!(actual, vec!["t/1".to_string(), "t/4".to_string()]);
        assert_no_empty_lists(&table);
    }
}
