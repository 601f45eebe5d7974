//! Records exchanged with the host automation server
//!
//! Everything in here is plain serde data: channel definitions arriving from the
//! host, the commands the host sends at runtime and the events the bridge sends
//! back. The JSON shape uses camelCase field names and a `type` tag.

use crate::mqtt::connection::ConnectionState;
use crate::scan::ScanEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A host-side data point bound to a broker topic.
///
/// With `parent_topic` and `script_ref` set, the channel is a node child: its
/// value is computed by the named transform from the payload of `parent_topic`,
/// and `topic` names the child value inside the transform result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_scene_id: Option<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            parent_topic: None,
            script_ref: None,
            start_scene_id: None,
        }
    }

    /// Node child: value derived from a shared parent topic by a transform
    pub fn node_binding(&self) -> Option<(&str, &str)> {
        match (&self.parent_topic, &self.script_ref) {
            (Some(parent), Some(script)) => Some((parent.as_str(), script.as_str())),
            _ => None,
        }
    }

    /// The topic the broker has to deliver for this channel
    pub fn wire_topic(&self) -> &str {
        match self.node_binding() {
            Some((parent, _)) => parent,
            None => &self.topic,
        }
    }
}

/// Channel update notification, `old_id` names the record being replaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdate {
    pub old_id: String,
    #[serde(flatten)]
    pub channel: Channel,
}

/// Delete notification for channels and extra channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub old_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraKind {
    /// Outbound: device property value → broker topic
    Publish,
    /// Inbound: payload is written to a device property
    Set,
    /// Inbound: payload equal to `trigger` runs a device command
    Cmd,
}

/// Outbound publish target or inbound command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraChannel {
    pub id: String,
    pub topic: String,
    pub kind: ExtraKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_expression: Option<String>,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub qos: u8,
    /// 0 disables offline buffering
    #[serde(default)]
    pub buffer_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Payload that fires a `cmd` descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl ExtraChannel {
    pub fn options(&self) -> PublishOptions {
        PublishOptions {
            qos: self.qos,
            retain: self.retain,
        }
    }

    /// `(device_id, property)` key of a publish descriptor
    pub fn publish_key(&self) -> Option<PublishKey> {
        match (&self.device_id, &self.property) {
            (Some(device_id), Some(property)) if self.kind == ExtraKind::Publish => {
                Some(PublishKey::new(device_id.clone(), property.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublishKey {
    pub device_id: String,
    pub property: String,
}

impl PublishKey {
    pub fn new(device_id: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            property: property.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraChannelUpdate {
    pub old_id: String,
    #[serde(flatten)]
    pub extra: ExtraChannel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Ok,
    /// No fresh data can arrive, the broker link is down
    LinkDown,
}

/// Structured value for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub id: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default)]
    pub status: ChannelStatus,
}

impl DataEvent {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            ts: None,
            status: ChannelStatus::Ok,
        }
    }

    pub fn with_ts(mut self, ts: Option<i64>) -> Self {
        self.ts = ts;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Run a device command
    Device,
    /// Write a value to a device property
    Setval,
}

/// Command forwarded to the host for an inbound command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEvent {
    pub command: CommandKind,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Outbound command from the host, `message` is a template over `value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActItem {
    pub topic: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// Device-state notification for the publish map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceValue {
    pub device_id: String,
    pub property: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishItem {
    pub topic: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub options: PublishOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Runtime input from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostCommand {
    AddChannels {
        data: Vec<Channel>,
    },
    UpdateChannels {
        data: Vec<ChannelUpdate>,
    },
    DeleteChannels {
        data: Vec<ChannelRef>,
    },
    AddExtra {
        data: Vec<ExtraChannel>,
    },
    UpdateExtra {
        data: Vec<ExtraChannelUpdate>,
    },
    DeleteExtra {
        data: Vec<ChannelRef>,
    },
    Act {
        data: Vec<ActItem>,
    },
    Sub {
        data: Vec<DeviceValue>,
    },
    Publish {
        data: OneOrMany<PublishItem>,
    },
    Scan {
        #[serde(default)]
        uuid: Option<String>,
        #[serde(default)]
        stop: bool,
    },
    Exit,
}

/// Output toward the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostEvent {
    Data {
        data: Vec<DataEvent>,
    },
    /// Historical readings, ascending by timestamp
    Archive {
        data: Vec<DataEvent>,
    },
    /// Status change for many channels at once
    Status {
        ids: Vec<String>,
        status: ChannelStatus,
    },
    Command(CommandEvent),
    StartScene {
        id: String,
        topic: String,
        message: String,
    },
    Scan(ScanEvent),
    /// Devices whose state the host should stream back as `sub` notifications
    DeviceFilter {
        device_ids: Vec<String>,
    },
    Connection {
        state: ConnectionState,
    },
}
