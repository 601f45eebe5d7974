//! Node transforms
//!
//! A node transform splits the payload of one parent topic into values for
//! several child channels. Transforms are registered by name; channels refer
//! to them through `scriptRef`. Loading or compiling user scripts is up to the
//! embedding application, the bridge only invokes what was registered.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::model::{ChannelStatus, DataEvent};
use crate::transform::error::TransformError;
use crate::transform::timestamp::parse_timestamp;

/// Value a transform produced for one child channel
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    Scalar(Value),
    Timed {
        value: Value,
        ts: Option<i64>,
        status: ChannelStatus,
    },
}

impl NodeOutput {
    /// Objects with a `value` key are timed values, anything else is a scalar
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("value") => {
                let ts = map.get("ts").and_then(parse_timestamp);
                let status = map
                    .get("status")
                    .or_else(|| map.get("statusFlag"))
                    .and_then(|s| serde_json::from_value(s.clone()).ok())
                    .unwrap_or_default();
                NodeOutput::Timed {
                    value: map.remove("value").unwrap_or(Value::Null),
                    ts,
                    status,
                }
            }
            other => NodeOutput::Scalar(other),
        }
    }

    pub fn into_event(self, id: &str) -> DataEvent {
        match self {
            NodeOutput::Scalar(value) => DataEvent::new(id, value),
            NodeOutput::Timed { value, ts, status } => DataEvent {
                id: id.to_string(),
                value,
                ts,
                status,
            },
        }
    }
}

/// Result of one invocation, keyed by child channel name
pub type NodeResult = HashMap<String, NodeOutput>;

/// Transform interface, implementations must not block
pub trait NodeTransform: Send + Sync + 'static {
    fn transform(&self, payload: &str) -> Result<NodeResult, TransformError>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// Closure-backed transform
pub struct FnTransform<F> {
    name: String,
    func: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&str) -> Result<NodeResult, TransformError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> NodeTransform for FnTransform<F>
where
    F: Fn(&str) -> Result<NodeResult, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, payload: &str) -> Result<NodeResult, TransformError> {
        (self.func)(payload)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Built-in `json` transform: every top-level field of a JSON object payload
/// feeds the child channel of the same name
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFieldsTransform;

impl NodeTransform for JsonFieldsTransform {
    fn transform(&self, payload: &str) -> Result<NodeResult, TransformError> {
        let parsed: Value = serde_json::from_str(payload)
            .map_err(|e| TransformError::InvalidPayload(e.to_string()))?;
        match parsed {
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| (key, NodeOutput::from_json(value)))
                .collect()),
            other => Err(TransformError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Named transforms available to node channels
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn NodeTransform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("json", JsonFieldsTransform);
        registry
    }

    /// Registers (or replaces) a transform under `name`
    pub fn register(&mut self, name: impl Into<String>, transform: impl NodeTransform) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.transforms.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Runs the named transform. Panics inside the transform are caught and
    /// reported as [`TransformError::Panicked`].
    pub fn invoke(&self, name: &str, payload: &str) -> Result<NodeResult, TransformError> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| TransformError::UnknownTransform(name.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| transform.transform(payload))) {
            Ok(result) => result,
            Err(_) => Err(TransformError::Panicked(transform.name().to_string())),
        }
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .finish()
    }
}
