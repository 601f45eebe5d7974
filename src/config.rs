//! Bridge configuration
//!
//! One TOML file holds the broker connection, bridge behaviour, logging and
//! the initial channel load. Missing sections fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, Level};

use crate::error::BridgeError;
use crate::model::{Channel, ExtraChannel};
use crate::transform::TransformSettings;

const CONFIG_DIR: &str = "mqtt-bridge";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_ENV: &str = "MQTT_BRIDGE_CONFIG";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Mqtt,
    Mqtts,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Last will; `online_payload` is published to the same topic on every connect
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct WillConfig {
    pub topic: String,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_payload: Option<String>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
    pub request_capacity: usize,
    pub use_password: bool,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub will: Option<WillConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            protocol: Protocol::Mqtt,
            client_id: "mqtt-bridge".to_string(),
            clean_session: true,
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            request_capacity: 100,
            use_password: false,
            username: String::new(),
            password: String::new(),
            tls: None,
            will: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    pub extract_ts: bool,
    pub ts_field: String,
    /// JSON arrays on fan-out topics are archive batches
    pub archive_arrays: bool,
    /// Subscribe/unsubscribe failures end the run loop
    pub fatal_subscribe_errors: bool,
    pub scan_topic: String,
    pub scan_grace_ms: u64,
    pub subscribe_qos: u8,
    pub event_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            extract_ts: false,
            ts_field: "ts".to_string(),
            archive_arrays: true,
            fatal_subscribe_errors: false,
            scan_topic: "#".to_string(),
            scan_grace_ms: 1000,
            subscribe_qos: 0,
            event_capacity: 1000,
        }
    }
}

impl BridgeSettings {
    pub fn transform_settings(&self) -> TransformSettings {
        TransformSettings {
            archive_arrays: self.archive_arrays,
            extract_ts: self.extract_ts,
            ts_field: self.ts_field.clone(),
        }
    }

    pub fn scan_grace(&self) -> Duration {
        Duration::from_millis(self.scan_grace_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Unknown level names fall back to INFO
    pub fn level(&self) -> Level {
        self.level.trim().parse().unwrap_or(Level::INFO)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub bridge: BridgeSettings,
    pub logging: LoggingConfig,
    pub channels: Vec<Channel>,
    pub extra: Vec<ExtraChannel>,
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Command line argument, then `$MQTT_BRIDGE_CONFIG`, then the user config dir
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.filter(|a| !a.is_empty())
            .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()))
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path)
    }

    pub async fn load(path: &Path) -> Result<Self, BridgeError> {
        debug!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path).await?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), BridgeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Writes the default configuration if `path` does not exist yet
    pub async fn ensure_default(path: &Path) -> Result<bool, BridgeError> {
        if tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        info!("No configuration at {}, writing defaults", path.display());
        Self::default().save(path).await?;
        Ok(true)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err(BridgeError::Config("broker.host must not be empty".into()));
        }
        if broker.port == 0 {
            return Err(BridgeError::Config("broker.port must not be 0".into()));
        }
        if broker.protocol == Protocol::Mqtts
            && broker.tls.as_ref().and_then(|t| t.ca_file.as_ref()).is_none()
        {
            return Err(BridgeError::Config(
                "protocol mqtts needs broker.tls.ca_file".into(),
            ));
        }
        if let Some(tls) = &broker.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(BridgeError::Config(
                    "broker.tls.cert_file and key_file must be set together".into(),
                ));
            }
        }

        let mut qos_levels = vec![("bridge.subscribe_qos", self.bridge.subscribe_qos)];
        if let Some(will) = &broker.will {
            qos_levels.push(("broker.will.qos", will.qos));
        }
        for extra in &self.extra {
            qos_levels.push(("extra.qos", extra.qos));
        }
        if let Some((name, qos)) = qos_levels.into_iter().find(|(_, qos)| *qos > 2) {
            return Err(BridgeError::Config(format!("{} must be 0, 1 or 2, got {}", name, qos)));
        }

        if self.bridge.scan_grace_ms == 0 {
            return Err(BridgeError::Config("bridge.scan_grace_ms must be > 0".into()));
        }
        if self.bridge.scan_topic.trim().is_empty() {
            return Err(BridgeError::Config("bridge.scan_topic must not be empty".into()));
        }
        Ok(())
    }
}
