use std::time::Duration;

use rumqttc::{LastWill, MqttOptions, TlsConfiguration, Transport};
use tracing::debug;

use crate::config::{BrokerConfig, Protocol};
use crate::error::BridgeError;
use crate::mqtt::broker_link::qos_from_u8;

const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Connection options for the broker client; TLS material is read from disk
pub async fn build_mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, BridgeError> {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options
        .set_keep_alive(Duration::from_secs(
            config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ))
        .set_clean_session(config.clean_session)
        .set_request_channel_capacity(config.request_capacity.max(1));

    if config.use_password {
        options.set_credentials(config.username.clone(), config.password.clone());
    }

    if let Some(will) = config.will.as_ref().filter(|w| !w.topic.is_empty()) {
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone().into_bytes(),
            qos_from_u8(will.qos),
            will.retain,
        ));
    }

    if config.protocol == Protocol::Mqtts {
        let tls = config
            .tls
            .as_ref()
            .ok_or_else(|| BridgeError::Config("mqtts needs a [broker.tls] section".into()))?;
        let ca_file = tls
            .ca_file
            .as_ref()
            .ok_or_else(|| BridgeError::Config("mqtts needs broker.tls.ca_file".into()))?;
        let ca = tokio::fs::read(ca_file).await?;

        let client_auth = match (&tls.cert_file, &tls.key_file) {
            (Some(cert), Some(key)) => {
                Some((tokio::fs::read(cert).await?, tokio::fs::read(key).await?))
            }
            _ => None,
        };
        debug!(
            "TLS enabled for {}:{} (client certificate: {})",
            config.host,
            config.port,
            client_auth.is_some()
        );
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TlsConfig, WillConfig};

    #[tokio::test]
    async fn plain_options_carry_broker_settings() {
        let config = BrokerConfig {
            host: "broker.local".to_string(),
            port: 1884,
            keep_alive_secs: 1,
            clean_session: false,
            will: Some(WillConfig {
                topic: "bridge/status".to_string(),
                payload: "offline".to_string(),
                online_payload: Some("online".to_string()),
                qos: 1,
                retain: true,
            }),
            ..BrokerConfig::default()
        };

        let options = build_mqtt_options(&config).await.unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(MIN_KEEP_ALIVE_SECS));
        assert!(!options.clean_session());
        assert_eq!(options.last_will().map(|w| w.topic), Some("bridge/status".to_string()));
    }

    #[tokio::test]
    async fn missing_ca_file_is_an_io_error() {
        let config = BrokerConfig {
            protocol: Protocol::Mqtts,
            tls: Some(TlsConfig {
                ca_file: Some("/nonexistent/ca.pem".into()),
                ..TlsConfig::default()
            }),
            ..BrokerConfig::default()
        };

        assert!(matches!(
            build_mqtt_options(&config).await,
            Err(BridgeError::Io(_))
        ));
    }
}
