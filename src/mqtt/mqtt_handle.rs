use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::model::{HostCommand, HostEvent};
use crate::mqtt::broker_link::BrokerLink;
use crate::mqtt::config::build_mqtt_options;
use crate::mqtt::connection::ConnectionState;
use crate::mqtt::mqtt_handler::{Flow, HandlerSettings, MqttHandler};
use crate::transform::{MessageTransformer, TransformRegistry};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Running broker bridge task
pub struct MqttHandle {
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl MqttHandle {
    /// Builds the client, loads the configured channels and starts the run loop.
    /// The loop ends on an `exit` command, when `commands` closes, on
    /// [`MqttHandle::shutdown`] or on a fatal error.
    pub async fn spawn(
        config: &BridgeConfig,
        transforms: TransformRegistry,
        commands: mpsc::Receiver<HostCommand>,
        events: mpsc::Sender<HostEvent>,
    ) -> Result<Self, BridgeError> {
        let options = build_mqtt_options(&config.broker).await?;
        let (client, eventloop) = AsyncClient::new(options, config.broker.request_capacity.max(1));

        let transformer = MessageTransformer::new(config.bridge.transform_settings(), transforms);
        let mut handler = MqttHandler::new(client, HandlerSettings::from_config(config), transformer);
        handler.load_channels(config.channels.clone())?;
        handler.load_extra(config.extra.clone())?;
        info!(
            "Loaded {} channels and {} extra channels",
            config.channels.len(),
            config.extra.len()
        );

        let state_rx = handler.state_watch();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let reconnect_delay = Duration::from_secs(config.broker.reconnect_delay_secs.max(1));

        let task = tokio::spawn(async move {
            debug!("Starting MQTT main task");
            let result = run_event_loop(
                handler,
                eventloop,
                commands,
                events,
                task_cancel,
                reconnect_delay,
            )
            .await;
            match &result {
                Ok(()) => info!("MQTT task terminated"),
                Err(e) => error!("MQTT task terminated with error: {}", e),
            }
            result
        });

        Ok(MqttHandle {
            state_rx,
            cancel,
            task,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the run loop to end
    pub async fn join(&mut self) -> Result<(), BridgeError> {
        (&mut self.task)
            .await
            .map_err(|e| BridgeError::ThreadError(e.to_string()))?
    }
}

/// Transport failures that are plain network trouble leave the link offline,
/// everything else counts as an error state
fn fault_state(error: &ConnectionError) -> ConnectionState {
    match error {
        ConnectionError::Io(_)
        | ConnectionError::NetworkTimeout
        | ConnectionError::FlushTimeout => ConnectionState::Offline,
        _ => ConnectionState::Error,
    }
}

fn handle_event<L: BrokerLink>(
    handler: &mut MqttHandler<L>,
    event: Event,
) -> Result<(), BridgeError> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            debug!("ConnAck: {:?}", ack.code);
            handler.on_connected()
        }
        Event::Incoming(Packet::Publish(publish)) => {
            let payload = String::from_utf8_lossy(&publish.payload);
            handler.on_message(&publish.topic, &payload);
            Ok(())
        }
        Event::Incoming(Packet::SubAck(ack)) => {
            let failures = ack
                .return_codes
                .iter()
                .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                .count();
            handler.on_suback(ack.pkid, failures)
        }
        Event::Incoming(Packet::Disconnect) => {
            handler.on_transport_fault(ConnectionState::Disconnected, "broker closed the session");
            Ok(())
        }
        other => {
            trace!("MQTT event: {:?}", other);
            Ok(())
        }
    }
}

/// Hands the handler's queued events to the host, waiting while its queue is full
async fn forward_events<L: BrokerLink>(
    handler: &mut MqttHandler<L>,
    events: &mpsc::Sender<HostEvent>,
) {
    for event in handler.drain_events() {
        if events.send(event).await.is_err() {
            debug!("Host event receiver closed");
            break;
        }
    }
}

async fn run_event_loop<L: BrokerLink>(
    mut handler: MqttHandler<L>,
    mut eventloop: EventLoop,
    mut commands: mpsc::Receiver<HostCommand>,
    events: mpsc::Sender<HostEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) -> Result<(), BridgeError> {
    handler.on_connecting();
    let mut reconnect_at: Option<Instant> = None;

    let result = loop {
        forward_events(&mut handler, &events).await;
        let scan_deadline = handler.scan_deadline();

        // `Some` ends the loop
        let finished: Option<Result<(), BridgeError>> = tokio::select! {
            _ = cancel.cancelled() => {
                info!("MQTT shutdown requested");
                Some(Ok(()))
            }
            command = commands.recv() => match command {
                Some(command) => match handler.handle_command(command) {
                    Ok(Flow::Continue) => None,
                    Ok(Flow::Exit) => Some(Ok(())),
                    Err(e) => Some(Err(e)),
                },
                None => {
                    info!("Host command stream closed");
                    Some(Ok(()))
                }
            },
            _ = tokio::time::sleep_until(scan_deadline.unwrap_or_else(Instant::now)), if scan_deadline.is_some() => {
                handler.on_scan_grace_elapsed();
                None
            }
            _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                reconnect_at = None;
                handler.on_connecting();
                None
            }
            event = eventloop.poll(), if reconnect_at.is_none() => match event {
                Ok(event) => handle_event(&mut handler, event).err().map(Err),
                Err(e) => {
                    handler.on_transport_fault(fault_state(&e), &e.to_string());
                    debug!("Reconnecting in {}s", reconnect_delay.as_secs());
                    reconnect_at = Some(Instant::now() + reconnect_delay);
                    None
                }
            }
        };

        if let Some(result) = finished {
            forward_events(&mut handler, &events).await;
            break result;
        }
    };

    let connected = handler.state() == ConnectionState::Connected;
    handler.shutdown();
    if connected {
        // Let the event loop write the DISCONNECT packet
        let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("Broker disconnect not confirmed in time");
        }
    }
    result
}
