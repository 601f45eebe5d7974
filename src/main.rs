use color_eyre::{eyre::eyre, Result};
use mqtt_bridge::config::BridgeConfig;
use mqtt_bridge::host::{read_commands, write_events};
use mqtt_bridge::mqtt::MqttHandle;
use mqtt_bridge::transform::TransformRegistry;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

const COMMAND_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = BridgeConfig::resolve_path(std::env::args().nth(1));
    BridgeConfig::ensure_default(&path).await?;
    let config = BridgeConfig::load(&path).await?;
    setup_logging(config.logging.level());
    info!("Configuration loaded from {}", path.display());

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(config.bridge.event_capacity.max(1));

    let _reader = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = read_commands(stdin, command_tx).await {
            error!("Host reader terminated with error: {}", e);
        }
    });
    let writer = tokio::spawn(async move {
        if let Err(e) = write_events(event_rx, tokio::io::stdout()).await {
            error!("Host writer terminated with error: {}", e);
        }
    });

    let mut handle = MqttHandle::spawn(&config, TransformRegistry::with_builtins(), command_rx, event_tx)
        .await
        .map_err(|e| eyre!("Failed to start MQTT bridge: {}", e))?;

    let finished = tokio::select! {
        result = handle.join() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            info!("Interrupted, shutting down");
            handle.shutdown();
            handle.join().await
        }
    };

    // The writer ends once the engine drops its event sender
    if let Err(e) = writer.await {
        debug!("Host writer task failed: {}", e);
    }

    result.map_err(|e| eyre!("MQTT bridge stopped: {}", e))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

// stdout carries host events, so logs go to stderr
fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
