use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::model::{HostCommand, HostEvent};

/// Reads one JSON command per line until EOF or until the engine is gone.
/// Lines that do not parse are logged and skipped.
pub async fn read_commands<R>(reader: R, commands: mpsc::Sender<HostCommand>) -> Result<(), BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command: HostCommand = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring malformed host command: {} ({})", e, line);
                continue;
            }
        };
        trace!("Host command: {:?}", command);
        if commands.send(command).await.is_err() {
            debug!("Engine stopped, no longer reading host commands");
            return Ok(());
        }
    }
    debug!("Host input closed");
    Ok(())
}

/// Writes every event as one JSON line, flushing after each
pub async fn write_events<W>(mut events: mpsc::Receiver<HostEvent>, mut writer: W) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    debug!("Host event stream closed");
    Ok(())
}
