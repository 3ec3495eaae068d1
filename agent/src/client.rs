//! Realtime channel client with reconnect.
//!
//! Each connection announces itself (join + aux capability), then pumps
//! inbound frames into the [`DeviceAgent`] and queued [`ClientMessage`]s
//! out.  When the connection ends for any reason the agent is told, so an
//! in-flight capture wait is abandoned, and a new connection is attempted
//! after `reconnect`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use syncam_common::protocol::{ClientMessage, ServerMessage};

use crate::agent::DeviceAgent;
use crate::source::CaptureSource;
use crate::upload::Uploader;

/// Connect, serve, reconnect, until `shutdown`.
pub async fn run<S, U>(
    agent: Arc<DeviceAgent<S, U>>,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    reconnect: Duration,
    shutdown: CancellationToken,
) where
    S: CaptureSource,
    U: Uploader,
{
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        debug!("Connecting to {url}");
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Connected to coordinator at {url}");
                match serve(&agent, ws, &mut outbound, &shutdown).await {
                    Ok(()) => info!("Coordinator channel closed"),
                    Err(e) => warn!("Coordinator channel failed: {e:#}"),
                }
                agent.on_disconnected();
            }
            Err(e) => warn!("Cannot reach coordinator at {url}: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(reconnect) => {}
        }
    }
    info!("Channel client stopped");
}

async fn serve<S, U, T>(
    agent: &Arc<DeviceAgent<S, U>>,
    ws: T,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: CaptureSource,
    U: Uploader,
    T: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    // commands queued while offline targeted the previous session
    let mut stale = 0;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        debug!("Dropped {stale} command(s) queued while disconnected");
    }

    for msg in agent.hello() {
        send_frame(&mut sink, &msg).await?;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(text.as_str()) {
                    Ok(msg) => agent.handle(msg).await,
                    Err(e) => warn!("Dropping frame from coordinator: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Channel read failed"),
            },
            msg = outbound.recv() => match msg {
                Some(msg) => send_frame(&mut sink, &msg).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn send_frame<W>(sink: &mut W, msg: &ClientMessage) -> Result<()>
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg).context("Cannot encode frame")?;
    sink.send(Message::Text(text.into()))
        .await
        .with_context(|| format!("Cannot send {}", msg.kind()))?;
    Ok(())
}
