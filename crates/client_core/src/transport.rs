//! Websocket link to the pipeline backend.
//!
//! The transport owns a single background task that dials, pumps frames and
//! redials on a fixed delay until shut down. Consumers observe connectivity
//! through a `watch` channel and receive raw text frames over an `mpsc`;
//! frame interpretation happens in the router, not here.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use shared::envelope::ClientFrame;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const OUTBOUND_BUFFER: usize = 64;

/// Translate the REST base URL into the websocket endpoint for a session.
pub fn websocket_url(server_url: &str, session_id: &str) -> Result<String> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!(
        "{}/ws/{session_id}",
        ws_base.trim_end_matches('/')
    ))
}

pub struct Transport {
    connected: watch::Receiver<bool>,
    outbound: mpsc::Sender<ClientFrame>,
    task: JoinHandle<()>,
}

impl Transport {
    /// Start the connection loop. Incoming text frames are delivered on
    /// `inbound`; the task ends when `inbound` is closed or the transport
    /// is dropped.
    pub fn spawn(ws_url: String, inbound: mpsc::Sender<String>) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let task = tokio::spawn(run(ws_url, inbound, outbound_rx, connected_tx));
        Self {
            connected: connected_rx,
            outbound: outbound_tx,
            task,
        }
    }

    /// Watch connectivity transitions. The current value is the live state.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Best-effort send. Frames are silently dropped while the link is
    /// down; a full queue also drops rather than blocking the caller.
    pub fn send(&self, frame: ClientFrame) {
        if !*self.connected.borrow() {
            debug!("outbound frame dropped: not connected");
            return;
        }
        if self.outbound.try_send(frame).is_err() {
            debug!("outbound frame dropped: queue full or transport shut down");
        }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    ws_url: String,
    inbound: mpsc::Sender<String>,
    mut outbound: mpsc::Receiver<ClientFrame>,
    connected: watch::Sender<bool>,
) {
    loop {
        let stream = match connect_async(&ws_url).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(url = %ws_url, error = %err, "websocket connect failed; retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!(url = %ws_url, "websocket connected");
        // Anything still queued raced the previous disconnect and is stale
        // by now; a fresh connection starts with an empty queue.
        while outbound.try_recv().is_ok() {}
        let _ = connected.send(true);

        let (mut writer, mut reader) = stream.split();
        loop {
            tokio::select! {
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(text).await.is_err() {
                            // Receiver gone: the session was closed.
                            let _ = connected.send(false);
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "failed to encode outbound frame");
                                continue;
                            }
                        };
                        if let Err(err) = writer.send(Message::Text(text)).await {
                            warn!(error = %err, "websocket send failed");
                            break;
                        }
                    }
                    None => {
                        let _ = connected.send(false);
                        return;
                    }
                },
            }
        }

        let _ = connected.send(false);
        info!(url = %ws_url, "websocket disconnected; reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
