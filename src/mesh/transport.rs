//! Mesh transports.
//!
//! The adapter speaks to peers through [`MeshTransport`]: encoded frame
//! text out, encoded frame text in. Two implementations:
//!
//! - [`LocalBus`] — in-process loopback connecting every adapter that
//!   shares the bus. Used by sidecars co-located in one process and by
//!   tests.
//! - [`RelayUplink`] — a WebSocket client that rides the cloud relay,
//!   wrapping each frame in a `mesh` envelope targeted at the owning
//!   user so it fans out to the user's other sidecars. Reconnects with
//!   exponential backoff.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::envelope::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh transport closed")]
    TransportClosed,
    #[error("frame encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Byte-level peer transport. Implementations deliver whole encoded frames;
/// ordering is per-sender FIFO, delivery is best-effort.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn send(&self, text: String) -> Result<(), MeshError>;
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

// ─── LocalBus ─────────────────────────────────────────────────────────────────

/// In-process loopback bus. Every subscriber (including the sender) sees
/// every frame; adapters filter their own source id.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }
}

#[async_trait]
impl MeshTransport for LocalBus {
    async fn send(&self, text: String) -> Result<(), MeshError> {
        // No subscribers just means no peers yet.
        let _ = self.tx.send(text);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

// ─── RelayUplink ──────────────────────────────────────────────────────────────

/// WebSocket uplink through the cloud relay.
pub struct RelayUplink {
    out_tx: mpsc::Sender<String>,
    inbound: broadcast::Sender<String>,
}

impl RelayUplink {
    /// Connect (in the background) to `ws_url` — a fully formed
    /// `/ws?token=…` URL — and exchange mesh frames on behalf of `user_id`.
    /// The task reconnects with exponential backoff and stops when
    /// `shutdown` flips to true.
    pub fn spawn(ws_url: String, user_id: String, shutdown: watch::Receiver<bool>) -> Self {
        let (out_tx, out_rx) = mpsc::channel(128);
        let (inbound, _) = broadcast::channel(1024);
        tokio::spawn(uplink_loop(
            ws_url,
            user_id,
            out_rx,
            inbound.clone(),
            shutdown,
        ));
        Self { out_tx, inbound }
    }
}

#[async_trait]
impl MeshTransport for RelayUplink {
    async fn send(&self, text: String) -> Result<(), MeshError> {
        self.out_tx
            .send(text)
            .await
            .map_err(|_| MeshError::TransportClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inbound.subscribe()
    }
}

async fn uplink_loop(
    ws_url: String,
    user_id: String,
    mut out_rx: mpsc::Receiver<String>,
    inbound: broadcast::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff_secs: u64 = 2;

    loop {
        if *shutdown.borrow() {
            return;
        }
        info!(url = %redact_token(&ws_url), "mesh uplink: connecting");

        match connect_async(&ws_url).await {
            Ok((ws_stream, _)) => {
                info!("mesh uplink: connected");
                backoff_secs = 2;

                let (mut sink, mut stream) = ws_stream.split();
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                let _ = sink.close().await;
                                return;
                            }
                        }
                        outbound = out_rx.recv() => {
                            let Some(text) = outbound else {
                                let _ = sink.close().await;
                                return;
                            };
                            let envelope = Envelope::new("mesh", json!({ "frame": text }))
                                .with_metadata("target_user", json!(user_id));
                            let wire = match serde_json::to_string(&envelope) {
                                Ok(w) => w,
                                Err(e) => {
                                    warn!(err = %e, "mesh uplink: frame wrap failed — dropping");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(wire)).await.is_err() {
                                warn!("mesh uplink: send failed — reconnecting");
                                break;
                            }
                        }
                        frame = stream.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    handle_inbound(&text, &mut sink, &inbound).await;
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                    warn!("mesh uplink: stream closed — reconnecting");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mesh uplink: connection failed: {e:#}");
            }
        }

        info!("mesh uplink: reconnecting in {backoff_secs}s");
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff_secs = (backoff_secs * 2).min(60);
    }
}

async fn handle_inbound(
    text: &str,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    inbound: &broadcast::Sender<String>,
) {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        debug!("mesh uplink: unparseable relay frame — ignoring");
        return;
    };
    match envelope.kind.as_str() {
        "mesh" => {
            if let Some(frame) = envelope.payload.get("frame").and_then(|v| v.as_str()) {
                let _ = inbound.send(frame.to_string());
            }
        }
        // Answer relay liveness probes so the session stays warm.
        "ping" => {
            let pong = Envelope::new("pong", serde_json::Value::Null);
            if let Ok(wire) = serde_json::to_string(&pong) {
                let _ = sink.send(Message::Text(wire)).await;
            }
        }
        other => {
            debug!(kind = other, "mesh uplink: ignoring non-mesh envelope");
        }
    }
}

fn redact_token(url: &str) -> String {
    match url.split_once("token=") {
        Some((prefix, _)) => format!("{prefix}token=***"),
        None => url.to_string(),
    }
}
