//! WebSocket endpoint: `/ws?token=<access-token>`.
//!
//! The token is verified after the upgrade completes so a bad credential
//! gets a proper close frame (1008) instead of an opaque HTTP failure.
//! Each connection runs one task that owns both socket halves: outbound
//! frames come from the registry through the connection's channel, inbound
//! text is parsed leniently (only `type` is required) and queued for the
//! router. Malformed JSON is logged and the connection stays open.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::TokenKind;
use crate::envelope::Envelope;
use crate::registry::{SessionClaims, SocketOut, CLOSE_POLICY_VIOLATION};
use crate::AppContext;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, query.token))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>, token: String) {
    let claims = match ctx.issuer.verify(&token, TokenKind::Access) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(err = %e, "websocket auth failed");
            close(socket, CLOSE_POLICY_VIOLATION, &e.to_string()).await;
            return;
        }
    };

    let session_id = claims.sub.clone();
    let session_claims = SessionClaims {
        session_id: session_id.clone(),
        user_id: claims.user_id.clone(),
        device_id: claims.device_id.clone(),
        device_class: claims.device_class(),
        scopes: claims.scopes.clone(),
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    ctx.registry.accept(session_claims, out_tx);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(SocketOut::Frame(text)) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SocketOut::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        // The registry already dropped this session.
                        return;
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&ctx, &session_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {
                        // Binary / protocol frames still count as liveness.
                        ctx.registry.record_received(&session_id);
                    }
                }
            }
        }
    }
    ctx.registry.disconnect(&session_id);
}

async fn handle_inbound_text(ctx: &Arc<AppContext>, session_id: &str, text: &str) {
    // Every inbound frame is activity, parseable or not.
    ctx.registry.record_received(session_id);

    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(session_id, err = %e, "malformed inbound frame — ignoring");
            return;
        }
    };

    // Pongs only refresh activity; they are never routed.
    if envelope.kind == "pong" {
        debug!(session_id, "pong received");
        return;
    }

    ctx.router.enqueue(session_id, envelope).await;
}

async fn close(socket: WebSocket, code: u16, reason: &str) {
    let mut socket = socket;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
