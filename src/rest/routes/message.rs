//! REST fallback ingress: accept one envelope over HTTP and queue it for
//! the router, exactly as if it had arrived on the caller's WebSocket.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::rest::bearer_claims;
use crate::AppContext;

#[derive(Deserialize)]
pub struct MessageRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub async fn send_message(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(req): Json<MessageRequest>,
) -> Response {
    let claims = match bearer_claims(&ctx, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let mut envelope = Envelope::new(req.kind, req.payload);
    envelope.metadata = req.metadata;
    // The server vouches for the caller's identity in metadata.
    envelope
        .metadata
        .insert("session_id".into(), json!(claims.sub));
    envelope
        .metadata
        .insert("user_id".into(), json!(claims.user_id));
    envelope
        .metadata
        .insert("device_id".into(), json!(claims.device_id));

    let message_id = envelope.id.clone();
    let timestamp = envelope.timestamp.clone();
    ctx.router.enqueue(&claims.sub, envelope).await;

    Json(json!({
        "message_id": message_id,
        "status": "queued",
        "timestamp": timestamp,
    }))
    .into_response()
}
