use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::rest::bearer_claims;
use crate::AppContext;

/// List the caller's live sessions.
pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Response {
    let claims = match bearer_claims(&ctx, &headers) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let sessions: Vec<_> = ctx
        .registry
        .session_views_for_user(&claims.user_id)
        .into_iter()
        .map(|view| {
            json!({
                "session_id": view.session_id,
                "device_id": view.device_id,
                "device_type": view.device_class.map(|c| c.to_string()),
                "connected_at": view.connected_at.to_rfc3339(),
                "last_activity": view.last_activity.to_rfc3339(),
                "is_active": view.is_active,
                "messages": {
                    "sent": view.messages_sent,
                    "received": view.messages_received,
                },
            })
        })
        .collect();

    Json(json!({ "total": sessions.len(), "sessions": sessions })).into_response()
}
