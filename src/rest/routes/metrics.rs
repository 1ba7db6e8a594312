use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

pub async fn metrics(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let stats = ctx.registry.stats();
    Json(json!({
        "active_connections": stats.active_connections,
        "unique_users": stats.unique_users,
        "unique_devices": stats.unique_devices,
        "messages_sent": stats.messages_sent,
        "messages_received": stats.messages_received,
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
    }))
}
