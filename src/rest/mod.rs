// rest/mod.rs — Public HTTP + WebSocket surface.
//
// Axum server carrying the REST API and the `/ws` upgrade endpoint.
//
// Endpoints:
//   GET  /api/health
//   GET  /api/metrics
//   POST /api/auth/token
//   POST /api/auth/refresh
//   GET  /api/sessions        (Bearer)
//   POST /api/message         (Bearer)
//   GET  /ws?token=<access>

pub mod routes;
pub mod ws;

use anyhow::Result;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::{extract_bearer, Claims, TokenKind};
use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/metrics", get(routes::metrics::metrics))
        .route("/api/auth/token", post(routes::auth::create_token))
        .route("/api/auth/refresh", post(routes::auth::refresh_token))
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/message", post(routes::message::send_message))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves. Returns the bound address via
/// `on_bind` before accepting traffic (tests bind port 0).
pub async fn serve(
    ctx: Arc<AppContext>,
    addr: SocketAddr,
    on_bind: tokio::sync::oneshot::Sender<SocketAddr>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("relay listening on http://{local}");
    let _ = on_bind.send(local);

    let router = build_router(ctx);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolve and verify the `Authorization: Bearer` header as an access token.
pub fn bearer_claims(ctx: &AppContext, headers: &HeaderMap) -> Result<Claims, Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    ctx.issuer
        .verify(token, TokenKind::Access)
        .map_err(|e| unauthorized(&e.to_string()))
}

pub fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": detail })),
    )
        .into_response()
}
