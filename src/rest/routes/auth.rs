//! Token issuance and refresh endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::auth::TokenPair;
use crate::envelope::DeviceClass;
use crate::rest::unauthorized;
use crate::AppContext;

#[derive(Deserialize)]
pub struct TokenRequest {
    pub device_id: String,
    /// Accepted for parity with clients; not stored server-side.
    #[serde(default)]
    pub device_name: String,
    pub user_id: String,
    pub device_type: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub ws_url: String,
    pub session_id: String,
}

impl TokenResponse {
    fn from_pair(ctx: &AppContext, pair: TokenPair, session_id: String) -> Self {
        Self {
            ws_url: ctx.config.ws_url(&pair.access_token),
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "bearer",
            expires_at: pair.expires_at,
            session_id,
        }
    }
}

/// Create a fresh session and its token pair.
pub async fn create_token(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<TokenRequest>,
) -> Response {
    let device_class = DeviceClass::parse(&req.device_type);
    if device_class.is_none() {
        warn!(device_type = %req.device_type, "unrecognized device type on token request");
    }
    match ctx.issuer.issue(
        &req.user_id,
        &req.device_id,
        device_class,
        vec!["default".to_string()],
    ) {
        Ok(pair) => {
            let session_id = pair.session_id.clone();
            Json(TokenResponse::from_pair(&ctx, pair, session_id)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

/// Exchange a refresh token for a new access token. No new session is
/// created, so `session_id` comes back empty.
pub async fn refresh_token(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<RefreshRequest>,
) -> Response {
    match ctx.issuer.refresh(&req.refresh_token) {
        Ok(pair) => Json(TokenResponse::from_pair(&ctx, pair, String::new())).into_response(),
        Err(e) => unauthorized(&format!("invalid refresh token: {e}")),
    }
}
