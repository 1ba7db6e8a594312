//! End-to-end relay tests: real server on an ephemeral port, real WebSocket
//! clients, real tokens.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use weft::auth::TokenIssuer;
use weft::config::RelayConfig;
use weft::{rest, AppContext};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Relay {
    ctx: Arc<AppContext>,
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn start_relay() -> Relay {
    let config = RelayConfig::for_tests();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ctx, _background) = AppContext::build(config, shutdown_rx);

    let (bind_tx, bind_rx) = tokio::sync::oneshot::channel();
    let server_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let _ = rest::serve(
            server_ctx,
            "127.0.0.1:0".parse().unwrap(),
            bind_tx,
            std::future::pending(),
        )
        .await;
    });
    let addr = bind_rx.await.expect("server binds");
    Relay {
        ctx,
        addr,
        _shutdown: shutdown_tx,
    }
}

async fn issue_token(relay: &Relay, user_id: &str, device_id: &str, device_type: &str) -> Value {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/auth/token", relay.addr))
        .json(&json!({
            "device_id": device_id,
            "device_name": format!("{device_id}-name"),
            "user_id": user_id,
            "device_type": device_type,
        }))
        .send()
        .await
        .expect("token request");
    assert!(response.status().is_success());
    response.json().await.expect("token response json")
}

/// Connect a WebSocket client and swallow the `system` greeting.
async fn connect_ws(relay: &Relay, token: &str) -> WsClient {
    let url = format!("ws://{}/ws?token={token}", relay.addr);
    let (mut ws, _) = connect_async(url).await.expect("ws connect");
    let greeting = next_envelope(&mut ws).await;
    assert_eq!(greeting["type"], "system");
    ws
}

async fn next_envelope(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_millis(500), ws.next())
            .await
            .expect("frame within 500ms")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn happy_path_pwa_to_sidecar_and_back() {
    let relay = start_relay().await;
    let pwa_token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let side_token = issue_token(&relay, "u1", "desk-1", "desktop").await;

    let mut pwa = connect_ws(&relay, pwa_token["access_token"].as_str().unwrap()).await;
    let mut sidecar = connect_ws(&relay, side_token["access_token"].as_str().unwrap()).await;

    pwa.send(Message::Text(
        json!({"id": "m1", "type": "runPlan", "payload": {"plan": ["step"]}}).to_string(),
    ))
    .await
    .unwrap();

    let plan = next_envelope(&mut sidecar).await;
    assert_eq!(plan["id"], "m1");
    assert_eq!(plan["type"], "runPlan");

    sidecar
        .send(Message::Text(
            json!({"id": "r1", "type": "progress", "payload": {"pct": 10}, "metadata": {}})
                .to_string(),
        ))
        .await
        .unwrap();

    let progress = next_envelope(&mut pwa).await;
    assert_eq!(progress["id"], "r1");
    assert_eq!(progress["type"], "progress");
}

#[tokio::test]
async fn missing_sidecar_yields_no_sidecar_error() {
    let relay = start_relay().await;
    let pwa_token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let mut pwa = connect_ws(&relay, pwa_token["access_token"].as_str().unwrap()).await;

    pwa.send(Message::Text(
        json!({"id": "m1", "type": "runPlan", "payload": {}}).to_string(),
    ))
    .await
    .unwrap();

    let error = next_envelope(&mut pwa).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "NO_SIDECAR");
    assert_eq!(error["payload"]["error"], "No available Sidecar found");
    assert_eq!(error["payload"]["original_message_id"], "m1");
}

#[tokio::test]
async fn expired_token_closes_with_policy_violation() {
    let relay = start_relay().await;

    // Same secret, but the access TTL is already in the past.
    let mut expired_config = RelayConfig::for_tests();
    expired_config.access_token_expire_minutes = -10;
    let stale = TokenIssuer::new(&expired_config)
        .issue("u1", "phone-1", None, vec![])
        .unwrap();

    let url = format!("ws://{}/ws?token={}", relay.addr, stale.access_token);
    let (mut ws, _) = connect_async(url).await.expect("upgrade still succeeds");

    let msg = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .expect("close within 1s")
        .expect("stream open")
        .expect("frame ok");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_json_keeps_connection_alive() {
    let relay = start_relay().await;
    let pwa_token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let side_token = issue_token(&relay, "u1", "desk-1", "desktop").await;
    let mut pwa = connect_ws(&relay, pwa_token["access_token"].as_str().unwrap()).await;
    let mut sidecar = connect_ws(&relay, side_token["access_token"].as_str().unwrap()).await;

    pwa.send(Message::Text("{not valid json".to_string()))
        .await
        .unwrap();
    // No type field: logged and ignored, connection preserved.
    pwa.send(Message::Text(json!({"id": "x"}).to_string()))
        .await
        .unwrap();

    pwa.send(Message::Text(
        json!({"id": "m2", "type": "chat", "payload": {"text": "still here"}}).to_string(),
    ))
    .await
    .unwrap();

    let chat = next_envelope(&mut sidecar).await;
    assert_eq!(chat["id"], "m2");
    assert_eq!(chat["type"], "chat");
}

#[tokio::test]
async fn rest_message_ingress_routes_like_websocket() {
    let relay = start_relay().await;
    let pwa_token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let side_token = issue_token(&relay, "u1", "desk-1", "desktop").await;
    let _pwa = connect_ws(&relay, pwa_token["access_token"].as_str().unwrap()).await;
    let mut sidecar = connect_ws(&relay, side_token["access_token"].as_str().unwrap()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/message", relay.addr))
        .bearer_auth(pwa_token["access_token"].as_str().unwrap())
        .json(&json!({"type": "runPlan", "payload": {"plan": []}}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "queued");

    let plan = next_envelope(&mut sidecar).await;
    assert_eq!(plan["type"], "runPlan");
    // The server vouched for the caller's identity.
    assert_eq!(plan["metadata"]["user_id"], "u1");
    assert_eq!(plan["metadata"]["device_id"], "phone-1");
}

#[tokio::test]
async fn rest_endpoints_report_health_metrics_and_sessions() {
    let relay = start_relay().await;
    let token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let access = token["access_token"].as_str().unwrap();
    let _ws = connect_ws(&relay, access).await;

    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://{}/api/health", relay.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);

    let metrics: Value = client
        .get(format!("http://{}/api/metrics", relay.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["active_connections"], 1);
    assert_eq!(metrics["unique_users"], 1);

    let sessions: Value = client
        .get(format!("http://{}/api/sessions", relay.addr))
        .bearer_auth(access)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions["total"], 1);
    assert_eq!(
        sessions["sessions"][0]["device_id"].as_str().unwrap(),
        "phone-1"
    );

    // Without a bearer token the session list is off limits.
    let unauthorized = client
        .get(format!("http://{}/api/sessions", relay.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_returns_new_access_and_empty_session() {
    let relay = start_relay().await;
    let token = issue_token(&relay, "u1", "phone-1", "mobile").await;

    let client = reqwest::Client::new();
    let refreshed: Value = client
        .post(format!("http://{}/api/auth/refresh", relay.addr))
        .json(&json!({"refresh_token": token["refresh_token"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(refreshed["session_id"], "");
    assert_eq!(refreshed["token_type"], "bearer");
    assert_eq!(refreshed["refresh_token"], token["refresh_token"]);

    // The refreshed access token authenticates a WebSocket.
    let _ws = connect_ws(&relay, refreshed["access_token"].as_str().unwrap()).await;

    // Garbage refresh tokens are rejected.
    let bad = client
        .post(format!("http://{}/api/auth/refresh", relay.addr))
        .json(&json!({"refresh_token": "garbage"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ws_url_in_token_response_points_at_relay_host() {
    let relay = start_relay().await;
    let token = issue_token(&relay, "u1", "phone-1", "mobile").await;
    let ws_url = token["ws_url"].as_str().unwrap();
    assert!(ws_url.starts_with("ws://localhost/ws?token="));
    assert_eq!(relay.ctx.registry.stats().active_connections, 0);
}
