//! Connection registry — owns every live WebSocket session.
//!
//! Three indices: session id → connection, user id → session set,
//! device id → session. All mutation goes through the registry; each call
//! sees a consistent snapshot. Sockets are written through a per-connection
//! channel whose reader task owns the sink half, so a send here never blocks
//! on a slow peer beyond the socket's own buffer.

pub mod liveness;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::envelope::{DeviceClass, Envelope};
use crate::events::{EventBus, FabricEvent};

/// Close codes used on the relay's WebSocket surface.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// What the registry pushes into a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketOut {
    Frame(String),
    Close { code: u16, reason: String },
}

/// Verified identity of one connection, extracted from its access token.
#[derive(Debug, Clone)]
pub struct SessionClaims {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_class: Option<DeviceClass>,
    pub scopes: Vec<String>,
}

#[derive(Debug)]
struct ConnectionInfo {
    claims: SessionClaims,
    sender: mpsc::UnboundedSender<SocketOut>,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    last_ping: Instant,
    messages_sent: u64,
    messages_received: u64,
    active: bool,
}

/// Read-only view of one session for the REST surface.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: String,
    pub device_id: String,
    pub device_class: Option<DeviceClass>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub unique_users: usize,
    pub unique_devices: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Default)]
struct Indices {
    by_session: HashMap<String, ConnectionInfo>,
    by_user: HashMap<String, HashSet<String>>,
    by_device: HashMap<String, String>,
}

pub struct ConnectionRegistry {
    inner: Mutex<Indices>,
    events: EventBus,
}

impl ConnectionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Indices::default()),
            events,
        }
    }

    /// Install a freshly authenticated connection and greet it with the
    /// `system` connected envelope. A second connection for the same session
    /// id replaces the first (the old socket is closed).
    pub fn accept(&self, claims: SessionClaims, sender: mpsc::UnboundedSender<SocketOut>) {
        let session_id = claims.session_id.clone();
        let user_id = claims.user_id.clone();
        let device_id = claims.device_id.clone();

        self.disconnect(&session_id);

        {
            let mut inner = self.lock();
            let now = Instant::now();
            inner.by_session.insert(
                session_id.clone(),
                ConnectionInfo {
                    claims,
                    sender,
                    connected_at: Utc::now(),
                    last_activity: now,
                    last_activity_at: Utc::now(),
                    last_ping: now,
                    messages_sent: 0,
                    messages_received: 0,
                    active: true,
                },
            );
            inner
                .by_user
                .entry(user_id.clone())
                .or_default()
                .insert(session_id.clone());
            inner.by_device.insert(device_id.clone(), session_id.clone());
        }

        info!(session_id, user_id, device_id, "websocket connected");
        self.events.publish(FabricEvent::SessionConnected {
            session_id: session_id.clone(),
            user_id,
        });

        let greeting = Envelope::new(
            "system",
            json!({
                "action": "connected",
                "session_id": session_id,
                "message": "Connection established",
            }),
        );
        self.send_to_session(&session_id, &greeting);
    }

    /// Remove a session from every index and close its socket best-effort.
    /// Idempotent.
    pub fn disconnect(&self, session_id: &str) {
        self.close_and_disconnect(session_id, None);
    }

    /// Like `disconnect`, but sends an explicit close frame first.
    pub fn close_and_disconnect(&self, session_id: &str, close: Option<(u16, &str)>) {
        let removed = {
            let mut inner = self.lock();
            let Some(mut info) = inner.by_session.remove(session_id) else {
                return;
            };
            info.active = false;

            if let Some(sessions) = inner.by_user.get_mut(&info.claims.user_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    inner.by_user.remove(&info.claims.user_id);
                }
            }
            if inner
                .by_device
                .get(&info.claims.device_id)
                .is_some_and(|s| s == session_id)
            {
                inner.by_device.remove(&info.claims.device_id);
            }
            info
        };

        if let Some((code, reason)) = close {
            let _ = removed.sender.send(SocketOut::Close {
                code,
                reason: reason.to_string(),
            });
        } else {
            let _ = removed.sender.send(SocketOut::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            });
        }
        info!(session_id, "websocket disconnected");
        self.events.publish(FabricEvent::SessionDisconnected {
            session_id: session_id.to_string(),
        });
    }

    /// Deliver to one session. Failures disconnect the peer.
    pub fn send_to_session(&self, session_id: &str, envelope: &Envelope) -> bool {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "envelope serialization failed");
                return false;
            }
        };
        let delivered = {
            let mut inner = self.lock();
            match inner.by_session.get_mut(session_id) {
                Some(info) if info.active => {
                    if info.sender.send(SocketOut::Frame(text)).is_ok() {
                        info.messages_sent += 1;
                        info.last_activity = Instant::now();
                        info.last_activity_at = Utc::now();
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if !delivered {
            self.disconnect(session_id);
        }
        delivered
    }

    /// Deliver to every session of a user; returns the delivered count.
    /// Iterates a stable snapshot so disconnects during delivery are safe.
    pub fn send_to_user(&self, user_id: &str, envelope: &Envelope) -> usize {
        self.sessions_of_user(user_id)
            .iter()
            .filter(|session_id| self.send_to_session(session_id, envelope))
            .count()
    }

    pub fn send_to_device(&self, device_id: &str, envelope: &Envelope) -> bool {
        let session_id = {
            let inner = self.lock();
            inner.by_device.get(device_id).cloned()
        };
        match session_id {
            Some(session_id) => self.send_to_session(&session_id, envelope),
            None => false,
        }
    }

    /// Deliver to every connection except `exclude`; failing peers are
    /// disconnected. Returns the delivered count.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        let sessions: Vec<String> = {
            let inner = self.lock();
            inner
                .by_session
                .keys()
                .filter(|id| exclude != Some(id.as_str()))
                .cloned()
                .collect()
        };
        sessions
            .iter()
            .filter(|id| self.send_to_session(id, envelope))
            .count()
    }

    /// Record inbound traffic from a session (any inbound frame counts as
    /// activity).
    pub fn record_received(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(info) = inner.by_session.get_mut(session_id) {
            info.messages_received += 1;
            info.last_activity = Instant::now();
            info.last_activity_at = Utc::now();
        }
    }

    pub fn claims(&self, session_id: &str) -> Option<SessionClaims> {
        self.lock()
            .by_session
            .get(session_id)
            .map(|info| info.claims.clone())
    }

    pub fn sessions_of_user(&self, user_id: &str) -> Vec<String> {
        self.lock()
            .by_user
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions of a user filtered by device class.
    pub fn sessions_of_user_by_class(
        &self,
        user_id: &str,
        pred: impl Fn(DeviceClass) -> bool,
    ) -> Vec<String> {
        let inner = self.lock();
        inner
            .by_user
            .get(user_id)
            .map(|set| {
                set.iter()
                    .filter(|id| {
                        inner
                            .by_session
                            .get(*id)
                            .and_then(|info| info.claims.device_class)
                            .is_some_and(&pred)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn session_views_for_user(&self, user_id: &str) -> Vec<SessionView> {
        let inner = self.lock();
        inner
            .by_user
            .get(user_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| inner.by_session.get(id))
                    .map(|info| SessionView {
                        session_id: info.claims.session_id.clone(),
                        device_id: info.claims.device_id.clone(),
                        device_class: info.claims.device_class,
                        connected_at: info.connected_at,
                        last_activity: info.last_activity_at,
                        is_active: info.active,
                        messages_sent: info.messages_sent,
                        messages_received: info.messages_received,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sessions whose last activity is older than `idle`, for the liveness
    /// sweepers.
    pub fn idle_sessions(&self, idle: std::time::Duration) -> Vec<String> {
        let inner = self.lock();
        let now = Instant::now();
        inner
            .by_session
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_activity) > idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Send a ping envelope to every connection not already idle-timed-out,
    /// stamping `last_ping`. Returns ids whose socket rejected the ping.
    pub fn ping_all(&self) -> Vec<String> {
        let mut failed = Vec::new();
        let mut inner = self.lock();
        for (id, info) in inner.by_session.iter_mut() {
            let ping = Envelope::new("ping", json!({}));
            match serde_json::to_string(&ping) {
                Ok(text) => {
                    if info.sender.send(SocketOut::Frame(text)).is_ok() {
                        info.last_ping = Instant::now();
                    } else {
                        failed.push(id.clone());
                    }
                }
                Err(_) => failed.push(id.clone()),
            }
        }
        failed
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            active_connections: inner.by_session.len(),
            unique_users: inner.by_user.len(),
            unique_devices: inner.by_device.len(),
            messages_sent: inner.by_session.values().map(|i| i.messages_sent).sum(),
            messages_received: inner
                .by_session
                .values()
                .map(|i| i.messages_received)
                .sum(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indices> {
        self.inner.lock().expect("registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(session: &str, user: &str, device: &str, class: DeviceClass) -> SessionClaims {
        SessionClaims {
            session_id: session.into(),
            user_id: user.into(),
            device_id: device.into(),
            device_class: Some(class),
            scopes: vec!["default".into()],
        }
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(EventBus::new())
    }

    fn accept(
        reg: &ConnectionRegistry,
        c: SessionClaims,
    ) -> mpsc::UnboundedReceiver<SocketOut> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.accept(c, tx);
        rx
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<SocketOut>) -> Envelope {
        match rx.try_recv().expect("frame available") {
            SocketOut::Frame(text) => serde_json::from_str(&text).unwrap(),
            SocketOut::Close { .. } => panic!("unexpected close"),
        }
    }

    #[test]
    fn accept_greets_and_indexes() {
        let reg = registry();
        let mut rx = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));

        let greeting = next_frame(&mut rx);
        assert_eq!(greeting.kind, "system");
        assert_eq!(greeting.payload["session_id"], "s1");

        assert_eq!(reg.sessions_of_user("u1"), vec!["s1".to_string()]);
        let stats = reg.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.unique_users, 1);
        assert_eq!(stats.unique_devices, 1);
    }

    #[test]
    fn disconnect_is_idempotent_and_cleans_all_indices() {
        let reg = registry();
        let _rx = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        reg.disconnect("s1");
        reg.disconnect("s1");

        let stats = reg.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.unique_users, 0);
        assert_eq!(stats.unique_devices, 0);
        assert!(reg.sessions_of_user("u1").is_empty());
    }

    #[test]
    fn send_to_user_hits_every_session() {
        let reg = registry();
        let mut rx1 = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        let mut rx2 = accept(&reg, claims("s2", "u1", "d2", DeviceClass::Desktop));
        let _rx3 = accept(&reg, claims("s3", "u2", "d3", DeviceClass::Web));

        // Drain greetings.
        next_frame(&mut rx1);
        next_frame(&mut rx2);

        let env = Envelope::new("chat", json!({"text": "hi"}));
        assert_eq!(reg.send_to_user("u1", &env), 2);
        assert_eq!(next_frame(&mut rx1).kind, "chat");
        assert_eq!(next_frame(&mut rx2).kind, "chat");
    }

    #[test]
    fn send_to_dead_socket_disconnects_the_session() {
        let reg = registry();
        let rx = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        drop(rx);

        let env = Envelope::new("chat", json!({}));
        assert!(!reg.send_to_session("s1", &env));
        assert_eq!(reg.stats().active_connections, 0);
    }

    #[test]
    fn broadcast_excludes_and_counts() {
        let reg = registry();
        let mut rx1 = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        let mut rx2 = accept(&reg, claims("s2", "u2", "d2", DeviceClass::Desktop));
        next_frame(&mut rx1);
        next_frame(&mut rx2);

        let env = Envelope::new("announce", json!({}));
        assert_eq!(reg.broadcast(&env, Some("s1")), 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(next_frame(&mut rx2).kind, "announce");
    }

    #[test]
    fn class_filter_selects_desktop_sessions() {
        let reg = registry();
        let _rx1 = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        let _rx2 = accept(&reg, claims("s2", "u1", "d2", DeviceClass::Desktop));

        let desktops =
            reg.sessions_of_user_by_class("u1", |c| matches!(c, DeviceClass::Desktop));
        assert_eq!(desktops, vec!["s2".to_string()]);
        let clients = reg.sessions_of_user_by_class("u1", DeviceClass::is_client);
        assert_eq!(clients, vec!["s1".to_string()]);
    }

    #[test]
    fn record_received_updates_stats() {
        let reg = registry();
        let _rx = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        reg.record_received("s1");
        reg.record_received("s1");
        assert_eq!(reg.stats().messages_received, 2);
    }

    #[test]
    fn idle_sessions_reports_only_stale_connections() {
        let reg = registry();
        let _rx = accept(&reg, claims("s1", "u1", "d1", DeviceClass::Mobile));
        assert!(reg.idle_sessions(std::time::Duration::from_secs(60)).is_empty());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(
            reg.idle_sessions(std::time::Duration::from_millis(5)),
            vec!["s1".to_string()]
        );
    }
}
