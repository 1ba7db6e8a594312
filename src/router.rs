//! Message router.
//!
//! A single worker drains a FIFO queue of `(sender session, envelope)`
//! pairs. Resolution order per envelope: explicit target session → target
//! device → target user → the type-rule table → the sender's device-class
//! rule → warn and drop. The router holds session ids only and re-resolves
//! them through the registry on every hop, so a session that died in the
//! meantime is just an undelivered send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{DeviceClass, Envelope};
use crate::registry::ConnectionRegistry;

const QUEUE_DEPTH: usize = 1024;

/// Effect a type or device-class rule routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteRule {
    /// Deliver to the sender's user's desktop (sidecar) sessions; reply
    /// with a `NO_SIDECAR` error when there are none.
    ToSidecars,
    /// Deliver to the sender's user's mobile + web (PWA) sessions.
    ToClients,
}

/// The type-rule table. Defaults cover the PWA↔sidecar conversation.
fn default_type_rules() -> HashMap<String, RouteRule> {
    let mut rules = HashMap::new();
    for kind in ["runPlan", "chat", "approve"] {
        rules.insert(kind.to_string(), RouteRule::ToSidecars);
    }
    for kind in ["progress", "diff", "recover"] {
        rules.insert(kind.to_string(), RouteRule::ToClients);
    }
    rules
}

struct RouterInner {
    type_rules: HashMap<String, RouteRule>,
    class_rules: HashMap<DeviceClass, RouteRule>,
}

/// Handle for enqueueing messages; cheap to clone.
#[derive(Clone)]
pub struct MessageRouter {
    tx: mpsc::Sender<(String, Envelope)>,
    inner: Arc<Mutex<RouterInner>>,
}

impl MessageRouter {
    /// Spawn the router worker. Returns the handle and the worker task.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let inner = Arc::new(Mutex::new(RouterInner {
            type_rules: default_type_rules(),
            class_rules: HashMap::new(),
        }));
        let router = Self {
            tx,
            inner: Arc::clone(&inner),
        };
        let worker = tokio::spawn(router_loop(registry, inner, rx, shutdown));
        (router, worker)
    }

    /// Queue an envelope from `sender_session`. Missing id/timestamp are
    /// filled here so downstream always sees a complete envelope.
    pub async fn enqueue(&self, sender_session: &str, mut envelope: Envelope) {
        envelope.ensure_identity();
        if self
            .tx
            .send((sender_session.to_string(), envelope))
            .await
            .is_err()
        {
            error!("router queue closed — dropping message");
        }
    }

    /// Override the rule for a message type.
    pub fn register_type_rule(&self, kind: &str, rule: RouteRule) {
        self.inner
            .lock()
            .expect("router lock poisoned")
            .type_rules
            .insert(kind.to_string(), rule);
    }

    /// Set the fallback rule for a sender device class.
    pub fn register_class_rule(&self, class: DeviceClass, rule: RouteRule) {
        self.inner
            .lock()
            .expect("router lock poisoned")
            .class_rules
            .insert(class, rule);
    }
}

async fn router_loop(
    registry: Arc<ConnectionRegistry>,
    inner: Arc<Mutex<RouterInner>>,
    mut rx: mpsc::Receiver<(String, Envelope)>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("message router started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("message router stopped");
                    return;
                }
            }
            item = rx.recv() => {
                let Some((sender, envelope)) = item else {
                    info!("message router queue closed");
                    return;
                };
                route_message(&registry, &inner, &sender, envelope);
            }
        }
    }
}

fn route_message(
    registry: &ConnectionRegistry,
    inner: &Mutex<RouterInner>,
    sender: &str,
    envelope: Envelope,
) {
    // 1–3. Explicit routing metadata wins, most specific first.
    if let Some(target) = envelope.target_session() {
        let target = target.to_string();
        if !registry.send_to_session(&target, &envelope) {
            debug!(target, "target session unavailable");
        }
        return;
    }
    if let Some(target) = envelope.target_device() {
        let target = target.to_string();
        if !registry.send_to_device(&target, &envelope) {
            debug!(target, "target device unavailable");
        }
        return;
    }
    if let Some(target) = envelope.target_user() {
        let delivered = registry.send_to_user(&target.to_string(), &envelope);
        debug!(delivered, "delivered to user sessions");
        return;
    }

    // 4. Type-rule table.
    let type_rule = {
        let inner = inner.lock().expect("router lock poisoned");
        inner.type_rules.get(&envelope.kind).copied()
    };
    if let Some(rule) = type_rule {
        apply_rule(registry, sender, &envelope, rule);
        return;
    }

    // 5. Sender device-class fallback.
    let class_rule = registry.claims(sender).and_then(|claims| {
        let class = claims.device_class?;
        let inner = inner.lock().expect("router lock poisoned");
        inner.class_rules.get(&class).copied()
    });
    if let Some(rule) = class_rule {
        apply_rule(registry, sender, &envelope, rule);
        return;
    }

    // 6. Nothing matched.
    warn!(kind = %envelope.kind, sender, "no route for message — dropping");
}

fn apply_rule(
    registry: &ConnectionRegistry,
    sender: &str,
    envelope: &Envelope,
    rule: RouteRule,
) {
    let Some(claims) = registry.claims(sender) else {
        debug!(sender, "sender disappeared before routing");
        return;
    };

    match rule {
        RouteRule::ToSidecars => {
            let sidecars = registry
                .sessions_of_user_by_class(&claims.user_id, |c| c == DeviceClass::Desktop);
            if sidecars.is_empty() {
                registry.send_to_session(sender, &Envelope::no_sidecar_error(&envelope.id));
                return;
            }
            for session_id in sidecars {
                // A failed recipient disconnects itself; the rest still get
                // their copy.
                registry.send_to_session(&session_id, envelope);
            }
        }
        RouteRule::ToClients => {
            for session_id in
                registry.sessions_of_user_by_class(&claims.user_id, DeviceClass::is_client)
            {
                registry.send_to_session(&session_id, envelope);
            }
        }
    }
}
