//! Weft — a two-tier real-time messaging fabric.
//!
//! Two subsystems share this crate:
//!
//! - **Cloud relay** (`auth`, `registry`, `router`, `rest`): an
//!   authenticated WebSocket fan-out service routing typed envelopes
//!   between a user's devices, with liveness probing and a REST fallback
//!   ingress.
//! - **Mesh** (`mesh`, `counter`, `sync`, `metrics`, `tuner`): a
//!   peer-to-peer layer between sidecar nodes replicating a shared
//!   tool-call counter and runtime configuration, with batching, adaptive
//!   heartbeats, retry with jitter, token-bucket backpressure, and a
//!   closed-loop auto-tuner.

pub mod auth;
pub mod config;
pub mod counter;
pub mod envelope;
pub mod events;
pub mod mesh;
pub mod metrics;
pub mod registry;
pub mod rest;
pub mod router;
pub mod sync;
pub mod tuner;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::TokenIssuer;
use crate::config::RelayConfig;
use crate::events::EventBus;
use crate::registry::liveness;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Shared relay state handed to every HTTP handler and background task.
pub struct AppContext {
    pub config: Arc<RelayConfig>,
    pub issuer: Arc<TokenIssuer>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: MessageRouter,
    pub events: EventBus,
    pub started_at: Instant,
}

impl AppContext {
    /// Wire up the relay: registry, router worker, and liveness sweepers.
    /// Every returned task exits within one tick once `shutdown` flips.
    pub fn build(
        config: RelayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let events = EventBus::new();
        let issuer = Arc::new(TokenIssuer::new(&config));
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));

        let (router, router_task) = MessageRouter::spawn(Arc::clone(&registry), shutdown.clone());
        let pinger = tokio::spawn(liveness::run_pinger(
            Arc::clone(&registry),
            liveness::PING_INTERVAL,
            liveness::PONG_TIMEOUT,
            shutdown.clone(),
        ));
        let reaper = tokio::spawn(liveness::run_reaper(
            Arc::clone(&registry),
            liveness::REAP_INTERVAL,
            liveness::IDLE_LIMIT,
            shutdown,
        ));

        let ctx = Arc::new(Self {
            config: Arc::new(config),
            issuer,
            registry,
            router,
            events,
            started_at: Instant::now(),
        });
        (ctx, vec![router_task, pinger, reaper])
    }
}
