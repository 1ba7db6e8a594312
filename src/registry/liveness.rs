//! Liveness sweepers: pinger and reaper.
//!
//! The pinger disconnects peers that have not produced activity within the
//! pong timeout and pings the rest. The reaper closes connections idle for
//! ten minutes. Both loops exit within one tick of shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{ConnectionRegistry, CLOSE_NORMAL};

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(15);
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);
pub const IDLE_LIMIT: Duration = Duration::from_secs(600);

const TIMEOUT_REASON: &str = "Session timeout";

/// Periodic ping sweep. Runs every `ping_interval` until shutdown.
pub async fn run_pinger(
    registry: Arc<ConnectionRegistry>,
    ping_interval: Duration,
    pong_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ping_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        // Unresponsive first: anything silent past the pong timeout goes.
        for session_id in registry.idle_sessions(pong_timeout) {
            warn!(session_id, "no activity within pong timeout — disconnecting");
            registry.close_and_disconnect(&session_id, Some((CLOSE_NORMAL, TIMEOUT_REASON)));
        }

        for session_id in registry.ping_all() {
            warn!(session_id, "ping send failed — disconnecting");
            registry.disconnect(&session_id);
        }
    }
}

/// Reaper sweep: close sessions idle past `idle_limit`.
pub async fn run_reaper(
    registry: Arc<ConnectionRegistry>,
    reap_interval: Duration,
    idle_limit: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(reap_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        for session_id in registry.idle_sessions(idle_limit) {
            info!(session_id, "idle past limit — reaping");
            registry.close_and_disconnect(&session_id, Some((CLOSE_NORMAL, TIMEOUT_REASON)));
        }
    }
}
