//! Idempotent-message retry with exponential backoff and full jitter.
//!
//! Every tracked frame gets a background task that resends it on a jittered
//! schedule until an acknowledgement arrives or `max_retries` is exhausted.
//! Waits are sampled uniformly from `[0, min(base·2^k, max_interval)]` for
//! retry `k` (1-based), so synchronized peers don't stampede.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MeshSection;
use crate::metrics::{MeshMetrics, MetricsSnapshot};

use super::wire::WireFrame;

pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot of the retry knobs taken at send time.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl RetrySettings {
    /// Derive settings from config, raising the base interval to
    /// `2 × p95(send latency)` when observed latency says 500 ms is too
    /// optimistic.
    pub fn from_config(mesh: &MeshSection, metrics: &MetricsSnapshot) -> Self {
        let mut base_ms = mesh.retry_interval_ms as f64;
        if let Some(send) = metrics.send_latency_ms {
            base_ms = base_ms.max(send.p95 * 2.0);
        }
        Self {
            enabled: mesh.enable_retries,
            max_retries: mesh.max_retries,
            base_interval: Duration::from_millis(base_ms as u64),
            max_interval: MAX_RETRY_INTERVAL,
        }
    }
}

/// Wait before retry `attempt` (1-based): `U(0, min(base·2^attempt, cap))`.
pub fn full_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(cap);
    if exp.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..=exp)
}

/// Tracks in-flight idempotent frames and their retry tasks.
pub struct RetryManager {
    in_flight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    metrics: Arc<MeshMetrics>,
}

impl RetryManager {
    pub fn new(metrics: Arc<MeshMetrics>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    /// Start the retry task for an already-sent frame. `resend` feeds frames
    /// back to the egress path.
    pub fn track(
        &self,
        frame: WireFrame,
        settings: RetrySettings,
        resend: mpsc::UnboundedSender<WireFrame>,
    ) {
        if !settings.enabled || !frame.idempotent || settings.max_retries == 0 {
            return;
        }
        let message_id = frame.message_id.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);

        let task_id = message_id.clone();
        let handle = tokio::spawn(async move {
            for attempt in 1..=settings.max_retries {
                let wait = full_jitter(attempt, settings.base_interval, settings.max_interval);
                tokio::time::sleep(wait).await;

                debug!(message_id = %task_id, attempt, "retrying unacknowledged frame");
                metrics.record_retry(attempt, wait.as_secs_f64() * 1000.0);
                if resend.send(frame.clone()).is_err() {
                    break;
                }
            }
            warn!(message_id = %task_id, max = settings.max_retries, "no ack after max retries — dropping");
            in_flight.lock().expect("retry lock poisoned").remove(&task_id);
        });

        self.lock().insert(message_id, handle);
    }

    /// Acknowledge a frame: cancel its retry task. Unknown ids are no-ops.
    pub fn ack(&self, message_id: &str) {
        if let Some(handle) = self.lock().remove(message_id) {
            handle.abort();
        }
    }

    /// Cancel every outstanding retry task (shutdown path).
    pub fn cancel_all(&self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.in_flight.lock().expect("retry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::wire::FrameBody;

    fn settings(max_retries: u32) -> RetrySettings {
        RetrySettings {
            enabled: true,
            max_retries,
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(8),
        }
    }

    fn frame() -> WireFrame {
        WireFrame::new("node-a", true, FrameBody::Heartbeat { timestamp: 1 })
    }

    #[test]
    fn jitter_stays_under_the_exponential_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        for attempt in 1..=3u32 {
            let bound = Duration::from_millis(500 * 2u64.pow(attempt));
            for _ in 0..200 {
                let wait = full_jitter(attempt, base, cap);
                assert!(wait <= bound, "attempt {attempt}: {wait:?} > {bound:?}");
            }
        }
        // Deep attempts clamp at the hard cap.
        for _ in 0..200 {
            assert!(full_jitter(20, base, cap) <= cap);
        }
    }

    #[tokio::test]
    async fn resends_exactly_max_retries_then_drops() {
        let manager = RetryManager::new(Arc::new(MeshMetrics::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.track(frame(), settings(3), tx);

        let mut resends = 0;
        while tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            resends += 1;
        }
        assert_eq!(resends, 3);
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn ack_cancels_the_retry_task() {
        let manager = RetryManager::new(Arc::new(MeshMetrics::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = frame();
        let id = f.message_id.clone();
        manager.track(
            f,
            RetrySettings {
                base_interval: Duration::from_millis(50),
                ..settings(5)
            },
            tx,
        );
        assert_eq!(manager.in_flight_count(), 1);
        manager.ack(&id);
        assert_eq!(manager.in_flight_count(), 0);

        // Nothing arrives after cancellation.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .ok()
                .flatten()
                .is_none()
        );
    }

    #[tokio::test]
    async fn non_idempotent_frames_are_not_tracked() {
        let manager = RetryManager::new(Arc::new(MeshMetrics::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let f = WireFrame::new("n", false, FrameBody::Heartbeat { timestamp: 1 });
        manager.track(f, settings(3), tx);
        assert_eq!(manager.in_flight_count(), 0);
    }
}
