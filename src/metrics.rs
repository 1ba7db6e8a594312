//! In-memory performance metrics.
//!
//! Bounded reservoirs (oldest-evicted) per measurement category with
//! mean/min/max/p50/p95 summaries. The auto-tuner reads these; nothing here
//! persists.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_RESERVOIR_CAP: usize = 1000;

/// Fixed-capacity sample buffer. Pushing past capacity evicts the oldest
/// sample.
#[derive(Debug, Clone)]
pub struct Reservoir {
    cap: usize,
    samples: VecDeque<f64>,
}

impl Reservoir {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    /// Summary statistics, or `None` when empty.
    pub fn summary(&self) -> Option<Summary> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("metric samples are finite"));
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        Some(Summary {
            mean,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            count,
        })
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub count: usize,
}

// ─── Mesh metrics ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Inner {
    send_latency_ms: Reservoir,
    process_latency_ms: Reservoir,
    heartbeat_interval_s: Reservoir,
    retry_counts: Reservoir,
    retry_interval_ms: Reservoir,
    backpressure_wait_ms: Reservoir,
    queue_length: Reservoir,
    compression_ratio: Reservoir,
    bytes_saved: Reservoir,
}

/// All reservoirs tracked by one mesh adapter.
#[derive(Debug)]
pub struct MeshMetrics {
    inner: Mutex<Inner>,
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RESERVOIR_CAP)
    }
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                send_latency_ms: Reservoir::new(cap),
                process_latency_ms: Reservoir::new(cap),
                heartbeat_interval_s: Reservoir::new(cap),
                retry_counts: Reservoir::new(cap),
                retry_interval_ms: Reservoir::new(cap),
                backpressure_wait_ms: Reservoir::new(cap),
                queue_length: Reservoir::new(cap),
                compression_ratio: Reservoir::new(cap),
                bytes_saved: Reservoir::new(cap),
            }),
        }
    }

    pub fn record_send_latency_ms(&self, ms: f64) {
        self.lock().send_latency_ms.push(ms);
    }

    pub fn record_process_latency_ms(&self, ms: f64) {
        self.lock().process_latency_ms.push(ms);
    }

    pub fn record_heartbeat_interval_s(&self, s: f64) {
        self.lock().heartbeat_interval_s.push(s);
    }

    pub fn record_retry(&self, attempt: u32, interval_ms: f64) {
        let mut inner = self.lock();
        inner.retry_counts.push(f64::from(attempt));
        inner.retry_interval_ms.push(interval_ms);
    }

    pub fn record_backpressure_wait_ms(&self, ms: f64) {
        self.lock().backpressure_wait_ms.push(ms);
    }

    pub fn record_queue_length(&self, len: usize) {
        self.lock().queue_length.push(len as f64);
    }

    pub fn record_compression(&self, original: usize, compressed: usize) {
        let mut inner = self.lock();
        inner
            .compression_ratio
            .push(compressed as f64 / original as f64);
        inner.bytes_saved.push(original.saturating_sub(compressed) as f64);
    }

    /// Point-in-time view used by the auto-tuner and status surfaces.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        MetricsSnapshot {
            send_latency_ms: inner.send_latency_ms.summary(),
            process_latency_ms: inner.process_latency_ms.summary(),
            heartbeat_interval_s: inner.heartbeat_interval_s.summary(),
            retry_counts: inner.retry_counts.summary(),
            retry_interval_ms: inner.retry_interval_ms.summary(),
            backpressure_wait_ms: inner.backpressure_wait_ms.summary(),
            queue_length: inner.queue_length.summary(),
            compression_ratio: inner.compression_ratio.summary(),
            total_bytes_saved: inner.bytes_saved.sum(),
            total_retries: inner.retry_counts.len() as u64,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("metrics lock poisoned")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub send_latency_ms: Option<Summary>,
    pub process_latency_ms: Option<Summary>,
    pub heartbeat_interval_s: Option<Summary>,
    pub retry_counts: Option<Summary>,
    pub retry_interval_ms: Option<Summary>,
    pub backpressure_wait_ms: Option<Summary>,
    pub queue_length: Option<Summary>,
    pub compression_ratio: Option<Summary>,
    pub total_bytes_saved: f64,
    /// One entry is recorded per retry attempt, so the reservoir length is
    /// the retry total (within the eviction window).
    pub total_retries: u64,
}

impl MetricsSnapshot {
    pub fn send_count(&self) -> usize {
        self.send_latency_ms.map_or(0, |s| s.count)
    }

    /// `1 − retries/(messages + retries)`; `1.0` with no traffic.
    pub fn success_rate(&self) -> f64 {
        let messages = self.send_count() as f64;
        let retries = self.total_retries as f64;
        if messages + retries == 0.0 {
            return 1.0;
        }
        1.0 - retries / (messages + retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservoir_evicts_oldest_when_full() {
        let mut r = Reservoir::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            r.push(v);
        }
        assert_eq!(r.len(), 3);
        let s = r.summary().unwrap();
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 4.0);
    }

    #[test]
    fn summary_percentiles() {
        let mut r = Reservoir::new(100);
        for v in 1..=100 {
            r.push(f64::from(v));
        }
        let s = r.summary().unwrap();
        assert_eq!(s.count, 100);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 100.0);
        assert_eq!(s.p50, 51.0);
        assert_eq!(s.p95, 96.0);
        assert!((s.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn empty_reservoir_has_no_summary() {
        assert!(Reservoir::new(10).summary().is_none());
    }

    #[test]
    fn success_rate_combines_sends_and_retries() {
        let metrics = MeshMetrics::new();
        for _ in 0..90 {
            metrics.record_send_latency_ms(10.0);
        }
        for i in 0..10u32 {
            metrics.record_retry(i % 3 + 1, 250.0);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.send_count(), 90);
        assert_eq!(snap.total_retries, 10);
        assert!((snap.success_rate() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn success_rate_defaults_to_one_when_idle() {
        assert_eq!(MeshMetrics::new().snapshot().success_rate(), 1.0);
    }
}
