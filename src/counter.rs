//! Replicated tool-call counter.
//!
//! Each node owns a grow-only count; the cluster total is the sum of all
//! per-node counts. Remote updates are applied at most once per
//! `(node, logical_ts)` — a stale or replayed update is a no-op. Logical
//! timestamps are wall-clock milliseconds at the emitter, the same clock on
//! every node.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::envelope::now_ms;

/// One counter increment as replicated over the mesh. Immutable once
/// emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterUpdate {
    pub node_id: String,
    pub delta: i64,
    pub logical_ts: i64,
    #[serde(default = "CounterUpdate::default_kind")]
    pub counter_kind: String,
}

impl CounterUpdate {
    fn default_kind() -> String {
        "tool_call".to_string()
    }
}

#[derive(Debug, Default)]
struct CounterInner {
    counts: HashMap<String, i64>,
    /// Highest logical timestamp applied per node.
    applied_ts: HashMap<String, i64>,
    total: i64,
}

/// Per-node monotonic counters with totals computed by sum.
#[derive(Debug, Default)]
pub struct GlobalCounter {
    inner: Mutex<CounterInner>,
}

impl GlobalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump this node's count and return the new total plus the update to
    /// gossip to peers.
    pub fn increment(&self, node_id: &str) -> (i64, CounterUpdate) {
        let mut inner = self.lock();
        *inner.counts.entry(node_id.to_string()).or_insert(0) += 1;
        // Wall-clock ms, nudged forward so two increments inside the same
        // millisecond still carry distinct timestamps.
        let last = inner.applied_ts.get(node_id).copied().unwrap_or(0);
        let ts = now_ms().max(last + 1);
        inner.applied_ts.insert(node_id.to_string(), ts);
        inner.total = inner.counts.values().sum();
        (
            inner.total,
            CounterUpdate {
                node_id: node_id.to_string(),
                delta: 1,
                logical_ts: ts,
                counter_kind: CounterUpdate::default_kind(),
            },
        )
    }

    /// Apply a peer's update. Stale timestamps (≤ the last applied for that
    /// node) are dropped, which makes replays idempotent.
    pub fn apply(&self, update: &CounterUpdate) -> i64 {
        let mut inner = self.lock();
        let last = inner.applied_ts.get(&update.node_id).copied().unwrap_or(0);
        if update.logical_ts <= last {
            return inner.total;
        }
        *inner.counts.entry(update.node_id.clone()).or_insert(0) += update.delta;
        inner
            .applied_ts
            .insert(update.node_id.clone(), update.logical_ts);
        inner.total = inner.counts.values().sum();
        inner.total
    }

    pub fn total(&self) -> i64 {
        self.lock().total
    }

    pub fn node_count(&self, node_id: &str) -> i64 {
        self.lock().counts.get(node_id).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.counts.clear();
        inner.applied_ts.clear();
        inner.total = 0;
    }

    pub fn reset_node(&self, node_id: &str) {
        let mut inner = self.lock();
        if let Some(count) = inner.counts.get_mut(node_id) {
            *count = 0;
        }
        inner.total = inner.counts.values().sum();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CounterInner> {
        self.inner.lock().expect("counter lock poisoned")
    }
}

// ─── Tool gate ────────────────────────────────────────────────────────────────

/// Raised when the replicated call count passes the configured limit.
#[derive(Debug, thiserror::Error)]
#[error("tool call limit exceeded: {tool}")]
pub struct QuotaExceeded {
    pub tool: String,
}

/// Quota guard in front of a named tool. Counts through the shared
/// [`GlobalCounter`], so a quota reached anywhere in the cluster is reached
/// everywhere once updates converge.
pub struct ToolGate {
    tool: String,
    node_id: String,
    call_limit: u64,
    counter: Arc<GlobalCounter>,
    exhausted: std::sync::atomic::AtomicBool,
}

impl ToolGate {
    pub fn new(
        tool: impl Into<String>,
        node_id: impl Into<String>,
        call_limit: u64,
        counter: Arc<GlobalCounter>,
    ) -> Self {
        Self {
            tool: tool.into(),
            node_id: node_id.into(),
            call_limit,
            counter,
            exhausted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn call_count(&self) -> i64 {
        self.counter.total()
    }

    /// Count one invocation. Returns the update to broadcast to peers, or
    /// `QuotaExceeded` once the latch is set or the total passes the limit.
    ///
    /// The increment that crosses the limit still counts (the call was
    /// attempted); only the error is surfaced.
    pub fn begin_call(&self) -> Result<CounterUpdate, QuotaExceeded> {
        use std::sync::atomic::Ordering;
        if self.exhausted.load(Ordering::Relaxed) {
            return Err(QuotaExceeded {
                tool: self.tool.clone(),
            });
        }
        let (total, update) = self.counter.increment(&self.node_id);
        if total > self.call_limit as i64 {
            return Err(QuotaExceeded {
                tool: self.tool.clone(),
            });
        }
        Ok(update)
    }

    /// Latch (or clear) the exhausted state independent of the count, e.g.
    /// when an upstream signals the quota was consumed elsewhere.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted
            .store(exhausted, std::sync::atomic::Ordering::Relaxed);
    }
}

// ─── Process-wide default ─────────────────────────────────────────────────────

static DEFAULT: Lazy<Mutex<Option<Arc<GlobalCounter>>>> = Lazy::new(|| Mutex::new(None));

/// Install (or return the existing) process-wide counter.
pub fn init_default_counter() -> Arc<GlobalCounter> {
    let mut slot = DEFAULT.lock().expect("default counter lock poisoned");
    slot.get_or_insert_with(|| Arc::new(GlobalCounter::new()))
        .clone()
}

pub fn default_counter() -> Option<Arc<GlobalCounter>> {
    DEFAULT.lock().expect("default counter lock poisoned").clone()
}

pub fn shutdown_default_counter() {
    DEFAULT
        .lock()
        .expect("default counter lock poisoned")
        .take();
}
