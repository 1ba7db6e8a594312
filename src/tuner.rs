//! Closed-loop auto-tuner.
//!
//! A periodic controller that reads the metrics reservoirs, classifies the
//! network, and publishes bounded config adjustments through the replicator.
//! Only the cluster coordinator publishes; every other node observes. Each
//! adjustment is capped at `max_adjustment_pct` and nothing moves while
//! performance sits within the hysteresis band of its targets.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConfigTree, TunerSection};
use crate::mesh::MeshAdapter;
use crate::metrics::MetricsSnapshot;

// ─── Network classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkBucket {
    Good,
    Fair,
    Poor,
    Extreme,
}

/// Estimated network condition derived from the send-latency and retry
/// reservoirs.
#[derive(Debug, Clone, Copy)]
pub struct NetworkCondition {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
}

impl NetworkCondition {
    pub fn from_metrics(snapshot: &MetricsSnapshot) -> Self {
        let (p50, p95) = snapshot
            .send_latency_ms
            .map_or((0.0, 0.0), |s| (s.p50, s.p95));
        let messages = snapshot.send_count() as f64;
        let retries = snapshot.total_retries as f64;
        let packet_loss = if messages > 0.0 {
            (retries / (messages + retries)).min(1.0)
        } else {
            0.0
        };
        Self {
            latency_ms: p50,
            jitter_ms: (p95 - p50).max(0.0),
            packet_loss,
        }
    }

    /// Bucket by (p50 latency, loss); inclusive upper bounds.
    pub fn bucket(&self) -> NetworkBucket {
        if self.latency_ms <= 50.0 && self.packet_loss <= 0.01 {
            NetworkBucket::Good
        } else if self.latency_ms <= 200.0 && self.packet_loss <= 0.05 {
            NetworkBucket::Fair
        } else if self.latency_ms <= 500.0 && self.packet_loss <= 0.10 {
            NetworkBucket::Poor
        } else {
            NetworkBucket::Extreme
        }
    }
}

// ─── Goal evaluation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Issue {
    HighLatency { p95_ms: f64 },
    LowSuccess { rate: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct GoalEval {
    pub met: bool,
    /// Relative error of the worse dimension.
    pub error: f64,
    pub issue: Option<Issue>,
}

/// Compare observed p95 latency and success rate against targets.
pub fn evaluate_goals(targets: &TunerSection, snapshot: &MetricsSnapshot) -> GoalEval {
    let p95 = snapshot
        .send_latency_ms
        .map_or(f64::INFINITY, |s| s.p95);
    let success = snapshot.success_rate();

    let latency_error = (p95 - targets.target_p95_latency_ms) / targets.target_p95_latency_ms;
    let success_error = (targets.target_success_rate - success) / targets.target_success_rate;

    let met = p95 <= targets.target_p95_latency_ms && success >= targets.target_success_rate;
    let error = latency_error.max(success_error);
    let issue = if met || error <= 0.0 {
        None
    } else if latency_error >= success_error {
        Some(Issue::HighLatency { p95_ms: p95 })
    } else {
        Some(Issue::LowSuccess { rate: success })
    };
    GoalEval { met, error, issue }
}

// ─── Adjustments ──────────────────────────────────────────────────────────────

/// One config change the tuner decided on.
#[derive(Debug, Clone)]
pub struct Adjustment {
    pub section: &'static str,
    pub parameter: &'static str,
    pub old_value: Value,
    pub new_value: Value,
    pub reason: &'static str,
}

impl std::fmt::Display for Adjustment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}: {} -> {} ({})",
            self.section, self.parameter, self.old_value, self.new_value, self.reason
        )
    }
}

fn adjustment(
    parameter: &'static str,
    old: impl Into<Value>,
    new: impl Into<Value>,
    reason: &'static str,
) -> Adjustment {
    Adjustment {
        section: "mesh",
        parameter,
        old_value: old.into(),
        new_value: new.into(),
        reason,
    }
}

/// The policy table: map (issue, bucket, error) to bounded adjustments.
/// Pure — decisions only, no publishing.
pub fn generate_adjustments(
    tree: &ConfigTree,
    snapshot: &MetricsSnapshot,
    eval: &GoalEval,
    bucket: NetworkBucket,
) -> Vec<Adjustment> {
    let tuner = &tree.auto_tuner;
    if eval.error <= tuner.hysteresis_factor {
        return Vec::new();
    }
    let factor = eval.error.min(tuner.max_adjustment_pct);
    let mesh = &tree.mesh;
    let mut out = Vec::new();

    match eval.issue {
        Some(Issue::HighLatency { .. }) => {
            if bucket >= NetworkBucket::Poor {
                let new_size = ((mesh.batch_size_limit as f64 * (1.0 + factor)) as u64).max(1);
                out.push(adjustment(
                    "batch_size_limit",
                    mesh.batch_size_limit as u64,
                    new_size,
                    "grow batches to cut frame count",
                ));

                let new_time = (mesh.batch_time_limit_ms as f64 * (1.0 + factor)) as u64;
                out.push(adjustment(
                    "batch_time_limit_ms",
                    mesh.batch_time_limit_ms,
                    new_time,
                    "give batches longer to fill",
                ));

                if !mesh.enable_backpressure {
                    out.push(adjustment(
                        "enable_backpressure",
                        false,
                        true,
                        "smooth egress under load",
                    ));
                }
                if bucket == NetworkBucket::Extreme && !mesh.enable_compression {
                    out.push(adjustment(
                        "enable_compression",
                        false,
                        true,
                        "shrink frames on an extreme link",
                    ));
                }
            }
            if mesh.enable_backpressure {
                let new_rate = mesh.token_rate * (1.0 - factor / 2.0);
                out.push(adjustment(
                    "token_rate",
                    mesh.token_rate,
                    new_rate,
                    "shed egress load",
                ));
            }
        }
        Some(Issue::LowSuccess { .. }) => {
            if !mesh.enable_retries {
                out.push(adjustment(
                    "enable_retries",
                    false,
                    true,
                    "recover lost frames",
                ));
            }

            let new_retries = ((mesh.max_retries as f64 * (1.0 + factor)) as u64).min(10);
            if new_retries > u64::from(mesh.max_retries) {
                out.push(adjustment(
                    "max_retries",
                    mesh.max_retries,
                    new_retries,
                    "more attempts against loss",
                ));
            }

            if bucket >= NetworkBucket::Poor {
                let new_size = ((mesh.batch_size_limit as f64 * (1.0 - factor)) as u64).max(1);
                out.push(adjustment(
                    "batch_size_limit",
                    mesh.batch_size_limit as u64,
                    new_size,
                    "smaller batches lose less per drop",
                ));
            }

            let p95 = snapshot.send_latency_ms.map_or(100.0, |s| s.p95);
            let new_interval = ((p95 * 2.0) as u64).clamp(100, 2000);
            out.push(adjustment(
                "retry_interval_ms",
                mesh.retry_interval_ms,
                new_interval,
                "match retry pacing to observed latency",
            ));
        }
        None => {}
    }
    out
}

// ─── Controller ───────────────────────────────────────────────────────────────

pub struct AutoTuner {
    adapter: Arc<MeshAdapter>,
}

impl AutoTuner {
    pub fn new(adapter: Arc<MeshAdapter>) -> Self {
        Self { adapter }
    }

    /// One controller tick. Returns the adjustments that were published.
    pub async fn tick(&self) -> Vec<Adjustment> {
        let heartbeat = self.adapter.status().heartbeat_interval;
        if !self
            .adapter
            .replicator()
            .update_coordinator_status(heartbeat)
        {
            debug!("not coordinator — observing only");
            return Vec::new();
        }

        let tree = self.adapter.config().snapshot();
        let snapshot = self.adapter.metrics().snapshot();
        if snapshot.send_count() < tree.auto_tuner.min_samples {
            debug!(
                samples = snapshot.send_count(),
                needed = tree.auto_tuner.min_samples,
                "not enough samples — skipping adjustment"
            );
            return Vec::new();
        }

        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        if eval.met {
            debug!("performance within goals — no adjustment");
            return Vec::new();
        }

        let condition = NetworkCondition::from_metrics(&snapshot);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, condition.bucket());

        for adj in &adjustments {
            let published = self
                .adapter
                .publish_config(adj.section, adj.parameter, adj.new_value.clone(), 0)
                .await;
            if published {
                info!(adjustment = %adj, "published tuning adjustment");
            } else {
                warn!(adjustment = %adj, "failed to publish tuning adjustment");
            }
        }
        adjustments
    }

    /// The periodic loop. Tick cadence comes from config each round, so a
    /// replicated change to `interval_seconds` takes effect next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.adapter.config().tuner().interval_seconds;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(interval.max(1.0))) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if !self.adapter.config().tuner().enable {
                continue;
            }
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRegistry;
    use serde_json::json;
    use crate::counter::GlobalCounter;
    use crate::events::EventBus;
    use crate::mesh::transport::LocalBus;
    use crate::metrics::MeshMetrics;

    fn snapshot_with(latency_ms: f64, sends: usize, retries: usize) -> MetricsSnapshot {
        let metrics = MeshMetrics::new();
        for _ in 0..sends {
            metrics.record_send_latency_ms(latency_ms);
        }
        for _ in 0..retries {
            metrics.record_retry(1, latency_ms);
        }
        metrics.snapshot()
    }

    #[test]
    fn network_buckets_have_inclusive_bounds() {
        let cond = |latency_ms, packet_loss| NetworkCondition {
            latency_ms,
            jitter_ms: 0.0,
            packet_loss,
        };
        assert_eq!(cond(50.0, 0.01).bucket(), NetworkBucket::Good);
        assert_eq!(cond(51.0, 0.0).bucket(), NetworkBucket::Fair);
        assert_eq!(cond(200.0, 0.05).bucket(), NetworkBucket::Fair);
        assert_eq!(cond(10.0, 0.08).bucket(), NetworkBucket::Poor);
        assert_eq!(cond(501.0, 0.0).bucket(), NetworkBucket::Extreme);
        assert_eq!(cond(10.0, 0.5).bucket(), NetworkBucket::Extreme);
    }

    #[test]
    fn goals_met_within_targets() {
        let targets = TunerSection::default();
        let eval = evaluate_goals(&targets, &snapshot_with(100.0, 50, 0));
        assert!(eval.met);
        assert!(eval.issue.is_none());
    }

    #[test]
    fn high_latency_dominates_when_worse() {
        let targets = TunerSection::default();
        let eval = evaluate_goals(&targets, &snapshot_with(2000.0, 50, 0));
        assert!(!eval.met);
        assert!(matches!(eval.issue, Some(Issue::HighLatency { .. })));
        assert!(eval.error > 0.1);
    }

    #[test]
    fn low_success_detected_from_retry_ratio() {
        let targets = TunerSection::default();
        // 50 sends, 50 retries → 50% success, latency fine.
        let eval = evaluate_goals(&targets, &snapshot_with(10.0, 50, 50));
        assert!(!eval.met);
        assert!(matches!(eval.issue, Some(Issue::LowSuccess { .. })));
    }

    #[test]
    fn hysteresis_suppresses_small_errors() {
        let tree = ConfigTree::default();
        let snapshot = snapshot_with(520.0, 50, 0); // 4% over target
        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        assert!(!eval.met);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, NetworkBucket::Poor);
        assert!(adjustments.is_empty());
    }

    #[test]
    fn high_latency_on_poor_network_grows_batches_and_enables_backpressure() {
        let tree = ConfigTree::default();
        let snapshot = snapshot_with(2000.0, 50, 0);
        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, NetworkBucket::Poor);

        let names: Vec<_> = adjustments.iter().map(|a| a.parameter).collect();
        assert!(names.contains(&"batch_size_limit"));
        assert!(names.contains(&"batch_time_limit_ms"));
        assert!(names.contains(&"enable_backpressure"));
        assert!(!names.contains(&"enable_compression"));
        // Growth capped at max_adjustment_pct: 10 → 12.
        let batch = adjustments
            .iter()
            .find(|a| a.parameter == "batch_size_limit")
            .unwrap();
        assert_eq!(batch.new_value, json!(12));
    }

    #[test]
    fn extreme_network_also_enables_compression() {
        let tree = ConfigTree::default();
        let snapshot = snapshot_with(2000.0, 50, 0);
        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, NetworkBucket::Extreme);
        assert!(adjustments
            .iter()
            .any(|a| a.parameter == "enable_compression"));
    }

    #[test]
    fn backpressure_already_on_lowers_token_rate_everywhere() {
        let mut tree = ConfigTree::default();
        tree.mesh.enable_backpressure = true;
        let snapshot = snapshot_with(2000.0, 50, 0);
        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, NetworkBucket::Good);
        let rate = adjustments
            .iter()
            .find(|a| a.parameter == "token_rate")
            .expect("token rate lowered");
        // Half the capped 20% factor: 10 → 9.
        assert_eq!(rate.new_value, json!(9.0));
    }

    #[test]
    fn low_success_enables_retries_and_paces_them_to_latency() {
        let tree = ConfigTree::default();
        let snapshot = snapshot_with(400.0, 50, 50);
        let eval = evaluate_goals(&tree.auto_tuner, &snapshot);
        let adjustments =
            generate_adjustments(&tree, &snapshot, &eval, NetworkBucket::Fair);

        assert!(adjustments.iter().any(|a| a.parameter == "enable_retries"));
        let interval = adjustments
            .iter()
            .find(|a| a.parameter == "retry_interval_ms")
            .unwrap();
        assert_eq!(interval.new_value, json!(800));
    }

    #[tokio::test]
    async fn non_coordinator_node_observes_only() {
        let bus = LocalBus::new();
        let adapter = MeshAdapter::new(
            "node-b",
            Arc::new(bus),
            Arc::new(ConfigRegistry::new()),
            Arc::new(GlobalCounter::new()),
            EventBus::new(),
        );
        // A lexicographically smaller peer owns coordination.
        adapter.replicator().observe_peer("node-a");
        for _ in 0..20 {
            adapter.metrics().record_send_latency_ms(5000.0);
        }
        let tuner = AutoTuner::new(Arc::clone(&adapter));
        assert!(tuner.tick().await.is_empty());
    }

    #[tokio::test]
    async fn too_few_samples_skip_adjustment() {
        let bus = LocalBus::new();
        let adapter = MeshAdapter::new(
            "node-a",
            Arc::new(bus),
            Arc::new(ConfigRegistry::new()),
            Arc::new(GlobalCounter::new()),
            EventBus::new(),
        );
        adapter.metrics().record_send_latency_ms(5000.0);
        let tuner = AutoTuner::new(Arc::clone(&adapter));
        assert!(tuner.tick().await.is_empty());
    }

    #[tokio::test]
    async fn coordinator_publishes_adjustments_into_config() {
        let bus = LocalBus::new();
        let adapter = MeshAdapter::new(
            "node-a",
            Arc::new(bus),
            Arc::new(ConfigRegistry::new()),
            Arc::new(GlobalCounter::new()),
            EventBus::new(),
        );
        adapter.start();
        for _ in 0..20 {
            adapter.metrics().record_send_latency_ms(50.0);
        }
        for _ in 0..40 {
            adapter.metrics().record_retry(1, 50.0);
        }

        let tuner = AutoTuner::new(Arc::clone(&adapter));
        let adjustments = tuner.tick().await;
        assert!(!adjustments.is_empty());
        assert!(adapter.config().mesh().enable_retries);
        adapter.shutdown().await;
    }
}
