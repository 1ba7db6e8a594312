//! Version-vector config replication.
//!
//! Every node owns a vector `node-id → version` and bumps its own entry on
//! each published update. Incoming updates are adopted when their vector
//! dominates what was last applied for that `(section, parameter)`, dropped
//! when dominated, and tie-broken deterministically when concurrent:
//! priority, then timestamp, then lexicographic origin id. All replicas
//! therefore converge to the same value per key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigRegistry;
use crate::envelope::now_ms;
use crate::events::{EventBus, FabricEvent};

pub type VersionVector = BTreeMap<String, u64>;

/// Outcome of a component-wise vector comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrder {
    Dominates,
    Dominated,
    Concurrent,
}

/// Compare `a` against `b` component-wise. Entries absent from one vector
/// count as zero.
pub fn compare_vectors(a: &VersionVector, b: &VersionVector) -> VectorOrder {
    let mut a_ahead = false;
    let mut b_ahead = false;
    for (node, &va) in a {
        let vb = b.get(node).copied().unwrap_or(0);
        if va > vb {
            a_ahead = true;
        } else if va < vb {
            b_ahead = true;
        }
    }
    for (node, &vb) in b {
        if !a.contains_key(node) && vb > 0 {
            b_ahead = true;
        }
    }
    match (a_ahead, b_ahead) {
        (true, false) => VectorOrder::Dominates,
        (false, true) => VectorOrder::Dominated,
        _ => VectorOrder::Concurrent,
    }
}

/// One replicated configuration change. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdate {
    pub section: String,
    pub parameter: String,
    pub value: Value,
    /// Wall-clock ms at the origin; tiebreak input only.
    pub timestamp: i64,
    pub origin_node_id: String,
    pub priority: i32,
    pub version_vector: VersionVector,
}

impl ConfigUpdate {
    pub fn key(&self) -> String {
        format!("{}.{}", self.section, self.parameter)
    }
}

/// `true` when `incoming` wins the deterministic concurrent tiebreak
/// against `existing`.
fn wins_tiebreak(incoming: &ConfigUpdate, existing: &ConfigUpdate) -> bool {
    if incoming.priority != existing.priority {
        return incoming.priority > existing.priority;
    }
    if incoming.timestamp != existing.timestamp {
        return incoming.timestamp > existing.timestamp;
    }
    incoming.origin_node_id > existing.origin_node_id
}

#[derive(Debug, Default)]
struct ReplicatorInner {
    vector: VersionVector,
    /// Last update applied per `section.parameter`.
    applied: HashMap<String, ConfigUpdate>,
    /// Updates that won their comparison but failed local apply; retried on
    /// the next gossip touching the same key.
    pending: HashMap<String, ConfigUpdate>,
    /// Peer id → when we last heard from it.
    active_peers: HashMap<String, Instant>,
    is_coordinator: bool,
}

/// Replicates `(section, parameter)` config values across the mesh and
/// elects the coordinator that is allowed to publish tuner decisions.
pub struct ConfigReplicator {
    node_id: String,
    registry: Arc<ConfigRegistry>,
    events: EventBus,
    inner: Mutex<ReplicatorInner>,
}

impl ConfigReplicator {
    pub fn new(node_id: impl Into<String>, registry: Arc<ConfigRegistry>, events: EventBus) -> Self {
        let node_id = node_id.into();
        let mut inner = ReplicatorInner::default();
        inner.vector.insert(node_id.clone(), 0);
        // Alone in the mesh, a node coordinates itself.
        inner.is_coordinator = true;
        Self {
            node_id,
            registry,
            events,
            inner: Mutex::new(inner),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a local config change: bump our vector entry, apply locally,
    /// and return the update to broadcast to peers.
    pub fn publish(
        &self,
        section: &str,
        parameter: &str,
        value: Value,
        priority: i32,
    ) -> ConfigUpdate {
        let update = {
            let mut inner = self.lock();
            let entry = inner.vector.entry(self.node_id.clone()).or_insert(0);
            *entry += 1;
            ConfigUpdate {
                section: section.to_string(),
                parameter: parameter.to_string(),
                value,
                timestamp: now_ms(),
                origin_node_id: self.node_id.clone(),
                priority,
                version_vector: inner.vector.clone(),
            }
        };
        self.absorb(update.clone());
        update
    }

    /// Absorb an update from the mesh (or our own publish loopback).
    /// Applies, drops, or tiebreaks per the dominance rules.
    pub fn absorb(&self, update: ConfigUpdate) {
        let key = update.key();
        let decision = {
            let mut inner = self.lock();
            if update.origin_node_id != self.node_id {
                inner
                    .active_peers
                    .insert(update.origin_node_id.clone(), Instant::now());
            }
            // Merge vectors component-wise regardless of the apply decision.
            for (node, &version) in &update.version_vector {
                let entry = inner.vector.entry(node.clone()).or_insert(0);
                *entry = (*entry).max(version);
            }

            let reference = inner
                .pending
                .get(&key)
                .or_else(|| inner.applied.get(&key));
            match reference {
                None => true,
                Some(existing) => match compare_vectors(&update.version_vector, &existing.version_vector) {
                    VectorOrder::Dominates => true,
                    VectorOrder::Dominated => {
                        debug!(key, origin = %update.origin_node_id, "dropping dominated config update");
                        false
                    }
                    VectorOrder::Concurrent => {
                        let wins = wins_tiebreak(&update, existing);
                        if !wins {
                            debug!(key, origin = %update.origin_node_id, "concurrent config update lost tiebreak");
                        }
                        wins
                    }
                },
            }
        };

        if decision {
            self.apply(update);
        }
    }

    fn apply(&self, update: ConfigUpdate) {
        let key = update.key();
        match self
            .registry
            .set(&update.section, &update.parameter, update.value.clone())
        {
            Ok(old_value) => {
                info!(
                    key,
                    value = %update.value,
                    origin = %update.origin_node_id,
                    "applied config update"
                );
                self.events.publish(FabricEvent::ConfigUpdated {
                    section: update.section.clone(),
                    parameter: update.parameter.clone(),
                    old_value,
                    new_value: update.value.clone(),
                    origin_node: update.origin_node_id.clone(),
                });
                let mut inner = self.lock();
                inner.pending.remove(&key);
                inner.applied.insert(key, update);
            }
            Err(e) => {
                warn!(key, err = %e, "config update failed to apply — keeping pending");
                self.lock().pending.insert(key, update);
            }
        }
    }

    /// Record that a peer was heard from (heartbeats call this).
    pub fn observe_peer(&self, node_id: &str) {
        if node_id == self.node_id {
            return;
        }
        self.lock()
            .active_peers
            .insert(node_id.to_string(), Instant::now());
    }

    /// Peers heard from within the retention window.
    pub fn active_peers(&self, retention: Duration) -> Vec<String> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner
            .active_peers
            .retain(|_, last| now.duration_since(*last) <= retention);
        inner.active_peers.keys().cloned().collect()
    }

    /// Re-evaluate the coordinator role: the lexicographic minimum among
    /// self ∪ active peers. `heartbeat_interval` scales the liveness window.
    /// Announces role flips on the event bus.
    pub fn update_coordinator_status(&self, heartbeat_interval: Duration) -> bool {
        let retention = heartbeat_interval.mul_f64(
            self.registry.sync().peer_retention_heartbeats.max(1.0),
        );
        let peers = self.active_peers(retention);
        let coordinator = peers
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.node_id.as_str()))
            .min()
            .expect("candidate set includes self")
            == self.node_id;

        let flipped = {
            let mut inner = self.lock();
            let flipped = inner.is_coordinator != coordinator;
            inner.is_coordinator = coordinator;
            flipped
        };
        if flipped {
            info!(node = %self.node_id, coordinator, "coordinator role changed");
            self.events.publish(FabricEvent::CoordinatorChanged {
                node_id: self.node_id.clone(),
                is_coordinator: coordinator,
            });
        }
        coordinator
    }

    pub fn is_coordinator(&self) -> bool {
        self.lock().is_coordinator
    }

    pub fn version_vector(&self) -> VersionVector {
        self.lock().vector.clone()
    }

    /// Status surface: node id, role, peers, vector, and apply counts.
    pub fn status(&self) -> ReplicatorStatus {
        let inner = self.lock();
        ReplicatorStatus {
            node_id: self.node_id.clone(),
            is_coordinator: inner.is_coordinator,
            active_peers: inner.active_peers.keys().cloned().collect(),
            version_vector: inner.vector.clone(),
            applied_updates: inner.applied.len(),
            pending_updates: inner.pending.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplicatorInner> {
        self.inner.lock().expect("replicator lock poisoned")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorStatus {
    pub node_id: String,
    pub is_coordinator: bool,
    pub active_peers: Vec<String>,
    pub version_vector: VersionVector,
    pub applied_updates: usize,
    pub pending_updates: usize,
}
