//! Sectioned runtime configuration shared across the mesh.
//!
//! Parameters are addressed as `(section, parameter)` pairs so the config
//! replicator and auto-tuner can mutate them dynamically. Reads take a cheap
//! cloned snapshot; every background loop re-reads its snapshot per tick, so
//! most parameter changes take effect without explicit plumbing.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config section: {0}")]
    UnknownSection(String),
    #[error("unknown parameter {section}.{parameter}")]
    UnknownParameter { section: String, parameter: String },
    #[error("invalid value for {section}.{parameter}: {reason}")]
    InvalidValue {
        section: String,
        parameter: String,
        reason: String,
    },
}

// ─── Sections ─────────────────────────────────────────────────────────────────

/// Mesh transport tunables. These are the parameters the auto-tuner adjusts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    pub enable_batching: bool,
    pub batch_size_limit: usize,
    pub batch_time_limit_ms: u64,

    pub enable_adaptive_heartbeat: bool,
    pub initial_heartbeat_interval_s: f64,
    pub min_heartbeat_interval_s: f64,
    pub max_heartbeat_interval_s: f64,
    pub heartbeat_success_threshold: u32,
    pub heartbeat_failure_threshold: u32,

    pub enable_compression: bool,
    /// Only payloads at least this many serialized bytes are considered for
    /// gzip.
    pub compression_threshold: usize,

    pub enable_retries: bool,
    pub max_retries: u32,
    pub retry_interval_ms: u64,

    pub enable_backpressure: bool,
    pub token_rate: f64,
    pub token_capacity: f64,
    pub max_queue_length: usize,
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            enable_batching: true,
            batch_size_limit: 10,
            batch_time_limit_ms: 100,
            enable_adaptive_heartbeat: true,
            initial_heartbeat_interval_s: 1.0,
            min_heartbeat_interval_s: 0.2,
            max_heartbeat_interval_s: 5.0,
            heartbeat_success_threshold: 3,
            heartbeat_failure_threshold: 1,
            enable_compression: false,
            compression_threshold: 1024,
            enable_retries: false,
            max_retries: 3,
            retry_interval_ms: 500,
            enable_backpressure: false,
            token_rate: 10.0,
            token_capacity: 20.0,
            max_queue_length: 100,
        }
    }
}

/// Auto-tuner targets and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSection {
    pub enable: bool,
    pub interval_seconds: f64,
    pub target_p95_latency_ms: f64,
    pub target_success_rate: f64,
    pub min_samples: usize,
    pub max_adjustment_pct: f64,
    pub hysteresis_factor: f64,
}

impl Default for TunerSection {
    fn default() -> Self {
        Self {
            enable: false,
            interval_seconds: 30.0,
            target_p95_latency_ms: 500.0,
            target_success_rate: 0.95,
            min_samples: 10,
            max_adjustment_pct: 0.2,
            hysteresis_factor: 0.1,
        }
    }
}

/// Config replication behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub enable: bool,
    pub coordinator_election: bool,
    /// A peer is active while seen within this many heartbeat intervals.
    pub peer_retention_heartbeats: f64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enable: false,
            coordinator_election: true,
            peer_retention_heartbeats: 3.0,
        }
    }
}

/// Tool-call quota enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolGateSection {
    pub call_limit: u64,
}

impl Default for ToolGateSection {
    fn default() -> Self {
        Self { call_limit: 25 }
    }
}

/// The full tree: one struct per section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigTree {
    pub mesh: MeshSection,
    pub auto_tuner: TunerSection,
    pub config_sync: SyncSection,
    pub tool_gate: ToolGateSection,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Shared, mutable configuration. Cheap to clone snapshots out of; all
/// mutation goes through [`ConfigRegistry::set`].
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    tree: RwLock<ConfigTree>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(tree: ConfigTree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    pub fn snapshot(&self) -> ConfigTree {
        self.tree.read().expect("config lock poisoned").clone()
    }

    pub fn mesh(&self) -> MeshSection {
        self.snapshot().mesh
    }

    pub fn tuner(&self) -> TunerSection {
        self.snapshot().auto_tuner
    }

    pub fn sync(&self) -> SyncSection {
        self.snapshot().config_sync
    }

    pub fn tool_gate(&self) -> ToolGateSection {
        self.snapshot().tool_gate
    }

    /// Read one parameter as JSON.
    pub fn get(&self, section: &str, parameter: &str) -> Result<Value, ConfigError> {
        let tree = self.tree.read().expect("config lock poisoned");
        let map = section_map(&tree, section)?;
        map.get(parameter)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownParameter {
                section: section.to_string(),
                parameter: parameter.to_string(),
            })
    }

    /// Write one parameter from JSON, returning the previous value.
    ///
    /// Unknown keys and type mismatches are rejected; the tree is left
    /// untouched on error.
    pub fn set(&self, section: &str, parameter: &str, value: Value) -> Result<Value, ConfigError> {
        let mut tree = self.tree.write().expect("config lock poisoned");
        let mut map = section_map(&tree, section)?;
        let old = map
            .get(parameter)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownParameter {
                section: section.to_string(),
                parameter: parameter.to_string(),
            })?;
        map.insert(parameter.to_string(), value);

        let updated = apply_section(&tree, section, map).map_err(|reason| {
            ConfigError::InvalidValue {
                section: section.to_string(),
                parameter: parameter.to_string(),
                reason,
            }
        })?;
        *tree = updated;
        Ok(old)
    }
}

fn section_map(
    tree: &ConfigTree,
    section: &str,
) -> Result<serde_json::Map<String, Value>, ConfigError> {
    let value = match section {
        "mesh" => serde_json::to_value(&tree.mesh),
        "auto_tuner" => serde_json::to_value(&tree.auto_tuner),
        "config_sync" => serde_json::to_value(&tree.config_sync),
        "tool_gate" => serde_json::to_value(&tree.tool_gate),
        other => return Err(ConfigError::UnknownSection(other.to_string())),
    }
    .expect("config sections serialize to objects");
    match value {
        Value::Object(map) => Ok(map),
        _ => unreachable!("config sections serialize to objects"),
    }
}

fn apply_section(
    tree: &ConfigTree,
    section: &str,
    map: serde_json::Map<String, Value>,
) -> Result<ConfigTree, String> {
    let mut updated = tree.clone();
    let value = Value::Object(map);
    match section {
        "mesh" => updated.mesh = serde_json::from_value(value).map_err(|e| e.to_string())?,
        "auto_tuner" => {
            updated.auto_tuner = serde_json::from_value(value).map_err(|e| e.to_string())?;
        }
        "config_sync" => {
            updated.config_sync = serde_json::from_value(value).map_err(|e| e.to_string())?;
        }
        "tool_gate" => {
            updated.tool_gate = serde_json::from_value(value).map_err(|e| e.to_string())?;
        }
        other => return Err(format!("unknown section {other}")),
    }
    Ok(updated)
}

// ─── Process-wide default ─────────────────────────────────────────────────────
//
// Production convenience only. Tests construct their own registries.

static DEFAULT: Lazy<Mutex<Option<Arc<ConfigRegistry>>>> = Lazy::new(|| Mutex::new(None));

/// Install (or return the existing) process-wide registry.
pub fn init_default_registry() -> Arc<ConfigRegistry> {
    let mut slot = DEFAULT.lock().expect("default registry lock poisoned");
    slot.get_or_insert_with(|| Arc::new(ConfigRegistry::new()))
        .clone()
}

/// The process-wide registry, if `init_default_registry` has run.
pub fn default_registry() -> Option<Arc<ConfigRegistry>> {
    DEFAULT
        .lock()
        .expect("default registry lock poisoned")
        .clone()
}

/// Drop the process-wide registry. Outstanding `Arc`s stay valid.
pub fn shutdown_default_registry() {
    DEFAULT
        .lock()
        .expect("default registry lock poisoned")
        .take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_and_set_roundtrip() {
        let registry = ConfigRegistry::new();
        assert_eq!(registry.get("mesh", "batch_size_limit").unwrap(), json!(10));

        let old = registry
            .set("mesh", "batch_size_limit", json!(32))
            .unwrap();
        assert_eq!(old, json!(10));
        assert_eq!(registry.mesh().batch_size_limit, 32);
    }

    #[test]
    fn unknown_keys_are_rejected_without_mutation() {
        let registry = ConfigRegistry::new();
        assert!(matches!(
            registry.set("mesh", "no_such_knob", json!(1)),
            Err(ConfigError::UnknownParameter { .. })
        ));
        assert!(matches!(
            registry.get("warp", "anything"),
            Err(ConfigError::UnknownSection(_))
        ));
    }

    #[test]
    fn type_mismatch_leaves_tree_untouched() {
        let registry = ConfigRegistry::new();
        let err = registry
            .set("mesh", "token_rate", json!("fast"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(registry.mesh().token_rate, 10.0);
    }

    #[test]
    fn default_registry_init_and_shutdown() {
        shutdown_default_registry();
        assert!(default_registry().is_none());
        let a = init_default_registry();
        let b = init_default_registry();
        assert!(Arc::ptr_eq(&a, &b));
        shutdown_default_registry();
        assert!(default_registry().is_none());
    }
}
