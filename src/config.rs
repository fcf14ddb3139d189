//! Hierarchical orchestrator configuration.
//!
//! Configuration resolves through three layers: global defaults, a
//! per-principal overlay, and a per-workflow overlay, merged in that order
//! as JSON trees before deserializing into the typed
//! [`OrchestratorConfig`]. The recognized option surface:
//!
//! | Key | Effect |
//! |---|---|
//! | `agent.timeout_default_ms` | default per-step timeout |
//! | `agent.timeout_overrides.<role>` | per-role override (ms) |
//! | `agent.retry.{max_attempts, base_delay, cap, jitter}` | backoff tuning |
//! | `agent.circuit.{failure_threshold, cooldown}` | breaker tuning |
//! | `session.{expire_after_ms, input_timeout_ms}` | TTL and suspension wait |
//! | `engine.{max_concurrent_sessions, max_concurrent_per_role, max_parallel_steps, auto_fix_attempts}` | scheduling caps |
//! | `events.{retention_size, retention_time_ms, subscriber_buffer}` | event log bounds |
//! | `provenance.{degraded_after_failures, fail_workflow_when_degraded, retry_attempts}` | degraded-mode policy |
//! | `validation.{weights.*, vote}` | score weights, severity voting |
//! | `detection.{ambiguity_threshold, interfaces}` | disambiguation + catalog |
//!
//! [`ConfigHandle`] is the hot-reload entry point: `reload` swaps the layer
//! set atomically, mints a fresh snapshot id, and leaves the caller (the
//! engine) to emit `ConfigChanged`. Storage port bindings are deliberately
//! not part of this surface; they are fixed at construction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::{duration_ms, CircuitConfig, RetryPolicy};
use crate::types::{AgentRole, Principal};
use crate::validation::{ValidationWeights, VoteStrategy};

/// Agent dispatch tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(with = "duration_ms")]
    pub timeout_default_ms: Duration,
    /// Per-role timeout overrides, keyed by encoded role tag.
    pub timeout_overrides: FxHashMap<String, u64>,
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_default_ms: Duration::from_secs(60),
            timeout_overrides: FxHashMap::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Effective timeout for a role.
    #[must_use]
    pub fn timeout_for(&self, role: AgentRole) -> Duration {
        self.timeout_overrides
            .get(role.encode())
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(self.timeout_default_ms)
    }
}

/// Session lifecycle tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TTL from last update before the expiry sweep may purge a session.
    #[serde(with = "duration_ms")]
    pub expire_after_ms: Duration,
    /// Maximum time a suspended session waits for user input.
    #[serde(with = "duration_ms")]
    pub input_timeout_ms: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_after_ms: Duration::from_secs(24 * 3600),
            input_timeout_ms: Duration::from_secs(3600),
        }
    }
}

/// Scheduler caps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_sessions: usize,
    pub max_concurrent_per_role: usize,
    /// Upper bound on ready steps dispatched in one scheduling round.
    pub max_parallel_steps: usize,
    /// Validation-fail recovery loops before a Fail verdict is final.
    pub auto_fix_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 32,
            max_concurrent_per_role: 8,
            max_parallel_steps: 4,
            auto_fix_attempts: 1,
        }
    }
}

/// Event log bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Maximum retained events per session (terminal events pinned).
    pub retention_size: usize,
    #[serde(with = "duration_ms")]
    pub retention_time_ms: Duration,
    /// Bounded buffer per subscriber.
    pub subscriber_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention_size: 1024,
            retention_time_ms: Duration::from_secs(24 * 3600),
            subscriber_buffer: 256,
        }
    }
}

/// Provenance degraded-mode policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceConfig {
    /// Consecutive append failures tolerated before the policy engages.
    pub degraded_after_failures: u32,
    /// When true, a degraded provenance log fails the workflow; otherwise
    /// recording continues best-effort.
    pub fail_workflow_when_degraded: bool,
    /// Bounded retries per append.
    pub retry_attempts: u32,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            degraded_after_failures: 5,
            fail_workflow_when_degraded: false,
            retry_attempts: 2,
        }
    }
}

/// Validation aggregation tuning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub weights: ValidationWeights,
    pub vote: VoteStrategy,
}

/// Format detection tuning plus the static interface catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Confidence delta at or under which detection is ambiguous.
    pub ambiguity_threshold: f64,
    /// Format tag -> conversion interface identifier.
    pub interfaces: FxHashMap<String, String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let mut interfaces = FxHashMap::default();
        interfaces.insert("SpikeGLX".to_string(), "spikeglx-recording".to_string());
        interfaces.insert("OpenEphys".to_string(), "openephys-recording".to_string());
        interfaces.insert("Blackrock".to_string(), "blackrock-recording".to_string());
        interfaces.insert("Intan".to_string(), "intan-recording".to_string());
        Self {
            ambiguity_threshold: 0.05,
            interfaces,
        }
    }
}

/// The fully resolved configuration snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub engine: EngineConfig,
    pub events: EventsConfig,
    pub provenance: ProvenanceConfig,
    pub validation: ValidationConfig,
    pub detection: DetectionConfig,
}

impl OrchestratorConfig {
    /// Load defaults with environment overrides.
    ///
    /// `.env` is honored via dotenvy, matching the deployment convention of
    /// the rest of the stack. Recognized variables:
    /// `NWBFLOW_AGENT_TIMEOUT_MS`, `NWBFLOW_MAX_CONCURRENT_SESSIONS`,
    /// `NWBFLOW_SUBSCRIBER_BUFFER`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(ms) = env_u64("NWBFLOW_AGENT_TIMEOUT_MS") {
            config.agent.timeout_default_ms = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("NWBFLOW_MAX_CONCURRENT_SESSIONS") {
            config.engine.max_concurrent_sessions = n as usize;
        }
        if let Some(n) = env_u64("NWBFLOW_SUBSCRIBER_BUFFER") {
            config.events.subscriber_buffer = n as usize;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Raw JSON overlay layers, merged global -> principal -> workflow.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayers {
    pub global: Value,
    pub per_principal: FxHashMap<String, Value>,
    pub per_workflow: FxHashMap<String, Value>,
}

impl ConfigLayers {
    /// Start from a typed base configuration.
    #[must_use]
    pub fn from_base(base: &OrchestratorConfig) -> Self {
        Self {
            global: serde_json::to_value(base).unwrap_or(Value::Null),
            per_principal: FxHashMap::default(),
            per_workflow: FxHashMap::default(),
        }
    }

    /// Resolve the effective configuration for one (principal, workflow)
    /// pair. Unknown keys in overlays are ignored by deserialization;
    /// malformed overlays fall back to the narrower valid merge.
    #[must_use]
    pub fn resolve(&self, principal: Option<&Principal>, workflow: Option<&str>) -> OrchestratorConfig {
        let mut merged = self.global.clone();
        if let Some(p) = principal {
            if let Some(overlay) = self.per_principal.get(p.as_str()) {
                deep_merge(&mut merged, overlay);
            }
        }
        if let Some(w) = workflow {
            if let Some(overlay) = self.per_workflow.get(w) {
                deep_merge(&mut merged, overlay);
            }
        }
        serde_json::from_value(merged).unwrap_or_default()
    }
}

/// Recursive JSON merge: objects merge key-wise, everything else replaces.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

struct ConfigState {
    layers: ConfigLayers,
    resolved_global: Arc<OrchestratorConfig>,
    snapshot_id: String,
}

/// Shared, hot-reloadable view of the configuration.
///
/// Cloning is cheap; every component holds a handle and reads the current
/// snapshot at use time. Reloads swap the layer set atomically and mint a
/// fresh snapshot id that subsequently created sessions record.
#[derive(Clone)]
pub struct ConfigHandle {
    state: Arc<RwLock<ConfigState>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        let layers = ConfigLayers::from_base(&config);
        Self {
            state: Arc::new(RwLock::new(ConfigState {
                layers,
                resolved_global: Arc::new(config),
                snapshot_id: new_snapshot_id(),
            })),
        }
    }

    /// The globally resolved snapshot (no principal/workflow overlays).
    #[must_use]
    pub fn current(&self) -> Arc<OrchestratorConfig> {
        self.state.read().resolved_global.clone()
    }

    /// Resolve with overlays for a specific session context.
    #[must_use]
    pub fn resolve(&self, principal: Option<&Principal>, workflow: Option<&str>) -> OrchestratorConfig {
        self.state.read().layers.resolve(principal, workflow)
    }

    /// Identifier of the active configuration snapshot.
    #[must_use]
    pub fn snapshot_id(&self) -> String {
        self.state.read().snapshot_id.clone()
    }

    /// Swap in a new layer set; returns the fresh snapshot id.
    ///
    /// The caller is responsible for emitting `ConfigChanged` so observers
    /// learn about the swap.
    pub fn reload(&self, layers: ConfigLayers) -> String {
        let resolved = layers.resolve(None, None);
        let snapshot_id = new_snapshot_id();
        let mut state = self.state.write();
        state.layers = layers;
        state.resolved_global = Arc::new(resolved);
        state.snapshot_id = snapshot_id.clone();
        snapshot_id
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

fn new_snapshot_id() -> String {
    format!("cfg-{}", uuid::Uuid::new_v4().simple())
}
