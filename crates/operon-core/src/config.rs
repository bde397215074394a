//! Engine-wide configuration, deserializable from YAML via `serde_yaml_ng`.
//!
//! Every field has a spec-mandated default so an embedding application
//! can start from `EngineConfig::default()` and override only what it
//! cares about.

use std::time::Duration;

use operon_types::execution_context::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::resource_gate::GateCapacity;

fn default_operation_timeout_max_secs() -> u64 {
    1800
}

fn default_cleanup_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_stale_operation_threshold_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_max_concurrent_operations() -> u32 {
    100
}

fn default_engine_id() -> String {
    "operon-engine".to_string()
}

fn default_resource_pool() -> GateCapacity {
    GateCapacity { memory_mb: 16_384, cpu_millis: 16_000, duration_secs: 3_600, concurrency: 64 }
}

/// The configuration surface from §6: everything the Supervisor and
/// Orchestrator read to bound their own behavior, as opposed to
/// per-operation values that ride along on the `Operation` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound the Validator enforces on `executionContext.timeoutSecs`.
    #[serde(default = "default_operation_timeout_max_secs")]
    pub operation_timeout_max_secs: u64,
    /// How often the Supervisor's sweep task runs.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// How long a non-terminal operation may go without a state update
    /// before the sweep considers it stale.
    #[serde(default = "default_stale_operation_threshold_ms")]
    pub stale_operation_threshold_ms: u64,
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: u32,
    /// Force a `RecoveryPoint` checkpoint every N steps regardless of
    /// plan-declared checkpoints. `None` disables the periodic cadence.
    #[serde(default)]
    pub checkpoint_every_n_steps: Option<u32>,
    /// Applied to any step whose `retryPolicy` is omitted.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    /// This engine instance's identity, used for lease ownership during
    /// startup recovery.
    #[serde(default = "default_engine_id")]
    pub engine_id: String,
    /// The Resource Gate's total budget, shared across every active
    /// operation in this process.
    #[serde(default = "default_resource_pool")]
    pub resource_pool: GateCapacity,
}

impl EngineConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn stale_operation_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_operation_threshold_ms as i64)
    }

    pub fn from_yaml(input: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(input)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout_max_secs: default_operation_timeout_max_secs(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            stale_operation_threshold_ms: default_stale_operation_threshold_ms(),
            max_concurrent_operations: default_max_concurrent_operations(),
            checkpoint_every_n_steps: None,
            default_retry_policy: RetryPolicy::none(),
            engine_id: default_engine_id(),
            resource_pool: default_resource_pool(),
        }
    }
}
