//! Per-operation resource limits, retry policy, and scheduling preferences.

use serde::{Deserialize, Serialize};

/// Resource ceilings enforced by the Resource Gate for the lifetime of an
/// operation. All dimensions must be positive; the Validator rejects zero
/// or negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_millis: u64,
    pub max_duration_secs: u64,
    pub max_concurrency: u32,
}

impl ResourceLimits {
    /// `true` iff every dimension is strictly positive, per the Validator's
    /// "non-positive resource limit" rejection rule.
    pub fn is_positive(&self) -> bool {
        self.max_memory_mb > 0 && self.max_cpu_millis > 0 && self.max_duration_secs > 0 && self.max_concurrency > 0
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Custom,
}

/// Retry configuration for a single step (or the engine-wide default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 0..=10. Zero means the step is attempted exactly once, never retried.
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Error kinds (matched against the executor's error string) eligible
    /// for retry. An error not in this list is always fatal regardless of
    /// `max_attempts`.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl RetryPolicy {
    /// A policy with no retries: the step either succeeds on the first
    /// attempt or fails fatally.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_strategy: BackoffStrategy::Linear,
            base_delay_ms: 0,
            max_delay_ms: 0,
            retryable_errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.max_attempts <= 10 && self.max_delay_ms >= self.base_delay_ms
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Scheduling priority. The Resource Gate's admission ordering is a
/// function of this field (see `operon-core::resource_gate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
    Streaming,
}

/// The execution envelope for an [`Operation`](crate::operation::Operation):
/// resource limits, the operation-wide timeout, the default retry policy
/// applied to steps that omit one, priority, and execution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub resource_limits: ResourceLimits,
    /// Positive, bounded by `EngineConfig::operation_timeout_max`.
    pub timeout_secs: u64,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Asynchronous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_limits_positive_check() {
        let ok = ResourceLimits { max_memory_mb: 512, max_cpu_millis: 1000, max_duration_secs: 60, max_concurrency: 4 };
        assert!(ok.is_positive());

        let bad = ResourceLimits { max_memory_mb: 0, ..ok };
        assert!(!bad.is_positive());
    }

    #[test]
    fn retry_policy_none_never_retries() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 0);
        assert!(policy.is_valid());
    }

    #[test]
    fn retry_policy_rejects_max_delay_below_base() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Linear,
            base_delay_ms: 100,
            max_delay_ms: 50,
            retryable_errors: vec![],
        };
        assert!(!policy.is_valid());
    }

    #[test]
    fn execution_context_serde_roundtrip() {
        let ctx = ExecutionContext {
            resource_limits: ResourceLimits { max_memory_mb: 256, max_cpu_millis: 500, max_duration_secs: 30, max_concurrency: 2 },
            timeout_secs: 300,
            retry_policy: RetryPolicy::none(),
            priority: Priority::High,
            execution_mode: ExecutionMode::Synchronous,
        };
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.priority, Priority::High);
        assert_eq!(parsed.timeout_secs, 300);
    }
}
