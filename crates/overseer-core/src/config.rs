use crate::{SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Retry behaviour for task dispatch.
///
/// Attempts beyond the first back off exponentially (base 2) from
/// `backoff_base_ms`, capped at `backoff_max_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of dispatch attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds for the given zero-based attempt index.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Per-agent circuit-breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cool-down in milliseconds before an open circuit allows a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

/// Background scheduling and health-sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval in milliseconds between health sweeps.
    #[serde(default = "default_health_sweep_interval_ms")]
    pub health_sweep_interval_ms: u64,
    /// An active agent with no activity for this long is demoted to idle.
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_sweep_interval_ms: default_health_sweep_interval_ms(),
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
        }
    }
}

fn default_health_sweep_interval_ms() -> u64 {
    10_000
}

fn default_inactivity_threshold_ms() -> u64 {
    300_000
}

/// Top-level supervisor configuration.
///
/// Every field has a conservative default so an empty TOML document is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Dispatch retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Circuit-breaker settings applied to every agent.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Scheduler and health-monitor settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Default per-task timeout in milliseconds, unless the task overrides it.
    #[serde(default)]
    pub default_task_timeout_ms: Option<u64>,
    /// Default per-workflow timeout in milliseconds.
    #[serde(default)]
    pub default_workflow_timeout_ms: Option<u64>,
    /// Event bus buffer capacity per subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            default_task_timeout_ms: None,
            default_workflow_timeout_ms: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl SupervisorConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml(input: &str) -> SupervisorResult<Self> {
        toml::from_str(input).map_err(|e| SupervisorError::Config(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> SupervisorResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SupervisorConfig::from_toml("").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.scheduler.health_sweep_interval_ms, 10_000);
        assert_eq!(config.event_capacity, 256);
        assert!(config.default_task_timeout_ms.is_none());
    }

    #[test]
    fn partial_toml_overrides() {
        let config = SupervisorConfig::from_toml(
            r#"
            default_task_timeout_ms = 2000

            [retry]
            max_attempts = 5

            [breaker]
            failure_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_base_ms, 500);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.default_task_timeout_ms, Some(2000));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let result = SupervisorConfig::from_toml("retry = \"nope\"");
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 500); // 500 * 2^0
        assert_eq!(policy.backoff_ms(1), 1000); // 500 * 2^1
        assert_eq!(policy.backoff_ms(2), 2000); // 500 * 2^2
        assert_eq!(policy.backoff_ms(10), 30_000); // capped at max
    }
}
