//! Configuration types
//!
//! One `CadenceConfig` value is built at startup and handed to every
//! component constructor. Durations are written in milliseconds, both in
//! TOML (`*_ms` keys) and in `CADENCE_*` environment variables.

use crate::constants::*;
use crate::{duration_ms, CadenceError, CadenceResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Hard timeout applied to every protected call
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    /// Time spent Open before a probe is let through
    #[serde(rename = "recovery_timeout_ms", with = "duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            call_timeout: Duration::from_millis(DEFAULT_CIRCUIT_CALL_TIMEOUT_MS),
            recovery_timeout: Duration::from_millis(DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_MS),
        }
    }
}

/// Concurrency and memory caps for the resource guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceGuardConfig {
    pub max_concurrent_operations: usize,
    pub memory_ceiling_bytes: u64,
    #[serde(rename = "memory_check_interval_ms", with = "duration_ms")]
    pub memory_check_interval: Duration,
}

impl Default for ResourceGuardConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            memory_check_interval: Duration::from_millis(DEFAULT_MEMORY_CHECK_INTERVAL_MS),
        }
    }
}

/// Exponential backoff for retryable operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CadenceConfig {
    // Agents and tasks
    pub max_concurrent_agents: usize,
    #[serde(rename = "task_timeout_ms", with = "duration_ms")]
    pub task_timeout: Duration,
    #[serde(rename = "stale_agent_threshold_ms", with = "duration_ms")]
    pub stale_agent_threshold: Duration,
    pub max_retry_attempts: u32,
    pub progress_history_limit: usize,
    pub trend_window: usize,

    // Workflow
    pub quality_high_threshold: f64,
    pub quality_low_threshold: f64,
    pub sprint_duration_units: u64,
    #[serde(rename = "virtual_time_unit_ms", with = "duration_ms")]
    pub virtual_time_unit: Duration,
    pub max_sprint_iterations: u32,

    // Process supervision
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub max_restart_attempts: u32,
    #[serde(rename = "restart_cooldown_ms", with = "duration_ms")]
    pub restart_cooldown: Duration,

    pub circuit_breaker: CircuitBreakerConfig,
    pub resource_guard: ResourceGuardConfig,
    pub retry: RetryConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            task_timeout: Duration::from_millis(DEFAULT_TASK_TIMEOUT_MS),
            stale_agent_threshold: Duration::from_millis(DEFAULT_STALE_AGENT_THRESHOLD_MS),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            progress_history_limit: DEFAULT_PROGRESS_HISTORY_LIMIT,
            trend_window: DEFAULT_TREND_WINDOW,
            quality_high_threshold: DEFAULT_QUALITY_HIGH_THRESHOLD,
            quality_low_threshold: DEFAULT_QUALITY_LOW_THRESHOLD,
            sprint_duration_units: DEFAULT_SPRINT_DURATION_UNITS,
            virtual_time_unit: Duration::from_millis(DEFAULT_VIRTUAL_TIME_UNIT_MS),
            max_sprint_iterations: DEFAULT_MAX_SPRINT_ITERATIONS,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_cooldown: Duration::from_millis(DEFAULT_RESTART_COOLDOWN_MS),
            circuit_breaker: CircuitBreakerConfig::default(),
            resource_guard: ResourceGuardConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> CadenceError {
    CadenceError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn require_positive_duration(field: &str, value: Duration) -> CadenceResult<()> {
    if value.is_zero() {
        return Err(invalid(field, format!("{value:?}"), "must be positive"));
    }
    Ok(())
}

fn require_positive_count(field: &str, value: u64) -> CadenceResult<()> {
    if value == 0 {
        return Err(invalid(field, value, "must be greater than 0"));
    }
    Ok(())
}

fn require_score(field: &str, value: f64) -> CadenceResult<()> {
    if !(0.0..=100.0).contains(&value) {
        return Err(invalid(field, value, "must be within [0, 100]"));
    }
    Ok(())
}

impl CadenceConfig {
    /// Wall-clock length of one sprint.
    pub fn sprint_duration(&self) -> Duration {
        self.virtual_time_unit
            .saturating_mul(self.sprint_duration_units.min(u32::MAX as u64) as u32)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every count and duration is positive
    /// - quality thresholds are within [0, 100] and low <= high
    /// - retry backoff multiplier is at least 1.0
    pub fn validate(&self) -> CadenceResult<()> {
        require_positive_count("max_concurrent_agents", self.max_concurrent_agents as u64)?;
        require_positive_duration("task_timeout", self.task_timeout)?;
        require_positive_duration("stale_agent_threshold", self.stale_agent_threshold)?;
        require_positive_count("max_retry_attempts", self.max_retry_attempts as u64)?;
        require_positive_count("progress_history_limit", self.progress_history_limit as u64)?;
        require_positive_count("trend_window", self.trend_window as u64)?;

        require_score("quality_high_threshold", self.quality_high_threshold)?;
        require_score("quality_low_threshold", self.quality_low_threshold)?;
        if self.quality_low_threshold > self.quality_high_threshold {
            return Err(invalid(
                "quality_low_threshold",
                self.quality_low_threshold,
                "must not exceed quality_high_threshold",
            ));
        }
        require_positive_count("sprint_duration_units", self.sprint_duration_units)?;
        require_positive_duration("virtual_time_unit", self.virtual_time_unit)?;
        require_positive_count("max_sprint_iterations", self.max_sprint_iterations as u64)?;

        require_positive_duration("heartbeat_interval", self.heartbeat_interval)?;
        require_positive_count("max_restart_attempts", self.max_restart_attempts as u64)?;

        let cb = &self.circuit_breaker;
        require_positive_count("circuit_breaker.failure_threshold", cb.failure_threshold as u64)?;
        require_positive_count("circuit_breaker.success_threshold", cb.success_threshold as u64)?;
        require_positive_duration("circuit_breaker.call_timeout", cb.call_timeout)?;
        require_positive_duration("circuit_breaker.recovery_timeout", cb.recovery_timeout)?;

        let guard = &self.resource_guard;
        require_positive_count(
            "resource_guard.max_concurrent_operations",
            guard.max_concurrent_operations as u64,
        )?;
        require_positive_count("resource_guard.memory_ceiling_bytes", guard.memory_ceiling_bytes)?;
        require_positive_duration(
            "resource_guard.memory_check_interval",
            guard.memory_check_interval,
        )?;

        let retry = &self.retry;
        require_positive_duration("retry.initial_backoff", retry.initial_backoff)?;
        if retry.max_backoff < retry.initial_backoff {
            return Err(invalid(
                "retry.max_backoff",
                format!("{:?}", retry.max_backoff),
                "must not be shorter than retry.initial_backoff",
            ));
        }
        if retry.backoff_multiplier.is_nan() || retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                retry.backoff_multiplier,
                "must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> CadenceResult<Self> {
        let config: CadenceConfig = toml::from_str(contents).map_err(|e| {
            CadenceError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: &Path) -> CadenceResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::Config(ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load from `CADENCE_*` environment variables over the defaults.
    pub fn from_env() -> CadenceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> CadenceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };
        let defaults = CadenceConfig::default();
        let config = CadenceConfig {
            max_concurrent_agents: env.parse(
                "CADENCE_MAX_CONCURRENT_AGENTS",
                defaults.max_concurrent_agents,
            )?,
            task_timeout: env.millis("CADENCE_TASK_TIMEOUT_MS", defaults.task_timeout)?,
            stale_agent_threshold: env.millis(
                "CADENCE_STALE_AGENT_THRESHOLD_MS",
                defaults.stale_agent_threshold,
            )?,
            max_retry_attempts: env
                .parse("CADENCE_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
            progress_history_limit: env.parse(
                "CADENCE_PROGRESS_HISTORY_LIMIT",
                defaults.progress_history_limit,
            )?,
            trend_window: env.parse("CADENCE_TREND_WINDOW", defaults.trend_window)?,
            quality_high_threshold: env.parse(
                "CADENCE_QUALITY_HIGH_THRESHOLD",
                defaults.quality_high_threshold,
            )?,
            quality_low_threshold: env.parse(
                "CADENCE_QUALITY_LOW_THRESHOLD",
                defaults.quality_low_threshold,
            )?,
            sprint_duration_units: env.parse(
                "CADENCE_SPRINT_DURATION_UNITS",
                defaults.sprint_duration_units,
            )?,
            virtual_time_unit: env
                .millis("CADENCE_VIRTUAL_TIME_UNIT_MS", defaults.virtual_time_unit)?,
            max_sprint_iterations: env.parse(
                "CADENCE_MAX_SPRINT_ITERATIONS",
                defaults.max_sprint_iterations,
            )?,
            heartbeat_interval: env
                .millis("CADENCE_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            max_restart_attempts: env.parse(
                "CADENCE_MAX_RESTART_ATTEMPTS",
                defaults.max_restart_attempts,
            )?,
            restart_cooldown: env
                .millis("CADENCE_RESTART_COOLDOWN_MS", defaults.restart_cooldown)?,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env.parse(
                    "CADENCE_CIRCUIT_FAILURE_THRESHOLD",
                    defaults.circuit_breaker.failure_threshold,
                )?,
                success_threshold: env.parse(
                    "CADENCE_CIRCUIT_SUCCESS_THRESHOLD",
                    defaults.circuit_breaker.success_threshold,
                )?,
                call_timeout: env.millis(
                    "CADENCE_CIRCUIT_CALL_TIMEOUT_MS",
                    defaults.circuit_breaker.call_timeout,
                )?,
                recovery_timeout: env.millis(
                    "CADENCE_CIRCUIT_RECOVERY_TIMEOUT_MS",
                    defaults.circuit_breaker.recovery_timeout,
                )?,
            },
            resource_guard: ResourceGuardConfig {
                max_concurrent_operations: env.parse(
                    "CADENCE_MAX_CONCURRENT_OPERATIONS",
                    defaults.resource_guard.max_concurrent_operations,
                )?,
                memory_ceiling_bytes: env.parse(
                    "CADENCE_MEMORY_CEILING_BYTES",
                    defaults.resource_guard.memory_ceiling_bytes,
                )?,
                memory_check_interval: env.millis(
                    "CADENCE_MEMORY_CHECK_INTERVAL_MS",
                    defaults.resource_guard.memory_check_interval,
                )?,
            },
            retry: RetryConfig {
                max_retries: env.parse("CADENCE_RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
                initial_backoff: env.millis(
                    "CADENCE_RETRY_INITIAL_BACKOFF_MS",
                    defaults.retry.initial_backoff,
                )?,
                max_backoff: env
                    .millis("CADENCE_RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff)?,
                backoff_multiplier: env.parse(
                    "CADENCE_RETRY_BACKOFF_MULTIPLIER",
                    defaults.retry.backoff_multiplier,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &str, default: T) -> CadenceResult<T> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| invalid(key, &raw, "could not be parsed")),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> CadenceResult<Duration> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn expect_invalid_field(result: CadenceResult<()>, expected: &str) {
        match result {
            Err(CadenceError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, expected)
            }
            other => panic!("expected InvalidValue for {expected}, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(CadenceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_low_threshold_above_high_rejected() {
        let config = CadenceConfig {
            quality_high_threshold: 40.0,
            quality_low_threshold: 60.0,
            ..Default::default()
        };
        expect_invalid_field(config.validate(), "quality_low_threshold");
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let config = CadenceConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        expect_invalid_field(config.validate(), "heartbeat_interval");
    }

    #[test]
    fn test_nan_multiplier_rejected() {
        let mut config = CadenceConfig::default();
        config.retry.backoff_multiplier = f64::NAN;
        expect_invalid_field(config.validate(), "retry.backoff_multiplier");
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = CadenceConfig::from_toml_str(
            r#"
            max_concurrent_agents = 4
            stale_agent_threshold_ms = 1500

            [circuit_breaker]
            failure_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_agents, 4);
        assert_eq!(config.stale_agent_threshold, Duration::from_millis(1500));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(
            config.circuit_breaker.success_threshold,
            DEFAULT_CIRCUIT_SUCCESS_THRESHOLD
        );
    }

    #[test]
    fn test_from_toml_rejects_unknown_key() {
        let err = CadenceConfig::from_toml_str("max_agents = 4").unwrap_err();
        assert!(matches!(err, CadenceError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = CadenceConfig::from_path(Path::new("/nonexistent/cadence.toml")).unwrap_err();
        assert!(matches!(err, CadenceError::Config(ConfigError::Io { .. })));
    }

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CADENCE_MAX_RESTART_ATTEMPTS", "7"),
            ("CADENCE_RESTART_COOLDOWN_MS", "250"),
            ("CADENCE_QUALITY_HIGH_THRESHOLD", "90"),
        ]);
        let config = CadenceConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_restart_attempts, 7);
        assert_eq!(config.restart_cooldown, Duration::from_millis(250));
        assert_eq!(config.quality_high_threshold, 90.0);
        assert_eq!(config.max_concurrent_agents, DEFAULT_MAX_CONCURRENT_AGENTS);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CadenceConfig::from_lookup(|k| {
            (k == "CADENCE_TREND_WINDOW").then(|| "many".to_string())
        })
        .unwrap_err();
        match err {
            CadenceError::Config(ConfigError::InvalidValue { field, value, .. }) => {
                assert_eq!(field, "CADENCE_TREND_WINDOW");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_sprint_duration() {
        let config = CadenceConfig {
            sprint_duration_units: 10,
            virtual_time_unit: Duration::from_millis(5),
            ..Default::default()
        };
        assert_eq!(config.sprint_duration(), Duration::from_millis(50));
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
