//! Tracing subscriber initialization
//!
//! Library crates only emit `tracing` events. The binary calls
//! `init_telemetry` once at startup to decide where they go.

use cadence_core::{CadenceError, CadenceResult, ConfigError};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `CADENCE_LOG_FILTER` is not set.
pub const DEFAULT_LOG_FILTER: &str = "cadence=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}

impl FromStr for LogFormat {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" | "human" => Ok(LogFormat::Pretty),
            other => Err(CadenceError::Config(ConfigError::InvalidValue {
                field: "CADENCE_LOG_FORMAT".into(),
                value: other.into(),
                reason: "expected json or pretty".into(),
            })),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `cadence=debug,cadence_supervisor=trace`
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `CADENCE_LOG_FORMAT` and `CADENCE_LOG_FILTER`.
    pub fn from_env() -> CadenceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> CadenceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup("CADENCE_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };
        let filter = lookup("CADENCE_LOG_FILTER")
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        Ok(Self { format, filter })
    }

    fn env_filter(&self) -> CadenceResult<EnvFilter> {
        EnvFilter::try_new(&self.filter).map_err(|e| {
            CadenceError::Config(ConfigError::InvalidValue {
                field: "CADENCE_LOG_FILTER".into(),
                value: self.filter.clone(),
                reason: e.to_string(),
            })
        })
    }
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_telemetry(config: &TelemetryConfig) -> CadenceResult<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| {
        CadenceError::Config(ConfigError::InvalidValue {
            field: "telemetry".into(),
            value: format!("{:?}", config.format),
            reason: format!("failed to install subscriber: {e}"),
        })
    })?;

    tracing::info!(format = ?config.format, filter = %config.filter, "telemetry initialized");
    Ok(())
}
