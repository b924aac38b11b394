//! Error types for Cadence operations

use crate::enums::{EntityType, EnumParseError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures of an underlying collaborator. The only retryable class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SystemError {
    #[error("Storage operation {operation} failed: {reason}")]
    Storage { operation: String, reason: String },

    #[error("Lock poisoned in {component}")]
    LockPoisoned { component: String },

    #[error("Failed to spawn worker {program}: {reason}")]
    ProcessSpawn { program: String, reason: String },

    #[error("Worker I/O failed for {agent_id}: {reason}")]
    ProcessIo { agent_id: String, reason: String },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Circuit {name} is open")]
    CircuitOpen { name: String },

    #[error("Resource exhausted: {resource} - {reason}")]
    ResourceExhausted { resource: String, reason: String },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Background task failed: {reason}")]
    TaskJoin { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Fieldless error discriminant, carried by result values that must stay
/// serializable (task outcomes, health reports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    CircularDependency,
    ConflictDetected,
    NotFound,
    System,
    Config,
}

/// Master error type for all Cadence errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CadenceError {
    #[error("Invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<String> },

    #[error("Resource conflict on {resources:?}")]
    ConflictDetected { resources: Vec<String> },

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: String },

    #[error("System error: {0}")]
    System(#[from] SystemError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}

impl CadenceError {
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CadenceError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity_type: EntityType, id: impl ToString) -> Self {
        CadenceError::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }

    pub fn lock_poisoned(component: impl Into<String>) -> Self {
        CadenceError::System(SystemError::LockPoisoned {
            component: component.into(),
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::InvalidInput { .. } => ErrorKind::InvalidInput,
            CadenceError::CircularDependency { .. } => ErrorKind::CircularDependency,
            CadenceError::ConflictDetected { .. } => ErrorKind::ConflictDetected,
            CadenceError::NotFound { .. } => ErrorKind::NotFound,
            CadenceError::System(_) => ErrorKind::System,
            CadenceError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only collaborator failures are eligible for automatic retry.
    /// Conflicts are left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CadenceError::System(_))
    }
}

impl From<EnumParseError> for CadenceError {
    fn from(err: EnumParseError) -> Self {
        CadenceError::InvalidInput {
            field: err.kind.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for Cadence operations.
pub type CadenceResult<T> = Result<T, CadenceError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_dependency_display() {
        let err = CadenceError::CircularDependency {
            cycle: vec!["T2".into(), "T3".into(), "T1".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency detected: T2 -> T3 -> T1"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = CadenceError::not_found(EntityType::Task, "T9");
        assert_eq!(err.to_string(), "Task not found: T9");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_only_system_errors_are_retryable() {
        let system = CadenceError::from(SystemError::Timeout {
            operation: "restart".into(),
            after: Duration::from_secs(1),
        });
        assert!(system.is_retryable());
        assert!(!CadenceError::invalid_input("progress", "out of range").is_retryable());
        assert!(!CadenceError::ConflictDetected {
            resources: vec!["db".into()]
        }
        .is_retryable());
        assert!(!CadenceError::CircularDependency { cycle: vec![] }.is_retryable());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "quality_high_threshold".into(),
            value: "120".into(),
            reason: "must be within [0, 100]".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("quality_high_threshold"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn test_enum_parse_error_maps_to_invalid_input() {
        let err: CadenceError = "nope".parse::<crate::TaskStatus>().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
