//! Enum types for Cadence entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its database string representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

/// Display and FromStr both route through `as_db_str`/`from_db_str`.
macro_rules! db_str_conversions {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// TASK ENUMS
// ============================================================================

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "inprogress" | "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            _ => Err(EnumParseError::new("task status", s)),
        }
    }

    /// Completed, Failed and Cancelled tasks never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Allowed moves: Pending -> InProgress -> {Completed, Failed}, and
    /// any status -> Cancelled.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (_, TaskStatus::Cancelled)
        )
    }
}

db_str_conversions!(TaskStatus);

/// Scheduling priority. Ordering is `High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "Low",
            TaskPriority::Medium => "Medium",
            TaskPriority::High => "High",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            _ => Err(EnumParseError::new("task priority", s)),
        }
    }
}

db_str_conversions!(TaskPriority);

/// Kind of a depends-on edge. Only hard edges gate executability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DependencyKind {
    #[default]
    Hard,
    Soft,
}

impl DependencyKind {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DependencyKind::Hard => "Hard",
            DependencyKind::Soft => "Soft",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "hard" => Ok(DependencyKind::Hard),
            "soft" => Ok(DependencyKind::Soft),
            _ => Err(EnumParseError::new("dependency kind", s)),
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, DependencyKind::Hard)
    }
}

db_str_conversions!(DependencyKind);

// ============================================================================
// AGENT ENUMS
// ============================================================================

/// Status of an agent as reported by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Error,
    Completed,
}

impl AgentStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "Idle",
            AgentStatus::Working => "Working",
            AgentStatus::Blocked => "Blocked",
            AgentStatus::Error => "Error",
            AgentStatus::Completed => "Completed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "blocked" => Ok(AgentStatus::Blocked),
            "error" => Ok(AgentStatus::Error),
            "completed" => Ok(AgentStatus::Completed),
            _ => Err(EnumParseError::new("agent status", s)),
        }
    }

    /// Check if the agent can accept new work.
    pub fn can_accept_work(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Working)
    }
}

db_str_conversions!(AgentStatus);

/// Lifecycle state of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running,
    Unhealthy,
    Crashed,
    Stopped,
}

impl WorkerState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Unhealthy => "Unhealthy",
            WorkerState::Crashed => "Crashed",
            WorkerState::Stopped => "Stopped",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(WorkerState::Starting),
            "running" => Ok(WorkerState::Running),
            "unhealthy" => Ok(WorkerState::Unhealthy),
            "crashed" => Ok(WorkerState::Crashed),
            "stopped" => Ok(WorkerState::Stopped),
            _ => Err(EnumParseError::new("worker state", s)),
        }
    }

    /// Unhealthy and Crashed workers go back to Starting on restart.
    pub fn needs_restart(&self) -> bool {
        matches!(self, WorkerState::Unhealthy | WorkerState::Crashed)
    }
}

db_str_conversions!(WorkerState);

// ============================================================================
// WORKFLOW ENUMS
// ============================================================================

/// Stage of the workflow state machine, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowStage {
    #[default]
    Instruction,
    TaskDecomposition,
    SprintExecution,
    QualityAssessment,
    ContinuationDecision,
    Completion,
    EmergencyStop,
}

impl WorkflowStage {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            WorkflowStage::Instruction => "Instruction",
            WorkflowStage::TaskDecomposition => "TaskDecomposition",
            WorkflowStage::SprintExecution => "SprintExecution",
            WorkflowStage::QualityAssessment => "QualityAssessment",
            WorkflowStage::ContinuationDecision => "ContinuationDecision",
            WorkflowStage::Completion => "Completion",
            WorkflowStage::EmergencyStop => "EmergencyStop",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "instruction" => Ok(WorkflowStage::Instruction),
            "taskdecomposition" => Ok(WorkflowStage::TaskDecomposition),
            "sprintexecution" => Ok(WorkflowStage::SprintExecution),
            "qualityassessment" => Ok(WorkflowStage::QualityAssessment),
            "continuationdecision" => Ok(WorkflowStage::ContinuationDecision),
            "completion" => Ok(WorkflowStage::Completion),
            "emergencystop" => Ok(WorkflowStage::EmergencyStop),
            _ => Err(EnumParseError::new("workflow stage", s)),
        }
    }

    /// Position in the forward sequence. EmergencyStop sits after Completion.
    pub fn ordinal(&self) -> u8 {
        match self {
            WorkflowStage::Instruction => 0,
            WorkflowStage::TaskDecomposition => 1,
            WorkflowStage::SprintExecution => 2,
            WorkflowStage::QualityAssessment => 3,
            WorkflowStage::ContinuationDecision => 4,
            WorkflowStage::Completion => 5,
            WorkflowStage::EmergencyStop => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStage::Completion | WorkflowStage::EmergencyStop)
    }
}

db_str_conversions!(WorkflowStage);

/// Severity attached to an escalation raised for a human operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EscalationSeverity {
    Info,
    Warning,
    Critical,
}

impl EscalationSeverity {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EscalationSeverity::Info => "Info",
            EscalationSeverity::Warning => "Warning",
            EscalationSeverity::Critical => "Critical",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "info" => Ok(EscalationSeverity::Info),
            "warning" => Ok(EscalationSeverity::Warning),
            "critical" => Ok(EscalationSeverity::Critical),
            _ => Err(EnumParseError::new("escalation severity", s)),
        }
    }
}

db_str_conversions!(EscalationSeverity);

// ============================================================================
// FAULT TOLERANCE ENUMS
// ============================================================================

/// Circuit breaker state. Stored as a `u8` inside the breaker's atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, a single probe is allowed through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl CircuitState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
            Self::HalfOpen => "HalfOpen",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "Closed" => Ok(Self::Closed),
            "Open" => Ok(Self::Open),
            "HalfOpen" => Ok(Self::HalfOpen),
            _ => Err(EnumParseError::new("circuit state", s)),
        }
    }
}

db_str_conversions!(CircuitState);

/// Entity type discriminator used in `NotFound` errors and storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Task,
    Agent,
    Worker,
    Workflow,
    ProgressSummary,
}

impl EntityType {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EntityType::Task => "Task",
            EntityType::Agent => "Agent",
            EntityType::Worker => "Worker",
            EntityType::Workflow => "Workflow",
            EntityType::ProgressSummary => "ProgressSummary",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "task" => Ok(EntityType::Task),
            "agent" => Ok(EntityType::Agent),
            "worker" => Ok(EntityType::Worker),
            "workflow" => Ok(EntityType::Workflow),
            "progresssummary" => Ok(EntityType::ProgressSummary),
            _ => Err(EnumParseError::new("entity type", s)),
        }
    }
}

db_str_conversions!(EntityType);
