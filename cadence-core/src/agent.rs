//! Agent liveness and progress records

use crate::{AgentId, AgentStatus, CadenceError, CadenceResult, TaskId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MIN_PROGRESS: f64 = 0.0;
pub const MAX_PROGRESS: f64 = 100.0;

/// Reject progress outside `[0, 100]`. NaN is out of range.
pub fn validate_progress(progress: f64) -> CadenceResult<()> {
    if (MIN_PROGRESS..=MAX_PROGRESS).contains(&progress) {
        Ok(())
    } else {
        Err(CadenceError::invalid_input(
            "progress",
            format!("{progress} is outside [{MIN_PROGRESS}, {MAX_PROGRESS}]"),
        ))
    }
}

/// Current state of one agent. Exactly one per worker-process role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub progress: f64,
    pub current_task: Option<TaskId>,
    pub working_directory: PathBuf,
    pub process_id: Option<u32>,
    pub last_update: Timestamp,
}

impl AgentState {
    pub fn new(agent_id: impl Into<AgentId>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            progress: 0.0,
            current_task: None,
            working_directory: working_directory.into(),
            process_id: None,
            last_update: Utc::now(),
        }
    }

    /// Stale is derived from the last update, never stored.
    pub fn is_stale(&self, threshold: std::time::Duration, now: Timestamp) -> bool {
        match (now - self.last_update).to_std() {
            Ok(age) => age > threshold,
            Err(_) => false,
        }
    }
}

/// One accepted agent update, kept for trend analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub progress: f64,
    pub current_task: Option<TaskId>,
    pub recorded_at: Timestamp,
}

impl From<&AgentState> for ProgressSample {
    fn from(state: &AgentState) -> Self {
        Self {
            agent_id: state.agent_id.clone(),
            status: state.status,
            progress: state.progress,
            current_task: state.current_task.clone(),
            recorded_at: state.last_update,
        }
    }
}

/// Progress line emitted by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub progress: f64,
    #[serde(default)]
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub message: Option<String>,
}
