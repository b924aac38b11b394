//! Workflow state records

use crate::{
    new_workflow_id, AgentId, EscalationSeverity, TaskId, Timestamp, WorkflowId, WorkflowStage,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one instruction batch moving through the stage machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub stage: WorkflowStage,
    /// Starts at 0 before the first sprint, incremented as each sprint begins.
    pub sprint_id: u32,
    pub started_at: Timestamp,
    pub instructions: Vec<String>,
    pub task_ids: Vec<TaskId>,
    pub assignments: BTreeMap<AgentId, Vec<TaskId>>,
    pub completed: bool,
    pub last_quality_score: Option<f64>,
    /// Set while the workflow waits for an operator decision.
    pub awaiting_operator: bool,
    pub stop_reason: Option<String>,
    pub updated_at: Timestamp,
}

impl WorkflowState {
    pub fn new(instructions: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_workflow_id(),
            stage: WorkflowStage::Instruction,
            sprint_id: 0,
            started_at: now,
            instructions,
            task_ids: Vec::new(),
            assignments: BTreeMap::new(),
            completed: false,
            last_quality_score: None,
            awaiting_operator: false,
            stop_reason: None,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Append-only history record written on every workflow mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHistoryEntry {
    pub sequence: u64,
    pub workflow_id: WorkflowId,
    pub event: String,
    pub state: WorkflowState,
    pub recorded_at: Timestamp,
}

/// A condition surfaced to a human operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub workflow_id: Option<WorkflowId>,
    pub severity: EscalationSeverity,
    /// Component that raised it, e.g. `supervisor` or `workflow`.
    pub source: String,
    pub reason: String,
    pub raised_at: Timestamp,
}

impl EscalationEvent {
    pub fn new(
        severity: EscalationSeverity,
        source: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: None,
            severity,
            source: source.into(),
            reason: reason.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn for_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}
