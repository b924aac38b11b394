//! Batch files consumed by the `cadence` binary, and the report it prints.

use crate::workflow::DecomposedBatch;
use cadence_core::{
    AgentId, CadenceError, CadenceResult, ConfigError, DependencyEdge, EscalationEvent,
    SystemHealthReport, Task, WorkflowState,
};
use cadence_supervisor::WorkerSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Agent registered when a batch names neither workers nor agents.
pub const DEFAULT_SIMULATED_AGENT: &str = "simulated";

/// One instruction batch with its tasks already decomposed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchFile {
    pub instructions: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
    /// Worker processes to supervise. Without any, tasks are simulated.
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    /// Simulated agents. Ignored when `workers` is set.
    #[serde(default)]
    pub agents: Vec<AgentId>,
}

impl BatchFile {
    pub fn from_json_str(contents: &str) -> CadenceResult<Self> {
        serde_json::from_str(contents).map_err(|e| {
            CadenceError::Config(ConfigError::Parse {
                reason: format!("batch file: {e}"),
            })
        })
    }

    pub fn from_path(path: &Path) -> CadenceResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::Config(ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Self::from_json_str(&contents)
    }

    pub fn is_simulated(&self) -> bool {
        self.workers.is_empty()
    }

    /// Agents to register for a simulated run.
    pub fn simulated_agents(&self) -> Vec<AgentId> {
        if self.agents.is_empty() {
            vec![AgentId::from(DEFAULT_SIMULATED_AGENT)]
        } else {
            self.agents.clone()
        }
    }

    pub fn decomposed(&self) -> DecomposedBatch {
        DecomposedBatch {
            tasks: self.tasks.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

/// Final output of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workflow: WorkflowState,
    pub tasks: Vec<Task>,
    pub health: SystemHealthReport,
    pub escalations: Vec<EscalationEvent>,
}
