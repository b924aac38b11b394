//! Task executors.
//!
//! The facade claims a task for an agent, then hands it to a
//! `TaskExecutor`. `WorkerTaskExecutor` drives a supervised worker process
//! over its stdin/stdout line protocol. `SimulatedExecutor` sleeps for the
//! task's estimate in virtual time, which is what tests and dry runs use.

use async_trait::async_trait;
use cadence_core::constants::EXECUTE_COMMAND;
use cadence_core::{AgentId, CadenceError, CadenceResult, SystemError, Task, TaskId};
use cadence_supervisor::{OutputStream, ProcessSupervisor, WorkerLine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// How an executor finished a task it accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Runs one claimed task to an outcome.
///
/// `Err` is reserved for failures of the executor itself (a dead worker, a
/// broken pipe). A task that ran and did not succeed is `Ok(Failed)`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, agent_id: &AgentId, task: &Task) -> CadenceResult<ExecutionOutcome>;
}

// ============================================================================
// SIMULATED
// ============================================================================

/// Completes each task after its estimate, with one second of estimate
/// taking one virtual time unit.
#[derive(Debug)]
pub struct SimulatedExecutor {
    virtual_unit: Duration,
    failing: BTreeSet<TaskId>,
    executed: Mutex<Vec<TaskId>>,
}

impl SimulatedExecutor {
    pub fn new(virtual_unit: Duration) -> Self {
        Self {
            virtual_unit,
            failing: BTreeSet::new(),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Tasks in `ids` report failure instead of success.
    pub fn with_failures<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.failing = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Wall-clock time a task with this estimate takes. Saturates at
    /// `Duration::MAX`.
    pub fn wall_time(&self, estimate: Duration) -> Duration {
        Duration::try_from_secs_f64(self.virtual_unit.as_secs_f64() * estimate.as_secs_f64())
            .unwrap_or(Duration::MAX)
    }

    /// Task ids in the order execution started.
    pub fn executed(&self) -> Vec<TaskId> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, agent_id: &AgentId, task: &Task) -> CadenceResult<ExecutionOutcome> {
        self.executed
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("simulated executor"))?
            .push(task.id.clone());
        tokio::time::sleep(self.wall_time(task.estimated_duration)).await;

        if self.failing.contains(&task.id) {
            tracing::debug!(task_id = %task.id, agent_id = %agent_id, "simulated task failed");
            return Ok(ExecutionOutcome::Failed {
                reason: "simulated failure".into(),
            });
        }
        Ok(ExecutionOutcome::Succeeded)
    }
}

// ============================================================================
// WORKER PROCESS
// ============================================================================

/// Payload of an `EXECUTE` instruction line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstruction {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub required_resources: BTreeSet<String>,
}

impl From<&Task> for TaskInstruction {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            required_resources: task.required_resources.clone(),
        }
    }
}

/// Format the instruction line written to a worker's stdin.
pub fn instruction_line(task: &Task) -> CadenceResult<String> {
    let payload = serde_json::to_string(&TaskInstruction::from(task)).map_err(|e| {
        CadenceError::invalid_input("task", format!("task {} is not serializable: {e}", task.id))
    })?;
    Ok(format!("{EXECUTE_COMMAND} {payload}"))
}

/// Sends `EXECUTE <json>` to the agent's worker and waits for its
/// `__TASK_DONE__:` or `__TASK_FAILED__:` line.
#[derive(Debug, Clone)]
pub struct WorkerTaskExecutor {
    supervisor: Arc<ProcessSupervisor>,
    task_timeout: Duration,
}

impl WorkerTaskExecutor {
    pub fn new(supervisor: Arc<ProcessSupervisor>, task_timeout: Duration) -> Self {
        Self {
            supervisor,
            task_timeout,
        }
    }
}

#[async_trait]
impl TaskExecutor for WorkerTaskExecutor {
    async fn execute(&self, agent_id: &AgentId, task: &Task) -> CadenceResult<ExecutionOutcome> {
        // Subscribe first so a fast worker cannot answer before we listen.
        let mut output = self.supervisor.subscribe_output();
        self.supervisor
            .send_instruction(agent_id, &instruction_line(task)?)
            .await?;
        tracing::debug!(task_id = %task.id, agent_id = %agent_id, "task sent to worker");

        let wait = async {
            loop {
                let line = match output.recv().await {
                    Ok(line) => line,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(agent_id = %agent_id, skipped, "worker output lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(CadenceError::System(SystemError::ProcessIo {
                            agent_id: agent_id.to_string(),
                            reason: "worker output closed".into(),
                        }));
                    }
                };
                if line.agent_id != *agent_id || line.stream != OutputStream::Stdout {
                    continue;
                }
                match WorkerLine::parse(&line.line) {
                    WorkerLine::TaskDone { task_id } if task_id == task.id => {
                        return Ok(ExecutionOutcome::Succeeded);
                    }
                    WorkerLine::TaskFailed { task_id, reason } if task_id == task.id => {
                        return Ok(ExecutionOutcome::Failed { reason });
                    }
                    _ => {}
                }
            }
        };

        tokio::time::timeout(self.task_timeout, wait)
            .await
            .map_err(|_| {
                CadenceError::System(SystemError::Timeout {
                    operation: format!("task {}", task.id),
                    after: self.task_timeout,
                })
            })?
    }
}
