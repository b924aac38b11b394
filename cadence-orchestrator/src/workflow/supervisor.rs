//! Workflow supervisor.
//!
//! Drives workflows through the stage machine. Each `step` gathers the input
//! the current stage needs (decomposing, running a sprint through the
//! facade, scoring) and commits the resulting transition. Every committed
//! state is appended to the history log before it becomes visible in the
//! active set.

use crate::facade::{CollaborationFacade, TaskRunOutcome};
use crate::workflow::clock::VirtualClock;
use crate::workflow::machine::{transition, ContinuationPolicy, OperatorDecision, StageInput, Transition};
use crate::workflow::quality::{CompletionRatioEvaluator, QualityEvaluator, TaskDecomposer};
use cadence_core::{
    AgentId, AgentState, CadenceError, CadenceResult, EntityType, EscalationEvent,
    EscalationSeverity, ProgressReport, Task, TaskId, WorkflowHistoryEntry, WorkflowId,
    WorkflowStage, WorkflowState,
};
use cadence_storage::StorageTrait;
use cadence_supervisor::SupervisorEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const ESCALATION_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// COMMANDS AND QUERIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkflowCommand {
    Start {
        instructions: Vec<String>,
    },
    /// Advance one stage.
    Step {
        workflow_id: WorkflowId,
    },
    ReportProgress(ProgressReport),
    OperatorDecision {
        workflow_id: WorkflowId,
        decision: OperatorDecision,
    },
    EmergencyStop {
        workflow_id: WorkflowId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponse {
    Workflow(WorkflowState),
    Agent(AgentState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", content = "workflow_id", rename_all = "snake_case")]
pub enum WorkflowQuery {
    /// Current state, or the final state of a finished workflow.
    State(WorkflowId),
    Active,
    History(WorkflowId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryResponse {
    State(WorkflowState),
    Active(Vec<WorkflowState>),
    History(Vec<WorkflowHistoryEntry>),
}

// ============================================================================
// SUPERVISOR
// ============================================================================

pub struct WorkflowSupervisor {
    facade: Arc<CollaborationFacade>,
    clock: VirtualClock,
    policy: ContinuationPolicy,
    sprint_units: u64,
    decomposer: Arc<dyn TaskDecomposer>,
    evaluator: Arc<dyn QualityEvaluator>,
    storage: Option<Arc<dyn StorageTrait>>,
    active: Mutex<BTreeMap<WorkflowId, WorkflowState>>,
    history: Mutex<Vec<WorkflowHistoryEntry>>,
    sequence: AtomicU64,
    stepping: Mutex<BTreeSet<WorkflowId>>,
    escalations: broadcast::Sender<EscalationEvent>,
    escalation_log: Mutex<Vec<EscalationEvent>>,
}

impl std::fmt::Debug for WorkflowSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowSupervisor")
            .field("policy", &self.policy)
            .field("sprint_units", &self.sprint_units)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Marks a workflow as being stepped until dropped.
struct StepGuard<'a> {
    stepping: &'a Mutex<BTreeSet<WorkflowId>>,
    id: WorkflowId,
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.stepping.lock() {
            set.remove(&self.id);
        }
    }
}

impl WorkflowSupervisor {
    /// Supervisor with the completion-ratio evaluator and no history
    /// persistence. Sprint length, virtual time unit and thresholds come
    /// from the facade's configuration.
    pub fn new(facade: Arc<CollaborationFacade>, decomposer: Arc<dyn TaskDecomposer>) -> Self {
        let config = facade.config();
        let (escalations, _) = broadcast::channel(ESCALATION_CHANNEL_CAPACITY);
        Self {
            clock: VirtualClock::new(config.virtual_time_unit),
            policy: ContinuationPolicy::from(config),
            sprint_units: config.sprint_duration_units,
            decomposer,
            evaluator: Arc::new(CompletionRatioEvaluator::new()),
            storage: None,
            active: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            stepping: Mutex::new(BTreeSet::new()),
            escalations,
            escalation_log: Mutex::new(Vec::new()),
            facade,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn QualityEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Append history entries to `storage` as well as memory.
    pub fn with_storage(mut self, storage: Arc<dyn StorageTrait>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn facade(&self) -> &Arc<CollaborationFacade> {
        &self.facade
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn subscribe_escalations(&self) -> broadcast::Receiver<EscalationEvent> {
        self.escalations.subscribe()
    }

    /// Every escalation raised so far, oldest first.
    pub fn escalations(&self) -> Vec<EscalationEvent> {
        self.escalation_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn lock_active(&self) -> CadenceResult<MutexGuard<'_, BTreeMap<WorkflowId, WorkflowState>>> {
        self.active
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("workflow supervisor"))
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    pub async fn handle(&self, command: WorkflowCommand) -> CadenceResult<CommandResponse> {
        match command {
            WorkflowCommand::Start { instructions } => {
                self.start(instructions).map(CommandResponse::Workflow)
            }
            WorkflowCommand::Step { workflow_id } => {
                self.step(workflow_id).await.map(CommandResponse::Workflow)
            }
            WorkflowCommand::ReportProgress(report) => {
                let state = match self.facade.apply_worker_report(&report)? {
                    Some(state) => state,
                    None => self.facade.get_agent_state(&report.agent_id)?,
                };
                Ok(CommandResponse::Agent(state))
            }
            WorkflowCommand::OperatorDecision {
                workflow_id,
                decision,
            } => self
                .apply(workflow_id, None, StageInput::Operator(decision))
                .map(CommandResponse::Workflow),
            WorkflowCommand::EmergencyStop {
                workflow_id,
                reason,
            } => self
                .emergency_stop(workflow_id, reason)
                .map(CommandResponse::Workflow),
        }
    }

    /// Open a workflow for an instruction batch, in the Instruction stage.
    pub fn start(&self, instructions: Vec<String>) -> CadenceResult<WorkflowState> {
        if instructions.iter().all(|i| i.trim().is_empty()) {
            return Err(CadenceError::invalid_input(
                "instructions",
                "at least one non-empty instruction is required",
            ));
        }
        let state = WorkflowState::new(instructions);
        let mut active = self.lock_active()?;
        self.record(&state, "started")?;
        active.insert(state.id, state.clone());
        drop(active);
        tracing::info!(workflow_id = %state.id, "workflow started");
        Ok(state)
    }

    /// Advance `workflow_id` by one stage.
    ///
    /// A workflow waiting for an operator, or already finished, is returned
    /// unchanged. Failures of the decomposer or the evaluator stop the
    /// workflow with a critical escalation instead of failing the call.
    pub async fn step(&self, workflow_id: WorkflowId) -> CadenceResult<WorkflowState> {
        let _guard = self.begin_step(workflow_id)?;
        let active = self.lock_active()?.get(&workflow_id).cloned();
        let Some(snapshot) = active else {
            return self.final_state(workflow_id);
        };

        let input = match snapshot.stage {
            WorkflowStage::Instruction => match self.register_batch(&snapshot).await {
                Ok(task_ids) => StageInput::TasksRegistered { task_ids },
                Err(e) => {
                    return self.fail_workflow(workflow_id, format!("decomposition failed: {e}"))
                }
            },
            WorkflowStage::TaskDecomposition => StageInput::SprintStarted,
            WorkflowStage::SprintExecution => StageInput::SprintFinished {
                assignments: self.run_sprint(&snapshot).await,
            },
            WorkflowStage::QualityAssessment => match self.assess(&snapshot).await {
                Ok(score) => StageInput::Assessed { score },
                Err(e) => {
                    return self.fail_workflow(workflow_id, format!("quality evaluation failed: {e}"))
                }
            },
            WorkflowStage::ContinuationDecision if snapshot.awaiting_operator => {
                return Ok(snapshot)
            }
            WorkflowStage::ContinuationDecision => StageInput::Decide(self.policy),
            WorkflowStage::Completion | WorkflowStage::EmergencyStop => return Ok(snapshot),
        };
        self.apply(workflow_id, Some(&snapshot), input)
    }

    /// Step until the workflow finishes or waits for an operator, pausing
    /// one virtual time unit between stages.
    pub async fn run_to_completion(&self, instructions: Vec<String>) -> CadenceResult<WorkflowState> {
        let mut state = self.start(instructions)?;
        while !state.is_finished() && !state.awaiting_operator {
            state = self.step(state.id).await?;
            self.clock.advance(1).await;
        }
        tracing::info!(
            workflow_id = %state.id,
            stage = %state.stage,
            sprints = state.sprint_id,
            "workflow settled"
        );
        Ok(state)
    }

    /// Stop a workflow from any unfinished stage: its unfinished tasks are
    /// cancelled and their resource holds released.
    pub fn emergency_stop(
        &self,
        workflow_id: WorkflowId,
        reason: impl Into<String>,
    ) -> CadenceResult<WorkflowState> {
        let reason = reason.into();
        let state = self.apply(
            workflow_id,
            None,
            StageInput::EmergencyStop {
                reason: reason.clone(),
            },
        )?;
        self.cancel_unfinished(&state.task_ids);
        match self.facade.coordinator().release_terminal() {
            Ok(swept) if !swept.is_empty() => {
                tracing::debug!(tasks = swept.len(), "released holds of finished tasks")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "terminal hold sweep failed"),
        }
        tracing::warn!(workflow_id = %workflow_id, reason = %reason, "workflow emergency stopped");
        Ok(state)
    }

    fn fail_workflow(&self, workflow_id: WorkflowId, reason: String) -> CadenceResult<WorkflowState> {
        self.escalate(
            EscalationEvent::new(EscalationSeverity::Critical, "workflow", reason.clone())
                .for_workflow(workflow_id),
        );
        self.emergency_stop(workflow_id, reason)
    }

    fn cancel_unfinished(&self, task_ids: &[TaskId]) {
        for task_id in task_ids {
            let unfinished = self
                .facade
                .get_task(task_id)
                .map(|t| !t.is_terminal())
                .unwrap_or(false);
            if unfinished {
                if let Err(e) = self.facade.cancel_task(task_id) {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to cancel task");
                }
            }
        }
    }

    fn begin_step(&self, workflow_id: WorkflowId) -> CadenceResult<StepGuard<'_>> {
        let mut stepping = self
            .stepping
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("workflow supervisor"))?;
        if !stepping.insert(workflow_id) {
            return Err(CadenceError::invalid_input(
                "workflow_id",
                format!("workflow {workflow_id} is already being stepped"),
            ));
        }
        Ok(StepGuard {
            stepping: &self.stepping,
            id: workflow_id,
        })
    }

    /// Apply `input` to the active state. With `expected`, the call fails if
    /// the workflow moved on since that snapshot was taken.
    fn apply(
        &self,
        workflow_id: WorkflowId,
        expected: Option<&WorkflowState>,
        input: StageInput,
    ) -> CadenceResult<WorkflowState> {
        let mut active = self.lock_active()?;
        let current = active.get(&workflow_id).ok_or_else(|| {
            CadenceError::not_found(EntityType::Workflow, workflow_id)
        })?;
        if let Some(expected) = expected {
            let moved = current.stage != expected.stage
                || current.sprint_id != expected.sprint_id
                || current.awaiting_operator != expected.awaiting_operator;
            if moved {
                return Err(CadenceError::invalid_input(
                    "workflow_id",
                    format!("workflow {workflow_id} changed while its stage was running"),
                ));
            }
        }

        let Transition {
            state,
            event,
            escalation,
            ..
        } = transition(current, input)?;
        self.record(&state, &event)?;
        if state.is_finished() {
            active.remove(&workflow_id);
        } else {
            active.insert(workflow_id, state.clone());
        }
        drop(active);

        tracing::info!(
            workflow_id = %workflow_id,
            stage = %state.stage,
            sprint = state.sprint_id,
            event = %event,
            "workflow transition"
        );
        if let Some(escalation) = escalation {
            self.escalate(escalation);
        }
        Ok(state)
    }

    fn record(&self, state: &WorkflowState, event: &str) -> CadenceResult<()> {
        let entry = WorkflowHistoryEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            workflow_id: state.id,
            event: event.to_string(),
            state: state.clone(),
            recorded_at: Utc::now(),
        };
        if let Some(storage) = &self.storage {
            storage.append_workflow_history(&entry)?;
        }
        self.history
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("workflow history"))?
            .push(entry);
        Ok(())
    }

    /// Publish an escalation to subscribers and the log.
    pub fn escalate(&self, event: EscalationEvent) {
        match event.severity {
            EscalationSeverity::Critical => tracing::error!(
                workflow_id = ?event.workflow_id,
                source = %event.source,
                reason = %event.reason,
                "escalation"
            ),
            _ => tracing::warn!(
                workflow_id = ?event.workflow_id,
                severity = %event.severity,
                source = %event.source,
                reason = %event.reason,
                "escalation"
            ),
        }
        if let Ok(mut log) = self.escalation_log.lock() {
            log.push(event.clone());
        }
        // No subscribers is fine; the log keeps it.
        let _ = self.escalations.send(event);
    }

    /// Forward supervisor escalations into this supervisor's channel until
    /// the event stream closes.
    pub fn forward_supervisor_escalations(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SupervisorEvent>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::Escalation(event)) => this.escalate(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "escalation forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // ========================================================================
    // STAGE WORK
    // ========================================================================

    /// Decompose the instructions and register the batch. Tasks added before
    /// a failure are cancelled again.
    async fn register_batch(&self, state: &WorkflowState) -> CadenceResult<Vec<TaskId>> {
        let batch = self.decomposer.decompose(&state.instructions).await?;
        batch.validate()?;
        for task in &batch.tasks {
            if self.facade.graph().contains(&task.id)? {
                return Err(CadenceError::invalid_input(
                    "batch.tasks",
                    format!("task {} is already registered", task.id),
                ));
            }
        }

        let mut added = Vec::with_capacity(batch.tasks.len());
        let registered = (|| {
            for task in &batch.tasks {
                self.facade.add_task(task.clone())?;
                added.push(task.id.clone());
            }
            for edge in &batch.dependencies {
                self.facade
                    .add_dependency_with_kind(&edge.task, &edge.depends_on, edge.kind)?;
            }
            Ok::<_, CadenceError>(())
        })();
        if let Err(e) = registered {
            self.cancel_unfinished(&added);
            return Err(e);
        }

        tracing::info!(
            workflow_id = %state.id,
            tasks = added.len(),
            edges = batch.dependencies.len(),
            "batch registered"
        );
        Ok(added)
    }

    /// Run the workflow's unfinished tasks until they settle or the sprint
    /// runs out of virtual time. Returns which agent ran which task.
    async fn run_sprint(&self, state: &WorkflowState) -> BTreeMap<AgentId, Vec<TaskId>> {
        let pending: Vec<TaskId> = state
            .task_ids
            .iter()
            .filter(|id| {
                self.facade
                    .get_task(id)
                    .map(|t| !t.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let deadline = self.clock.deadline_after(self.sprint_units);
        tracing::info!(
            workflow_id = %state.id,
            sprint = state.sprint_id,
            tasks = pending.len(),
            "sprint started"
        );

        let results = self
            .facade
            .execute_workflow_until(&pending, Some(deadline))
            .await;

        let mut assignments: BTreeMap<AgentId, Vec<TaskId>> = BTreeMap::new();
        let mut conflicted = Vec::new();
        for result in results {
            match result.outcome {
                TaskRunOutcome::Completed | TaskRunOutcome::Failed => {
                    if let Some(agent) = result.agent_id {
                        assignments.entry(agent).or_default().push(result.task_id);
                    }
                }
                TaskRunOutcome::Conflict => conflicted.push(result.task_id),
                TaskRunOutcome::Skipped => {}
            }
        }
        if !conflicted.is_empty() {
            let names: Vec<String> = conflicted.iter().map(ToString::to_string).collect();
            self.escalate(
                EscalationEvent::new(
                    EscalationSeverity::Warning,
                    "workflow",
                    format!("tasks gave up on held resources: {}", names.join(", ")),
                )
                .for_workflow(state.id),
            );
        }
        assignments
    }

    async fn assess(&self, state: &WorkflowState) -> CadenceResult<f64> {
        let tasks: Vec<Task> = state
            .task_ids
            .iter()
            .filter_map(|id| self.facade.get_task(id).ok())
            .collect();
        let score = self.evaluator.evaluate(&tasks).await?;
        if !(0.0..=100.0).contains(&score) {
            return Err(CadenceError::invalid_input(
                "quality_score",
                format!("evaluator returned {score}"),
            ));
        }
        Ok(score)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn query(&self, query: WorkflowQuery) -> CadenceResult<QueryResponse> {
        match query {
            WorkflowQuery::State(id) => {
                if let Some(state) = self.lock_active()?.get(&id) {
                    return Ok(QueryResponse::State(state.clone()));
                }
                self.final_state(id).map(QueryResponse::State)
            }
            WorkflowQuery::Active => {
                let mut states: Vec<WorkflowState> = self.lock_active()?.values().cloned().collect();
                states.sort_by_key(|s| s.started_at);
                Ok(QueryResponse::Active(states))
            }
            WorkflowQuery::History(id) => self.history_of(id).map(QueryResponse::History),
        }
    }

    fn history_of(&self, workflow_id: WorkflowId) -> CadenceResult<Vec<WorkflowHistoryEntry>> {
        if let Some(storage) = &self.storage {
            return storage.load_workflow_history(workflow_id);
        }
        Ok(self
            .history
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("workflow history"))?
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    /// Latest recorded state of a workflow no longer in the active set.
    fn final_state(&self, workflow_id: WorkflowId) -> CadenceResult<WorkflowState> {
        self.history_of(workflow_id)?
            .into_iter()
            .max_by_key(|e| e.sequence)
            .map(|e| e.state)
            .ok_or_else(|| CadenceError::not_found(EntityType::Workflow, workflow_id))
    }
}
