//! Collaboration facade.
//!
//! The single entry point for UI and CLI layers. Every operation that
//! touches more than one component runs here, under the facade's operation
//! lock, in the fixed order graph -> agent store -> coordinator. Components
//! never call each other for writes, so this is the only place lock order
//! has to be reasoned about.

use crate::executor::{ExecutionOutcome, SimulatedExecutor, TaskExecutor};
use cadence_agents::{AgentStateStore, Coordinator, ProgressAggregator, ResourceGrant};
use cadence_core::{
    AgentId, AgentState, AgentStatus, CadenceConfig, CadenceError, CadenceResult,
    CircuitBreakerConfig, CircuitState, CollaborationEfficiency, CriticalPath, DependencyKind,
    EntityType, HealthCheck, ProgressReport, ProgressSummary, ProgressTrend, SystemError,
    SystemHealthReport, Task, TaskId, TaskStatus,
};
use cadence_graph::TaskGraph;
use cadence_storage::StorageTrait;
use cadence_supervisor::{
    CircuitBreaker, CircuitBreakerStats, OutputStream, ProcessSupervisor, ResourceGuard,
    WorkerLine, WorkerOutput,
};
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunOutcome {
    Completed,
    Failed,
    /// Never started: cancelled, blocked by a dependency that did not
    /// complete, unknown, or out of time.
    Skipped,
    /// Gave up after its resources stayed held by other work.
    Conflict,
}

/// Result value for one task of an `execute_workflow` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub task_id: TaskId,
    pub outcome: TaskRunOutcome,
    pub agent_id: Option<AgentId>,
    /// Claim attempts made, including the successful one.
    pub attempts: u32,
    pub detail: Option<String>,
}

impl TaskRunResult {
    fn new(task_id: TaskId, outcome: TaskRunOutcome) -> Self {
        Self {
            task_id,
            outcome,
            agent_id: None,
            attempts: 0,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct FacadeBuilder {
    config: CadenceConfig,
    storage: Option<Arc<dyn StorageTrait>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    guard: Option<Arc<ResourceGuard>>,
}

impl FacadeBuilder {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            storage: None,
            executor: None,
            supervisor: None,
            guard: None,
        }
    }

    /// Persist tasks, edges and agent history through `storage`. Tasks and
    /// edges already in it are loaded at build time.
    pub fn storage(mut self, storage: Arc<dyn StorageTrait>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Include the supervisor in health checks. Its resource guard is
    /// shared unless `guard` is also set.
    pub fn supervisor(mut self, supervisor: Arc<ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn guard(mut self, guard: Arc<ResourceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn build(self) -> CadenceResult<CollaborationFacade> {
        let config = self.config;
        config.validate()?;

        let (graph, agents) = match &self.storage {
            Some(storage) => (
                TaskGraph::restore(storage.clone())?,
                AgentStateStore::with_storage(config.progress_history_limit, storage.clone()),
            ),
            None => (
                TaskGraph::new(),
                AgentStateStore::new(config.progress_history_limit),
            ),
        };
        let graph = Arc::new(graph);
        let agents = Arc::new(agents);

        let guard = self
            .guard
            .or_else(|| self.supervisor.as_ref().map(|s| s.guard().clone()))
            .unwrap_or_else(|| Arc::new(ResourceGuard::new(config.resource_guard.clone())));
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SimulatedExecutor::new(config.virtual_time_unit)));
        let executor_breaker = CircuitBreaker::new(
            "facade.executor",
            CircuitBreakerConfig {
                call_timeout: config.task_timeout,
                ..config.circuit_breaker.clone()
            },
        );

        Ok(CollaborationFacade {
            progress: ProgressAggregator::new(
                graph.clone(),
                agents.clone(),
                config.trend_window,
                config.stale_agent_threshold,
            ),
            coordinator: Coordinator::new(graph.clone(), agents.clone()),
            graph,
            agents,
            guard,
            executor_breaker,
            executor,
            supervisor: self.supervisor,
            storage: self.storage,
            in_flight: Mutex::new(HashSet::new()),
            ops: Mutex::new(()),
            config,
        })
    }
}

// ============================================================================
// FACADE
// ============================================================================

pub struct CollaborationFacade {
    config: CadenceConfig,
    graph: Arc<TaskGraph>,
    agents: Arc<AgentStateStore>,
    progress: ProgressAggregator,
    coordinator: Coordinator,
    guard: Arc<ResourceGuard>,
    executor_breaker: CircuitBreaker,
    executor: Arc<dyn TaskExecutor>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    storage: Option<Arc<dyn StorageTrait>>,
    /// Tasks currently inside an executor call.
    in_flight: Mutex<HashSet<TaskId>>,
    ops: Mutex<()>,
}

impl std::fmt::Debug for CollaborationFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationFacade")
            .field("graph", &self.graph)
            .field("executor_breaker", &self.executor_breaker)
            .field("supervised", &self.supervisor.is_some())
            .field("persistent", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

impl CollaborationFacade {
    /// Facade with in-memory stores and the simulated executor.
    pub fn new(config: CadenceConfig) -> CadenceResult<Self> {
        FacadeBuilder::new(config).build()
    }

    pub fn builder(config: CadenceConfig) -> FacadeBuilder {
        FacadeBuilder::new(config)
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn agents(&self) -> &Arc<AgentStateStore> {
        &self.agents
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn guard(&self) -> &Arc<ResourceGuard> {
        &self.guard
    }

    pub fn supervisor(&self) -> Option<&Arc<ProcessSupervisor>> {
        self.supervisor.as_ref()
    }

    pub fn executor_breaker_stats(&self) -> CircuitBreakerStats {
        self.executor_breaker.stats()
    }

    fn lock_ops(&self) -> CadenceResult<MutexGuard<'_, ()>> {
        self.ops
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("collaboration facade"))
    }

    fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(task_id))
            .unwrap_or(false)
    }

    fn set_in_flight(&self, task_id: &TaskId, running: bool) {
        if let Ok(mut set) = self.in_flight.lock() {
            if running {
                set.insert(task_id.clone());
            } else {
                set.remove(task_id);
            }
        }
    }

    // ========================================================================
    // TASKS AND AGENTS
    // ========================================================================

    pub fn add_task(&self, task: Task) -> CadenceResult<()> {
        self.graph.add_task(task)
    }

    pub fn add_dependency(&self, task: &TaskId, depends_on: &TaskId) -> CadenceResult<()> {
        self.graph.add_dependency(task, depends_on)
    }

    pub fn add_dependency_with_kind(
        &self,
        task: &TaskId,
        depends_on: &TaskId,
        kind: DependencyKind,
    ) -> CadenceResult<()> {
        self.graph.add_dependency_with_kind(task, depends_on, kind)
    }

    pub fn register_agent(
        &self,
        agent_id: AgentId,
        working_directory: impl Into<PathBuf>,
    ) -> CadenceResult<AgentState> {
        self.agents.register_agent(agent_id, working_directory)
    }

    pub fn update_agent_state(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
        progress: f64,
        current_task: Option<TaskId>,
    ) -> CadenceResult<AgentState> {
        self.agents
            .update_agent_state(agent_id, status, progress, current_task)
    }

    pub fn get_task(&self, id: &TaskId) -> CadenceResult<Task> {
        self.graph.get_task(id)
    }

    /// Every task, in creation order.
    pub fn get_all_tasks(&self) -> CadenceResult<Vec<Task>> {
        self.graph.all_tasks()
    }

    pub fn get_agent_state(&self, agent_id: &AgentId) -> CadenceResult<AgentState> {
        self.agents.get_agent_state(agent_id)
    }

    // ========================================================================
    // ASSIGNMENT
    // ========================================================================

    /// Claim `task_id` for the first Idle agent (by id): the coordinator
    /// grants the task's resources, the agent goes Working and the task goes
    /// InProgress, or nothing changes.
    ///
    /// Fails with `ResourceExhausted` when no agent is Idle or the
    /// concurrent agent cap is reached.
    pub fn auto_assign_task(&self, task_id: &TaskId) -> CadenceResult<ResourceGrant> {
        let _ops = self.lock_ops()?;
        if self.working_agents() >= self.config.max_concurrent_agents {
            return Err(SystemError::ResourceExhausted {
                resource: "agents".into(),
                reason: format!(
                    "{} agents already working",
                    self.config.max_concurrent_agents
                ),
            }
            .into());
        }
        let agent_id = self.agents.idle_agents().into_iter().next().ok_or_else(|| {
            CadenceError::from(SystemError::ResourceExhausted {
                resource: "agents".into(),
                reason: "no idle agent".into(),
            })
        })?;
        let grant = self.claim(&agent_id, task_id)?;
        tracing::info!(task_id = %task_id, agent_id = %agent_id, "task assigned");
        Ok(grant)
    }

    fn working_agents(&self) -> usize {
        self.agents
            .all_agents()
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count()
    }

    /// Claim with the operation lock held by the caller.
    fn claim(&self, agent_id: &AgentId, task_id: &TaskId) -> CadenceResult<ResourceGrant> {
        let task = self.graph.get_task(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(CadenceError::invalid_input(
                "task_id",
                format!("task {task_id} is {}", task.status),
            ));
        }
        if !self.graph.is_executable(task_id)? {
            return Err(CadenceError::invalid_input(
                "task_id",
                format!("task {task_id} has unsatisfied dependencies"),
            ));
        }
        let previous = self.agents.get_agent_state(agent_id)?;
        if !previous.status.can_accept_work() || previous.current_task.is_some() {
            return Err(CadenceError::invalid_input(
                "agent_id",
                format!("agent {agent_id} is {}", previous.status),
            ));
        }

        let grant =
            self.coordinator
                .request_task_execution(agent_id, task_id, &task.required_resources)?;

        if let Err(e) = self.agents.update_agent_state(
            agent_id,
            AgentStatus::Working,
            0.0,
            Some(task_id.clone()),
        ) {
            self.undo_grant(task_id);
            return Err(e);
        }
        if let Err(e) = self.graph.start_task(task_id, agent_id) {
            self.restore_agent(&previous);
            self.undo_grant(task_id);
            return Err(e);
        }
        Ok(grant)
    }

    fn undo_grant(&self, task_id: &TaskId) {
        if let Err(e) = self.coordinator.release(task_id) {
            tracing::error!(task_id = %task_id, error = %e, "failed to roll back resource grant");
        }
    }

    fn restore_agent(&self, previous: &AgentState) {
        if let Err(e) = self.agents.update_agent_state(
            &previous.agent_id,
            previous.status,
            previous.progress,
            previous.current_task.clone(),
        ) {
            tracing::error!(agent_id = %previous.agent_id, error = %e, "failed to roll back agent state");
        }
    }

    /// Record an executor result: the task reaches its terminal status, its
    /// holds are released and the agent returns to Idle.
    fn finish(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        succeeded: bool,
    ) -> CadenceResult<TaskRunOutcome> {
        let _ops = self.lock_ops()?;
        let outcome = match self.graph.get_task(task_id)?.status {
            TaskStatus::Cancelled => TaskRunOutcome::Skipped,
            _ if succeeded => {
                self.graph.complete_task(task_id, None)?;
                TaskRunOutcome::Completed
            }
            _ => {
                self.graph.fail_task(task_id)?;
                TaskRunOutcome::Failed
            }
        };
        self.coordinator.release(task_id)?;

        let agent = self.agents.get_agent_state(agent_id)?;
        if agent.current_task.as_ref() == Some(task_id) {
            let progress = if outcome == TaskRunOutcome::Completed {
                100.0
            } else {
                agent.progress
            };
            self.agents
                .update_agent_state(agent_id, AgentStatus::Idle, progress, None)?;
        }
        Ok(outcome)
    }

    /// Cancel a task, release its holds, and free its agent unless an
    /// executor is still running it (the run frees the agent when it ends).
    pub fn cancel_task(&self, task_id: &TaskId) -> CadenceResult<Task> {
        let _ops = self.lock_ops()?;
        let task = self.graph.cancel_task(task_id)?;
        self.coordinator.release(task_id)?;

        if let Some(agent_id) = &task.assigned_agent {
            if !self.is_in_flight(task_id) {
                if let Ok(agent) = self.agents.get_agent_state(agent_id) {
                    if agent.current_task.as_ref() == Some(task_id) {
                        self.agents.update_agent_state(
                            agent_id,
                            AgentStatus::Idle,
                            agent.progress,
                            None,
                        )?;
                    }
                }
            }
        }
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(task)
    }

    pub fn release_all_resources(&self) -> CadenceResult<usize> {
        let _ops = self.lock_ops()?;
        self.coordinator.release_all()
    }

    // ========================================================================
    // EXECUTION PIPELINE
    // ========================================================================

    /// Run `task_ids` to completion in dependency order. Never fails: every
    /// task gets a result, in input order (duplicates collapsed).
    pub async fn execute_workflow(&self, task_ids: &[TaskId]) -> Vec<TaskRunResult> {
        self.execute_workflow_until(task_ids, None).await
    }

    /// Like `execute_workflow`, but no new task starts after `deadline`.
    /// Tasks still waiting then are `Skipped`.
    ///
    /// Work proceeds in waves. Each wave claims every executable task it can
    /// (one per Idle agent, no two sharing a resource), runs them
    /// concurrently, and records the results before the next wave starts.
    /// A task whose resources are held outside the run is retried in later
    /// waves and becomes `Conflict` after `max_retry_attempts` retries.
    pub async fn execute_workflow_until(
        &self,
        task_ids: &[TaskId],
        deadline: Option<Instant>,
    ) -> Vec<TaskRunResult> {
        let mut order = Vec::with_capacity(task_ids.len());
        let mut pending = BTreeSet::new();
        for id in task_ids {
            if pending.insert(id.clone()) {
                order.push(id.clone());
            }
        }
        let mut results: HashMap<TaskId, TaskRunResult> = HashMap::new();
        let mut conflicts: HashMap<TaskId, u32> = HashMap::new();
        let mut idle_rounds = 0u32;
        let mut outside_polls = 0u32;
        let mut outside_stalls = 0u32;
        tracing::info!(tasks = order.len(), "workflow execution started");

        loop {
            self.settle(&mut pending, &mut results);
            if pending.is_empty() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                skip_all(&mut pending, &mut results, "sprint deadline reached");
                break;
            }

            let runnable: Vec<Task> = match self.graph.get_executable_tasks() {
                Ok(tasks) => tasks
                    .into_iter()
                    .filter(|t| pending.contains(&t.id))
                    .collect(),
                Err(e) => {
                    for id in std::mem::take(&mut pending) {
                        results.insert(
                            id.clone(),
                            TaskRunResult::new(id, TaskRunOutcome::Failed).with_detail(e.to_string()),
                        );
                    }
                    break;
                }
            };
            if runnable.is_empty() {
                // Everything left waits on tasks outside this run. Keep polling
                // while one of them is running; give up on idle ones after the
                // retry budget.
                if self.waits_on_running(&pending) {
                    outside_stalls = 0;
                } else {
                    outside_stalls += 1;
                    if outside_stalls > self.config.max_retry_attempts {
                        skip_all(
                            &mut pending,
                            &mut results,
                            "dependencies outside this run are not complete",
                        );
                        break;
                    }
                }
                let mut backoff = self.config.retry.backoff_for(outside_polls);
                if let Some(d) = deadline {
                    backoff = backoff.min(d.saturating_duration_since(Instant::now()));
                }
                outside_polls = outside_polls.saturating_add(1);
                tracing::debug!(
                    waiting = pending.len(),
                    backoff_ms = backoff.as_millis() as u64,
                    "waiting on dependencies outside this run"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            outside_polls = 0;
            outside_stalls = 0;

            let wave = self.claim_wave(&runnable, &mut conflicts, &mut pending, &mut results);
            if wave.is_empty() {
                idle_rounds += 1;
                if idle_rounds > self.config.max_retry_attempts {
                    for task in &runnable {
                        if !pending.remove(&task.id) {
                            continue;
                        }
                        let attempts = conflicts.get(&task.id).copied().unwrap_or(0);
                        let (outcome, detail) = if attempts > 0 {
                            (TaskRunOutcome::Conflict, "resources stayed held")
                        } else {
                            (TaskRunOutcome::Skipped, "no idle agent")
                        };
                        let mut result =
                            TaskRunResult::new(task.id.clone(), outcome).with_detail(detail);
                        result.attempts = attempts;
                        results.insert(task.id.clone(), result);
                    }
                    idle_rounds = 0;
                    continue;
                }
                let mut backoff = self.config.retry.backoff_for(idle_rounds - 1);
                if let Some(d) = deadline {
                    backoff = backoff.min(d.saturating_duration_since(Instant::now()));
                }
                tokio::time::sleep(backoff).await;
                continue;
            }
            idle_rounds = 0;

            let runs = wave
                .into_iter()
                .map(|(grant, attempts)| self.run_claimed(grant, attempts));
            for result in join_all(runs).await {
                pending.remove(&result.task_id);
                results.insert(result.task_id.clone(), result);
            }
        }

        let results: Vec<TaskRunResult> = order
            .into_iter()
            .filter_map(|id| results.remove(&id))
            .collect();
        let completed = results
            .iter()
            .filter(|r| r.outcome == TaskRunOutcome::Completed)
            .count();
        tracing::info!(tasks = results.len(), completed, "workflow execution finished");
        results
    }

    /// Resolve pending tasks that must not or need not run, until nothing
    /// changes.
    fn settle(&self, pending: &mut BTreeSet<TaskId>, results: &mut HashMap<TaskId, TaskRunResult>) {
        loop {
            let mut resolved = Vec::new();
            for id in pending.iter() {
                if let Some(result) = self.settle_one(id, results) {
                    resolved.push(result);
                }
            }
            if resolved.is_empty() {
                return;
            }
            for result in resolved {
                pending.remove(&result.task_id);
                results.insert(result.task_id.clone(), result);
            }
        }
    }

    fn settle_one(
        &self,
        id: &TaskId,
        results: &HashMap<TaskId, TaskRunResult>,
    ) -> Option<TaskRunResult> {
        let task = match self.graph.get_task(id) {
            Ok(task) => task,
            Err(CadenceError::NotFound { .. }) => {
                return Some(
                    TaskRunResult::new(id.clone(), TaskRunOutcome::Skipped)
                        .with_detail("task not found"),
                )
            }
            Err(e) => {
                return Some(
                    TaskRunResult::new(id.clone(), TaskRunOutcome::Failed).with_detail(e.to_string()),
                )
            }
        };
        let terminal = |outcome, detail: &str| {
            let mut result = TaskRunResult::new(id.clone(), outcome).with_detail(detail);
            result.agent_id = task.assigned_agent.clone();
            Some(result)
        };
        match task.status {
            TaskStatus::Completed => return terminal(TaskRunOutcome::Completed, "already completed"),
            TaskStatus::Failed => return terminal(TaskRunOutcome::Failed, "already failed"),
            TaskStatus::Cancelled => return terminal(TaskRunOutcome::Skipped, "cancelled"),
            TaskStatus::InProgress => {
                return terminal(TaskRunOutcome::Skipped, "already claimed outside this run")
            }
            TaskStatus::Pending => {}
        }

        let dependencies = self.graph.dependencies_of(id).ok()?;
        for (dep, kind) in dependencies {
            if !kind.is_blocking() {
                continue;
            }
            let dead = match results.get(&dep) {
                Some(result) => result.outcome != TaskRunOutcome::Completed,
                None => self
                    .graph
                    .get_task(&dep)
                    .map(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
                    .unwrap_or(false),
            };
            if dead {
                return Some(
                    TaskRunResult::new(id.clone(), TaskRunOutcome::Skipped)
                        .with_detail(format!("dependency {dep} did not complete")),
                );
            }
        }
        None
    }

    /// True when a pending task has a blocking dependency outside `pending`
    /// that some other run is executing.
    fn waits_on_running(&self, pending: &BTreeSet<TaskId>) -> bool {
        pending.iter().any(|id| {
            self.graph
                .dependencies_of(id)
                .map(|deps| {
                    deps.into_iter().any(|(dep, kind)| {
                        kind.is_blocking()
                            && !pending.contains(&dep)
                            && self
                                .graph
                                .get_task(&dep)
                                .is_ok_and(|t| t.status == TaskStatus::InProgress)
                    })
                })
                .unwrap_or(false)
        })
    }

    /// Claim one wave. Returns grants with their attempt counts.
    fn claim_wave(
        &self,
        runnable: &[Task],
        conflicts: &mut HashMap<TaskId, u32>,
        pending: &mut BTreeSet<TaskId>,
        results: &mut HashMap<TaskId, TaskRunResult>,
    ) -> Vec<(ResourceGrant, u32)> {
        let mut wave = Vec::new();
        let _ops = match self.lock_ops() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(error = %e, "cannot claim tasks");
                return wave;
            }
        };
        let mut idle: VecDeque<AgentId> = self.agents.idle_agents().into();
        let mut slots = self
            .config
            .max_concurrent_agents
            .saturating_sub(self.working_agents());
        let mut wave_resources: BTreeSet<String> = BTreeSet::new();

        for task in runnable {
            if slots == 0 {
                break;
            }
            let Some(agent_id) = idle.front().cloned() else {
                break;
            };
            // Wait for this wave's own holder instead of counting a conflict.
            if !task.required_resources.is_disjoint(&wave_resources) {
                continue;
            }
            match self.claim(&agent_id, &task.id) {
                Ok(grant) => {
                    idle.pop_front();
                    slots -= 1;
                    wave_resources.extend(grant.resources.iter().cloned());
                    let attempts = conflicts.get(&task.id).copied().unwrap_or(0) + 1;
                    wave.push((grant, attempts));
                }
                Err(CadenceError::ConflictDetected { resources }) => {
                    let attempts = conflicts.entry(task.id.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts > self.config.max_retry_attempts {
                        tracing::warn!(task_id = %task.id, resources = ?resources, attempts = *attempts, "giving up on conflicting task");
                        pending.remove(&task.id);
                        let mut result = TaskRunResult::new(task.id.clone(), TaskRunOutcome::Conflict)
                            .with_detail(format!("resources {resources:?} stayed held"));
                        result.attempts = *attempts;
                        results.insert(task.id.clone(), result);
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "task claim failed");
                    pending.remove(&task.id);
                    let mut result = TaskRunResult::new(task.id.clone(), TaskRunOutcome::Failed)
                        .with_detail(e.to_string());
                    result.attempts = conflicts.get(&task.id).copied().unwrap_or(0) + 1;
                    results.insert(task.id.clone(), result);
                }
            }
        }
        wave
    }

    async fn run_claimed(&self, grant: ResourceGrant, attempts: u32) -> TaskRunResult {
        let ResourceGrant {
            agent_id, task_id, ..
        } = grant;
        self.set_in_flight(&task_id, true);

        let executed = match self.graph.get_task(&task_id) {
            Ok(task) => {
                self.guard
                    .run(|| {
                        self.executor_breaker
                            .execute(|| self.executor.execute(&agent_id, &task))
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        let (succeeded, mut detail) = match executed {
            Ok(ExecutionOutcome::Succeeded) => (true, None),
            Ok(ExecutionOutcome::Failed { reason }) => (false, Some(reason)),
            Err(e) => (false, Some(e.to_string())),
        };

        self.set_in_flight(&task_id, false);
        let outcome = match self.finish(&agent_id, &task_id, succeeded) {
            Ok(outcome) => outcome,
            Err(e) => {
                detail = Some(e.to_string());
                TaskRunOutcome::Failed
            }
        };
        if outcome == TaskRunOutcome::Skipped {
            detail = Some("cancelled while running".into());
        }
        match outcome {
            TaskRunOutcome::Completed => {
                tracing::info!(task_id = %task_id, agent_id = %agent_id, "task completed")
            }
            _ => {
                tracing::warn!(task_id = %task_id, agent_id = %agent_id, outcome = ?outcome, detail = ?detail, "task did not complete")
            }
        }

        TaskRunResult {
            task_id,
            outcome,
            agent_id: Some(agent_id),
            attempts,
            detail,
        }
    }

    // ========================================================================
    // REPORTS
    // ========================================================================

    /// Current summary. Written through to storage when attached.
    pub fn get_current_progress_summary(&self) -> CadenceResult<ProgressSummary> {
        let summary = self.progress.get_current_summary()?;
        if let Some(storage) = &self.storage {
            storage.save_progress_summary(&summary)?;
        }
        Ok(summary)
    }

    /// The most recent summary saved to storage.
    pub fn last_saved_progress_summary(&self) -> CadenceResult<ProgressSummary> {
        self.storage
            .as_ref()
            .map(|s| s.get_progress_summary())
            .transpose()?
            .flatten()
            .ok_or_else(|| CadenceError::not_found(EntityType::ProgressSummary, "latest"))
    }

    pub fn analyze_progress_trend(&self) -> CadenceResult<ProgressTrend> {
        self.progress.analyze_progress_trend()
    }

    pub fn analyze_collaboration_efficiency(&self) -> CadenceResult<CollaborationEfficiency> {
        self.coordinator.analyze_collaboration_efficiency()
    }

    pub fn critical_path(&self) -> CadenceResult<CriticalPath> {
        self.graph.get_critical_path()
    }

    /// Health of every component in one report. Component failures become
    /// unhealthy entries rather than errors.
    pub async fn perform_system_health_check(&self) -> SystemHealthReport {
        let mut checks = vec![
            self.graph_health(),
            self.agent_health(),
            self.coordinator_health(),
            self.executor_health(),
            self.guard.health_check(),
        ];
        if let Some(supervisor) = &self.supervisor {
            checks.push(supervisor.health_check().await);
        }
        let report = SystemHealthReport::from_checks(checks);
        tracing::debug!(overall = ?report.overall, "system health checked");
        report
    }

    fn graph_health(&self) -> HealthCheck {
        match self.graph.stats() {
            Ok(stats) => {
                let check = if stats.failed > 0 {
                    HealthCheck::degraded("task_graph", format!("{} failed task(s)", stats.failed))
                } else {
                    HealthCheck::healthy("task_graph")
                };
                check
                    .with_metadata("tasks", stats.total_tasks.into())
                    .with_metadata("pending", stats.pending.into())
                    .with_metadata("in_progress", stats.in_progress.into())
                    .with_metadata("completed", stats.completed.into())
                    .with_metadata("edges", stats.edges.into())
            }
            Err(e) => HealthCheck::unhealthy("task_graph", e.to_string()),
        }
    }

    fn agent_health(&self) -> HealthCheck {
        let now = Utc::now();
        let agents = self.agents.all_agents();
        let stale = agents
            .iter()
            .filter(|a| a.status.is_active() && a.is_stale(self.config.stale_agent_threshold, now))
            .count();
        let errored = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Error)
            .count();

        let check = if stale + errored > 0 {
            HealthCheck::degraded(
                "agent_state_store",
                format!("{stale} stale and {errored} errored agent(s)"),
            )
        } else {
            HealthCheck::healthy("agent_state_store")
        };
        check
            .with_metadata("agents", agents.len().into())
            .with_metadata("stale", stale.into())
            .with_metadata("errored", errored.into())
    }

    fn coordinator_health(&self) -> HealthCheck {
        match self.coordinator.analyze_collaboration_efficiency() {
            Ok(efficiency) => HealthCheck::healthy("coordinator")
                .with_metadata("held_resources", efficiency.held_resources.into())
                .with_metadata("conflicts", efficiency.conflicts.into())
                .with_metadata("parallel_efficiency", efficiency.parallel_efficiency.into()),
            Err(e) => HealthCheck::unhealthy("coordinator", e.to_string()),
        }
    }

    fn executor_health(&self) -> HealthCheck {
        let stats = self.executor_breaker.stats();
        let check = match stats.state {
            CircuitState::Closed => HealthCheck::healthy("task_executor"),
            CircuitState::HalfOpen => {
                HealthCheck::degraded("task_executor", "executor breaker probing")
            }
            CircuitState::Open => HealthCheck::unhealthy("task_executor", "executor breaker open"),
        };
        check
            .with_metadata("total_calls", stats.total_calls.into())
            .with_metadata("total_failures", stats.total_failures.into())
    }

    // ========================================================================
    // WORKER OUTPUT
    // ========================================================================

    /// Apply a worker's progress report to its agent.
    ///
    /// The facade owns task assignment, so the report cannot change it: a
    /// report naming a task other than the agent's current one is stale and
    /// dropped (`Ok(None)`). Agents the store has never seen are created.
    pub fn apply_worker_report(&self, report: &ProgressReport) -> CadenceResult<Option<AgentState>> {
        let _ops = self.lock_ops()?;
        let current = match self.agents.get_agent_state(&report.agent_id) {
            Ok(agent) => agent.current_task,
            Err(CadenceError::NotFound { .. }) => return self.agents.apply_report(report).map(Some),
            Err(e) => return Err(e),
        };
        if report.current_task.is_some() && report.current_task != current {
            tracing::debug!(
                agent_id = %report.agent_id,
                reported = ?report.current_task,
                assigned = ?current,
                "dropped stale worker progress"
            );
            return Ok(None);
        }
        self.agents
            .update_agent_state(&report.agent_id, report.status, report.progress, current)
            .map(Some)
    }

    /// Apply worker progress lines and heartbeats until the output channel
    /// closes.
    pub fn spawn_output_bridge(
        self: &Arc<Self>,
        mut output: broadcast::Receiver<WorkerOutput>,
    ) -> JoinHandle<()> {
        let facade = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let line = match output.recv().await {
                    Ok(line) => line,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "output bridge lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if line.stream != OutputStream::Stdout {
                    continue;
                }
                match WorkerLine::parse(&line.line) {
                    WorkerLine::Progress(report) if report.agent_id == line.agent_id => {
                        if let Err(e) = facade.apply_worker_report(&report) {
                            tracing::warn!(agent_id = %line.agent_id, error = %e, "rejected worker progress");
                        }
                    }
                    WorkerLine::Progress(report) => {
                        tracing::warn!(
                            agent_id = %line.agent_id,
                            claimed = %report.agent_id,
                            "worker reported progress for another agent"
                        );
                    }
                    WorkerLine::Heartbeat => {
                        if let Err(e) = facade.agents.record_heartbeat(&line.agent_id) {
                            tracing::debug!(agent_id = %line.agent_id, error = %e, "heartbeat for unknown agent");
                        }
                    }
                    _ => {}
                }
            }
            tracing::debug!("output bridge closed");
        })
    }
}

fn skip_all(
    pending: &mut BTreeSet<TaskId>,
    results: &mut HashMap<TaskId, TaskRunResult>,
    detail: &str,
) {
    for id in std::mem::take(pending) {
        results.insert(
            id.clone(),
            TaskRunResult::new(id, TaskRunOutcome::Skipped).with_detail(detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ResourceGuardConfig;
    use cadence_test_utils::assertions::{assert_invalid_input, expect_conflict};
    use cadence_test_utils::fixtures::{fast_config, shared_storage, task, task_with_resources};
    use std::time::Duration;

    fn facade_with(agents: &[&str], executor: Arc<SimulatedExecutor>) -> CollaborationFacade {
        let facade = CollaborationFacade::builder(fast_config())
            .executor(executor)
            .build()
            .unwrap();
        for agent in agents {
            facade
                .register_agent(AgentId::from(*agent), format!("/work/{agent}"))
                .unwrap();
        }
        facade
    }

    fn facade(agents: &[&str]) -> CollaborationFacade {
        facade_with(agents, Arc::new(SimulatedExecutor::new(Duration::from_millis(1))))
    }

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    fn outcome_of(results: &[TaskRunResult], id: &str) -> TaskRunOutcome {
        results
            .iter()
            .find(|r| r.task_id.as_str() == id)
            .map(|r| r.outcome)
            .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = fast_config();
        config.quality_low_threshold = 90.0;
        config.quality_high_threshold = 10.0;
        assert!(CollaborationFacade::new(config).is_err());
    }

    #[test]
    fn test_auto_assign_claims_task_and_agent_together() {
        let facade = facade(&["frontend", "backend"]);
        facade
            .add_task(task_with_resources("T1", &["src/api.rs"]))
            .unwrap();

        let grant = facade.auto_assign_task(&"T1".into()).unwrap();
        // First Idle agent by id.
        assert_eq!(grant.agent_id, AgentId::from("backend"));

        let task = facade.get_task(&"T1".into()).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent, Some(AgentId::from("backend")));
        let agent = facade.get_agent_state(&"backend".into()).unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.current_task, Some(TaskId::from("T1")));
        assert_eq!(
            facade.coordinator().holds_for(&"T1".into()).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_auto_assign_blocked_task_changes_nothing() {
        let facade = facade(&["a"]);
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

        let result = facade.auto_assign_task(&"T2".into());
        assert_invalid_input(&result);
        assert_eq!(
            facade.get_agent_state(&"a".into()).unwrap().status,
            AgentStatus::Idle
        );
        assert_eq!(
            facade.get_task(&"T2".into()).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_auto_assign_without_idle_agent() {
        let facade = facade(&["a"]);
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.auto_assign_task(&"T1".into()).unwrap();

        let err = facade.auto_assign_task(&"T2".into()).unwrap_err();
        assert!(matches!(
            err,
            CadenceError::System(SystemError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_auto_assign_conflict_leaves_agent_idle() {
        let facade = facade(&["a", "b"]);
        facade.add_task(task_with_resources("T1", &["db"])).unwrap();
        facade.add_task(task_with_resources("T2", &["db"])).unwrap();
        facade.auto_assign_task(&"T1".into()).unwrap();

        let resources = expect_conflict(facade.auto_assign_task(&"T2".into()));
        assert_eq!(resources, vec!["db".to_string()]);
        assert_eq!(
            facade.get_agent_state(&"b".into()).unwrap().status,
            AgentStatus::Idle
        );
        assert_eq!(
            facade.get_task(&"T2".into()).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_cancel_releases_holds_and_frees_agent() {
        let facade = facade(&["a"]);
        facade.add_task(task_with_resources("T1", &["db"])).unwrap();
        facade.auto_assign_task(&"T1".into()).unwrap();

        let task = facade.cancel_task(&"T1".into()).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(facade.coordinator().held_resources().unwrap().is_empty());
        let agent = facade.get_agent_state(&"a".into()).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_runs_in_dependency_order() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a", "b"], executor.clone());
        for id in ["T1", "T2", "T3"] {
            facade.add_task(task(id)).unwrap();
        }
        facade.add_dependency(&"T3".into(), &"T2".into()).unwrap();
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

        let results = facade.execute_workflow(&ids(&["T3", "T2", "T1"])).await;
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.outcome == TaskRunOutcome::Completed));
        // Results keep input order, execution follows dependencies.
        assert_eq!(results[0].task_id, TaskId::from("T3"));
        assert_eq!(executor.executed(), ids(&["T1", "T2", "T3"]));

        for agent in facade.agents().all_agents() {
            assert_eq!(agent.status, AgentStatus::Idle);
        }
        assert!(facade.coordinator().held_resources().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_skips_dependents_only() {
        let executor =
            Arc::new(SimulatedExecutor::new(Duration::from_millis(1)).with_failures(["T1"]));
        let facade = facade_with(&["a", "b"], executor);
        for id in ["T1", "T2", "T3", "solo"] {
            facade.add_task(task(id)).unwrap();
        }
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();
        facade.add_dependency(&"T3".into(), &"T2".into()).unwrap();

        let results = facade
            .execute_workflow(&ids(&["T1", "T2", "T3", "solo"]))
            .await;
        assert_eq!(outcome_of(&results, "T1"), TaskRunOutcome::Failed);
        assert_eq!(outcome_of(&results, "T2"), TaskRunOutcome::Skipped);
        assert_eq!(outcome_of(&results, "T3"), TaskRunOutcome::Skipped);
        assert_eq!(outcome_of(&results, "solo"), TaskRunOutcome::Completed);
        assert_eq!(
            facade.get_task(&"T2".into()).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_dependency_does_not_gate() {
        let executor =
            Arc::new(SimulatedExecutor::new(Duration::from_millis(1)).with_failures(["T1"]));
        let facade = facade_with(&["a"], executor);
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade
            .add_dependency_with_kind(&"T2".into(), &"T1".into(), DependencyKind::Soft)
            .unwrap();

        let results = facade.execute_workflow(&ids(&["T1", "T2"])).await;
        assert_eq!(outcome_of(&results, "T2"), TaskRunOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_duplicate_ids() {
        let facade = facade(&["a"]);
        facade.add_task(task("T1")).unwrap();
        let results = facade
            .execute_workflow(&ids(&["T1", "ghost", "T1"]))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(outcome_of(&results, "T1"), TaskRunOutcome::Completed);
        assert_eq!(outcome_of(&results, "ghost"), TaskRunOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_resource_tasks_run_in_separate_waves() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a", "b", "c"], executor.clone());
        for id in ["T1", "T2", "T3"] {
            facade
                .add_task(task_with_resources(id, &["Cargo.toml"]))
                .unwrap();
        }

        let results = facade.execute_workflow(&ids(&["T1", "T2", "T3"])).await;
        assert!(results
            .iter()
            .all(|r| r.outcome == TaskRunOutcome::Completed));
        assert_eq!(executor.executed().len(), 3);
        assert_eq!(facade.coordinator().analyze_collaboration_efficiency().unwrap().conflicts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_hold_ends_in_conflict() {
        let facade = facade(&["holder", "worker"]);
        facade.add_task(task_with_resources("lock", &["db"])).unwrap();
        facade.add_task(task_with_resources("T1", &["db"])).unwrap();
        // "holder" sorts first and keeps `db` for the whole run.
        facade.auto_assign_task(&"lock".into()).unwrap();

        let results = facade.execute_workflow(&ids(&["T1"])).await;
        let result = &results[0];
        assert_eq!(result.outcome, TaskRunOutcome::Conflict);
        assert_eq!(result.attempts, fast_config().max_retry_attempts + 1);
        assert_eq!(
            facade.get_task(&"T1".into()).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_dependency_running_in_another_run() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a", "b"], executor.clone());
        facade
            .add_task(task("T1").with_estimate(Duration::from_secs(500)))
            .unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

        let first = ids(&["T1"]);
        let second = ids(&["T2"]);
        let (run1, run2) = tokio::join!(facade.execute_workflow(&first), async {
            // Let the first run claim T1 before this one looks at T2.
            tokio::task::yield_now().await;
            facade.execute_workflow(&second).await
        });
        assert_eq!(run1[0].outcome, TaskRunOutcome::Completed);
        assert_eq!(run2[0].outcome, TaskRunOutcome::Completed);
        assert_eq!(executor.executed(), ids(&["T1", "T2"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_outside_dependency_skips_after_retries() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a"], executor.clone());
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

        let results = facade.execute_workflow(&ids(&["T2"])).await;
        assert_eq!(results[0].outcome, TaskRunOutcome::Skipped);
        assert_eq!(
            results[0].detail.as_deref(),
            Some("dependencies outside this run are not complete")
        );
        assert!(executor.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_wait_on_running_dependency() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a"], executor.clone());
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();
        facade.graph().start_task(&"T1".into(), &"a".into()).unwrap();

        let started = Instant::now();
        let deadline = started + Duration::from_secs(2);
        let results = facade
            .execute_workflow_until(&ids(&["T2"]), Some(deadline))
            .await;
        assert_eq!(results[0].outcome, TaskRunOutcome::Skipped);
        assert_eq!(results[0].detail.as_deref(), Some("sprint deadline reached"));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_agents_skips_after_retries() {
        let facade = facade(&[]);
        facade.add_task(task("T1")).unwrap();
        let results = facade.execute_workflow(&ids(&["T1"])).await;
        assert_eq!(results[0].outcome, TaskRunOutcome::Skipped);
        assert_eq!(results[0].detail.as_deref(), Some("no idle agent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_starts_nothing() {
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
        let facade = facade_with(&["a"], executor.clone());
        facade.add_task(task("T1")).unwrap();
        let results = facade
            .execute_workflow_until(&ids(&["T1"]), Some(Instant::now()))
            .await;
        assert_eq!(results[0].outcome, TaskRunOutcome::Skipped);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reports_every_component() {
        let executor =
            Arc::new(SimulatedExecutor::new(Duration::from_millis(1)).with_failures(["T1"]));
        let facade = facade_with(&["a"], executor);
        let report = facade.perform_system_health_check().await;
        assert!(report.is_healthy());
        for name in [
            "task_graph",
            "agent_state_store",
            "coordinator",
            "task_executor",
            "resource_guard",
        ] {
            assert!(report.component(name).is_some(), "missing {name}");
        }

        facade.add_task(task("T1")).unwrap();
        facade.execute_workflow(&ids(&["T1"])).await;
        let report = facade.perform_system_health_check().await;
        assert_eq!(
            report.component("task_graph").unwrap().status,
            cadence_core::HealthStatus::Degraded
        );
    }

    #[test]
    fn test_progress_summary_written_through() {
        let storage = shared_storage();
        let facade = CollaborationFacade::builder(fast_config())
            .storage(storage)
            .guard(Arc::new(ResourceGuard::new(ResourceGuardConfig::default())))
            .build()
            .unwrap();
        assert!(matches!(
            facade.last_saved_progress_summary(),
            Err(CadenceError::NotFound { .. })
        ));
        facade.add_task(task("T1")).unwrap();
        let summary = facade.get_current_progress_summary().unwrap();
        assert_eq!(facade.last_saved_progress_summary().unwrap(), summary);
        assert_eq!(summary.total_tasks, 1);
    }

    #[test]
    fn test_stale_worker_report_is_dropped() {
        let facade = facade(&["backend"]);
        facade.add_task(task("T1")).unwrap();
        facade.add_task(task("T2")).unwrap();
        facade.auto_assign_task(&"T1".into()).unwrap();

        let mut report = ProgressReport {
            agent_id: "backend".into(),
            status: AgentStatus::Working,
            progress: 30.0,
            current_task: Some("T2".into()),
            message: None,
        };
        assert!(facade.apply_worker_report(&report).unwrap().is_none());

        report.current_task = None;
        let state = facade.apply_worker_report(&report).unwrap().unwrap();
        assert_eq!(state.progress, 30.0);
        assert_eq!(state.current_task, Some(TaskId::from("T1")));
    }

    #[tokio::test]
    async fn test_output_bridge_applies_progress_and_heartbeats() {
        let facade = Arc::new(facade(&["backend"]));
        let (tx, rx) = broadcast::channel(16);
        let bridge = facade.spawn_output_bridge(rx);

        let report = ProgressReport {
            agent_id: "backend".into(),
            status: AgentStatus::Working,
            progress: 40.0,
            current_task: None,
            message: None,
        };
        let line = |text: String| WorkerOutput {
            agent_id: "backend".into(),
            stream: OutputStream::Stdout,
            line: text,
            at: Utc::now(),
        };
        tx.send(line(format!(
            "__PROGRESS__:{}",
            serde_json::to_string(&report).unwrap()
        )))
        .unwrap();
        // Out-of-range progress is rejected, not clamped.
        let mut bad = report.clone();
        bad.progress = 140.0;
        tx.send(line(format!(
            "__PROGRESS__:{}",
            serde_json::to_string(&bad).unwrap()
        )))
        .unwrap();
        tx.send(line("__HEARTBEAT__".into())).unwrap();
        drop(tx);
        bridge.await.unwrap();

        let state = facade.get_agent_state(&"backend".into()).unwrap();
        assert_eq!(state.status, AgentStatus::Working);
        assert_eq!(state.progress, 40.0);
    }
}
