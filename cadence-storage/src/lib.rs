//! Cadence Storage - Persistence Boundary
//!
//! Defines the storage trait the orchestration core writes through, and an
//! in-memory implementation used by default and in tests. The core never
//! depends on a concrete schema; any store honouring these read/write
//! contracts with at least Task and AgentState durability can be plugged in.
//!
//! Logical records:
//! - tasks, keyed by task id (last write wins)
//! - dependency edges, keyed by `(task, depends_on)`
//! - agent states, keyed by agent id (last write wins)
//! - agent state history, append-only per agent
//! - progress summaries, append-only, latest is served
//! - workflow history, append-only per workflow

use cadence_core::{
    scheduling_order, AgentId, AgentState, CadenceError, CadenceResult, DependencyEdge,
    ProgressSample, ProgressSummary, Task, TaskId, TaskStatus, WorkflowHistoryEntry, WorkflowId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Storage trait for Cadence persistence.
///
/// Calls are synchronous and short; implementations backed by slow I/O
/// should buffer internally. Errors surface as `SystemError::Storage`.
pub trait StorageTrait: Send + Sync {
    // === Task Operations ===

    /// Insert or replace a task.
    fn save_task(&self, task: &Task) -> CadenceResult<()>;

    /// Get a task by ID.
    fn load_task(&self, id: &TaskId) -> CadenceResult<Option<Task>>;

    /// All stored tasks, oldest first.
    fn load_tasks(&self) -> CadenceResult<Vec<Task>>;

    /// Pending tasks whose hard dependencies are all Completed, in
    /// scheduling order.
    fn load_executable_tasks(&self) -> CadenceResult<Vec<Task>>;

    // === Dependency Operations ===

    /// Insert or replace a dependency edge.
    fn save_dependency(&self, edge: &DependencyEdge) -> CadenceResult<()>;

    /// All stored dependency edges.
    fn load_dependencies(&self) -> CadenceResult<Vec<DependencyEdge>>;

    // === Agent Operations ===

    /// Insert or replace the current state of an agent.
    fn save_agent_state(&self, state: &AgentState) -> CadenceResult<()>;

    /// All stored agent states.
    fn load_agent_states(&self) -> CadenceResult<Vec<AgentState>>;

    /// Append one accepted agent update to its history.
    fn save_agent_state_history(&self, sample: &ProgressSample) -> CadenceResult<()>;

    /// History of one agent, oldest first.
    fn load_agent_state_history(&self, agent_id: &AgentId) -> CadenceResult<Vec<ProgressSample>>;

    // === Progress Operations ===

    /// Record a computed summary.
    fn save_progress_summary(&self, summary: &ProgressSummary) -> CadenceResult<()>;

    /// The most recently recorded summary, if any.
    fn get_progress_summary(&self) -> CadenceResult<Option<ProgressSummary>>;

    // === Workflow Operations ===

    /// Append a workflow history entry.
    fn append_workflow_history(&self, entry: &WorkflowHistoryEntry) -> CadenceResult<()>;

    /// History of one workflow, in append order.
    fn load_workflow_history(&self, id: WorkflowId) -> CadenceResult<Vec<WorkflowHistoryEntry>>;
}

// ============================================================================
// IN-MEMORY STORAGE
// ============================================================================

/// In-memory storage backed by `RwLock`ed maps.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    edges: Arc<RwLock<BTreeMap<(TaskId, TaskId), DependencyEdge>>>,
    agents: Arc<RwLock<HashMap<AgentId, AgentState>>>,
    history: Arc<RwLock<HashMap<AgentId, Vec<ProgressSample>>>>,
    summaries: Arc<RwLock<Vec<ProgressSummary>>>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Vec<WorkflowHistoryEntry>>>>,
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> CadenceResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| CadenceError::lock_poisoned(format!("storage.{what}")))
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> CadenceResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| CadenceError::lock_poisoned(format!("storage.{what}")))
}

impl InMemoryStorage {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get count of stored tasks.
    pub fn task_count(&self) -> CadenceResult<usize> {
        Ok(read(&self.tasks, "tasks")?.len())
    }

    /// Get count of stored dependency edges.
    pub fn dependency_count(&self) -> CadenceResult<usize> {
        Ok(read(&self.edges, "edges")?.len())
    }

    /// Get count of history samples across all agents.
    pub fn history_count(&self) -> CadenceResult<usize> {
        Ok(read(&self.history, "history")?.values().map(Vec::len).sum())
    }

    /// Clear all stored data.
    pub fn clear(&self) -> CadenceResult<()> {
        write(&self.tasks, "tasks")?.clear();
        write(&self.edges, "edges")?.clear();
        write(&self.agents, "agents")?.clear();
        write(&self.history, "history")?.clear();
        write(&self.summaries, "summaries")?.clear();
        write(&self.workflows, "workflows")?.clear();
        Ok(())
    }
}

impl StorageTrait for InMemoryStorage {
    fn save_task(&self, task: &Task) -> CadenceResult<()> {
        write(&self.tasks, "tasks")?.insert(task.id.clone(), task.clone());
        tracing::trace!(task_id = %task.id, status = %task.status, "task saved");
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> CadenceResult<Option<Task>> {
        Ok(read(&self.tasks, "tasks")?.get(id).cloned())
    }

    fn load_tasks(&self) -> CadenceResult<Vec<Task>> {
        let mut tasks: Vec<Task> = read(&self.tasks, "tasks")?.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn load_executable_tasks(&self) -> CadenceResult<Vec<Task>> {
        let tasks = read(&self.tasks, "tasks")?;
        let edges = read(&self.edges, "edges")?;

        let blocked: HashSet<&TaskId> = edges
            .values()
            .filter(|edge| edge.kind.is_blocking())
            .filter(|edge| {
                tasks
                    .get(&edge.depends_on)
                    .map(|dep| dep.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .map(|edge| &edge.task)
            .collect();

        let mut executable: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !blocked.contains(&t.id))
            .cloned()
            .collect();
        executable.sort_by(scheduling_order);
        Ok(executable)
    }

    fn save_dependency(&self, edge: &DependencyEdge) -> CadenceResult<()> {
        write(&self.edges, "edges")?
            .insert((edge.task.clone(), edge.depends_on.clone()), edge.clone());
        Ok(())
    }

    fn load_dependencies(&self) -> CadenceResult<Vec<DependencyEdge>> {
        Ok(read(&self.edges, "edges")?.values().cloned().collect())
    }

    fn save_agent_state(&self, state: &AgentState) -> CadenceResult<()> {
        write(&self.agents, "agents")?.insert(state.agent_id.clone(), state.clone());
        Ok(())
    }

    fn load_agent_states(&self) -> CadenceResult<Vec<AgentState>> {
        let mut states: Vec<AgentState> =
            read(&self.agents, "agents")?.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(states)
    }

    fn save_agent_state_history(&self, sample: &ProgressSample) -> CadenceResult<()> {
        write(&self.history, "history")?
            .entry(sample.agent_id.clone())
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    fn load_agent_state_history(&self, agent_id: &AgentId) -> CadenceResult<Vec<ProgressSample>> {
        Ok(read(&self.history, "history")?
            .get(agent_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_progress_summary(&self, summary: &ProgressSummary) -> CadenceResult<()> {
        write(&self.summaries, "summaries")?.push(summary.clone());
        Ok(())
    }

    fn get_progress_summary(&self) -> CadenceResult<Option<ProgressSummary>> {
        Ok(read(&self.summaries, "summaries")?.last().cloned())
    }

    fn append_workflow_history(&self, entry: &WorkflowHistoryEntry) -> CadenceResult<()> {
        write(&self.workflows, "workflows")?
            .entry(entry.workflow_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn load_workflow_history(&self, id: WorkflowId) -> CadenceResult<Vec<WorkflowHistoryEntry>> {
        Ok(read(&self.workflows, "workflows")?
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
