//! The task graph and its lock discipline.

use crate::algorithms;
use cadence_core::{
    scheduling_order, AgentId, CadenceError, CadenceResult, CriticalPath, DependencyEdge,
    DependencyKind, EntityType, GraphStats, Task, TaskId, TaskStatus,
};
use cadence_storage::StorageTrait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct GraphInner {
    pub(crate) tasks: HashMap<TaskId, Task>,
    /// task -> tasks it depends on
    pub(crate) deps: HashMap<TaskId, BTreeMap<TaskId, DependencyKind>>,
    /// task -> tasks that depend on it
    pub(crate) dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    pub(crate) edge_count: usize,
}

impl GraphInner {
    fn task(&self, id: &TaskId) -> CadenceResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| CadenceError::not_found(EntityType::Task, id))
    }

    fn insert_edge(&mut self, task: &TaskId, depends_on: &TaskId, kind: DependencyKind) {
        let previous = self
            .deps
            .entry(task.clone())
            .or_default()
            .insert(depends_on.clone(), kind);
        if previous.is_none() {
            self.edge_count += 1;
        }
        self.dependents
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
    }
}

/// Tasks plus depends-on edges behind a single `RwLock`.
///
/// Structural mutations take the write lock for the whole check-then-commit
/// sequence. Queries take the read lock and may run in parallel.
pub struct TaskGraph {
    inner: RwLock<GraphInner>,
    storage: Option<Arc<dyn StorageTrait>>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("persistent", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskGraph {
    /// Create an empty graph without persistence.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            storage: None,
        }
    }

    /// Create an empty graph that writes every mutation through `storage`.
    pub fn with_storage(storage: Arc<dyn StorageTrait>) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            storage: Some(storage),
        }
    }

    /// Rebuild a graph from the tasks and edges held in `storage`.
    ///
    /// Edges are re-validated, so a store containing a cycle is rejected.
    pub fn restore(storage: Arc<dyn StorageTrait>) -> CadenceResult<Self> {
        let mut inner = GraphInner::default();
        for task in storage.load_tasks()? {
            inner.tasks.insert(task.id.clone(), task);
        }
        for edge in storage.load_dependencies()? {
            inner.task(&edge.task)?;
            inner.task(&edge.depends_on)?;
            if let Some(cycle) = cycle_if_added(&inner, &edge.task, &edge.depends_on) {
                return Err(CadenceError::CircularDependency { cycle });
            }
            inner.insert_edge(&edge.task, &edge.depends_on, edge.kind);
        }
        tracing::info!(
            tasks = inner.tasks.len(),
            edges = inner.edge_count,
            "task graph restored from storage"
        );
        Ok(Self {
            inner: RwLock::new(inner),
            storage: Some(storage),
        })
    }

    fn read(&self) -> CadenceResult<RwLockReadGuard<'_, GraphInner>> {
        self.inner
            .read()
            .map_err(|_| CadenceError::lock_poisoned("task_graph"))
    }

    fn write(&self) -> CadenceResult<RwLockWriteGuard<'_, GraphInner>> {
        self.inner
            .write()
            .map_err(|_| CadenceError::lock_poisoned("task_graph"))
    }

    fn persist_task(&self, task: &Task) -> CadenceResult<()> {
        match &self.storage {
            Some(storage) => storage.save_task(task),
            None => Ok(()),
        }
    }

    // ========================================================================
    // STRUCTURAL MUTATIONS
    // ========================================================================

    /// Add a new task. Ids must be unique.
    pub fn add_task(&self, task: Task) -> CadenceResult<()> {
        task.validate()?;
        let mut inner = self.write()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(CadenceError::invalid_input(
                "task.id",
                format!("task {} already exists", task.id),
            ));
        }
        self.persist_task(&task)?;
        tracing::debug!(task_id = %task.id, priority = %task.priority, "task added");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add a hard dependency: `task` cannot run until `depends_on` is Completed.
    pub fn add_dependency(&self, task: &TaskId, depends_on: &TaskId) -> CadenceResult<()> {
        self.add_dependency_with_kind(task, depends_on, DependencyKind::Hard)
    }

    /// Add a dependency edge of the given kind.
    ///
    /// Fails with `CircularDependency` if `depends_on` already (transitively)
    /// depends on `task`; the reported cycle starts at `task` and follows
    /// depends-on edges. Re-adding an existing edge replaces its kind.
    pub fn add_dependency_with_kind(
        &self,
        task: &TaskId,
        depends_on: &TaskId,
        kind: DependencyKind,
    ) -> CadenceResult<()> {
        let mut inner = self.write()?;
        inner.task(task)?;
        inner.task(depends_on)?;

        if let Some(cycle) = cycle_if_added(&inner, task, depends_on) {
            tracing::warn!(
                task_id = %task,
                depends_on = %depends_on,
                cycle = ?cycle,
                "dependency rejected: would create a cycle"
            );
            return Err(CadenceError::CircularDependency { cycle });
        }

        if let Some(storage) = &self.storage {
            storage.save_dependency(&DependencyEdge {
                task: task.clone(),
                depends_on: depends_on.clone(),
                kind,
            })?;
        }
        inner.insert_edge(task, depends_on, kind);
        tracing::debug!(task_id = %task, depends_on = %depends_on, kind = %kind, "dependency added");
        Ok(())
    }

    /// Apply `change` to a copy of the task, persist it, then commit.
    fn mutate<F>(&self, id: &TaskId, change: F) -> CadenceResult<Task>
    where
        F: FnOnce(&GraphInner, &mut Task) -> CadenceResult<()>,
    {
        let mut inner = self.write()?;
        let mut task = inner.task(id)?.clone();
        change(&*inner, &mut task)?;
        self.persist_task(&task)?;
        inner.tasks.insert(id.clone(), task.clone());
        Ok(task)
    }

    /// Move a task to `status` following the status table.
    pub fn update_status(&self, id: &TaskId, status: TaskStatus) -> CadenceResult<Task> {
        let task = self.mutate(id, |_, task| task.transition_to(status))?;
        tracing::debug!(task_id = %id, status = %status, "task status updated");
        Ok(task)
    }

    /// Set or clear the assigned agent without touching status.
    pub fn assign(&self, id: &TaskId, agent: Option<AgentId>) -> CadenceResult<Task> {
        self.mutate(id, |_, task| {
            task.assigned_agent = agent;
            task.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    /// Claim an executable task for `agent`: Pending -> InProgress.
    ///
    /// Fails with `InvalidInput` while any hard dependency is not Completed.
    pub fn start_task(&self, id: &TaskId, agent: &AgentId) -> CadenceResult<Task> {
        let task = self.mutate(id, |inner, task| {
            let blocking = algorithms::unsatisfied_dependencies(inner, id);
            if !blocking.is_empty() {
                return Err(CadenceError::invalid_input(
                    "task.status",
                    format!("task {id} is blocked by {blocking:?}"),
                ));
            }
            task.transition_to(TaskStatus::InProgress)?;
            task.assigned_agent = Some(agent.clone());
            Ok(())
        })?;
        tracing::debug!(task_id = %id, agent_id = %agent, "task started");
        Ok(task)
    }

    /// InProgress -> Completed. `actual` overrides the measured duration.
    pub fn complete_task(&self, id: &TaskId, actual: Option<Duration>) -> CadenceResult<Task> {
        self.mutate(id, |_, task| {
            if actual.is_some() {
                task.actual_duration = actual;
            }
            task.transition_to(TaskStatus::Completed)
        })
    }

    /// InProgress -> Failed.
    pub fn fail_task(&self, id: &TaskId) -> CadenceResult<Task> {
        self.mutate(id, |_, task| task.transition_to(TaskStatus::Failed))
    }

    /// Any status -> Cancelled. Idempotent.
    pub fn cancel_task(&self, id: &TaskId) -> CadenceResult<Task> {
        self.mutate(id, |_, task| task.transition_to(TaskStatus::Cancelled))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_task(&self, id: &TaskId) -> CadenceResult<Task> {
        Ok(self.read()?.task(id)?.clone())
    }

    pub fn contains(&self, id: &TaskId) -> CadenceResult<bool> {
        Ok(self.read()?.tasks.contains_key(id))
    }

    /// Every task, oldest first.
    pub fn all_tasks(&self) -> CadenceResult<Vec<Task>> {
        let inner = self.read()?;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub fn task_count(&self) -> CadenceResult<usize> {
        Ok(self.read()?.tasks.len())
    }

    pub fn edge_count(&self) -> CadenceResult<usize> {
        Ok(self.read()?.edge_count)
    }

    /// Pending tasks whose hard dependencies are all Completed, by priority
    /// descending then creation time ascending.
    pub fn get_executable_tasks(&self) -> CadenceResult<Vec<Task>> {
        let inner = self.read()?;
        let mut ready: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| algorithms::is_executable(&inner, &t.id))
            .cloned()
            .collect();
        ready.sort_by(scheduling_order);
        Ok(ready)
    }

    pub fn is_executable(&self, id: &TaskId) -> CadenceResult<bool> {
        let inner = self.read()?;
        inner.task(id)?;
        Ok(algorithms::is_executable(&inner, id))
    }

    /// Pending tasks held back by at least one unfinished hard dependency.
    pub fn blocked_tasks(&self) -> CadenceResult<Vec<TaskId>> {
        let inner = self.read()?;
        let mut blocked: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| !algorithms::unsatisfied_dependencies(&inner, &t.id).is_empty())
            .map(|t| t.id.clone())
            .collect();
        blocked.sort();
        Ok(blocked)
    }

    /// Hard dependencies of `id` that are not yet Completed.
    pub fn unsatisfied_dependencies(&self, id: &TaskId) -> CadenceResult<Vec<TaskId>> {
        let inner = self.read()?;
        inner.task(id)?;
        Ok(algorithms::unsatisfied_dependencies(&inner, id))
    }

    /// Direct dependencies of `id` with their kinds.
    pub fn dependencies_of(&self, id: &TaskId) -> CadenceResult<Vec<(TaskId, DependencyKind)>> {
        let inner = self.read()?;
        inner.task(id)?;
        Ok(inner
            .deps
            .get(id)
            .map(|deps| deps.iter().map(|(d, k)| (d.clone(), *k)).collect())
            .unwrap_or_default())
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> CadenceResult<Vec<TaskId>> {
        let inner = self.read()?;
        inner.task(id)?;
        Ok(inner
            .dependents
            .get(id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Every task that transitively depends on `id`, nearest first.
    pub fn transitive_dependents(&self, id: &TaskId) -> CadenceResult<Vec<TaskId>> {
        let inner = self.read()?;
        inner.task(id)?;
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = inner.dependents.get(&current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        out.push(dependent.clone());
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Every edge, sorted by `(task, depends_on)`.
    pub fn edges(&self) -> CadenceResult<Vec<DependencyEdge>> {
        let inner = self.read()?;
        let mut edges: Vec<DependencyEdge> = inner
            .deps
            .iter()
            .flat_map(|(task, deps)| {
                deps.iter().map(move |(dep, kind)| DependencyEdge {
                    task: task.clone(),
                    depends_on: dep.clone(),
                    kind: *kind,
                })
            })
            .collect();
        edges.sort_by(|a, b| (&a.task, &a.depends_on).cmp(&(&b.task, &b.depends_on)));
        Ok(edges)
    }

    /// Task ids with every dependency before its dependents.
    pub fn topological_order(&self) -> CadenceResult<Vec<TaskId>> {
        algorithms::topological_order(&*self.read()?)
    }

    /// The dependency chain with the largest summed estimate. Ties prefer the
    /// chain with more tasks. Empty graph gives an empty path.
    pub fn get_critical_path(&self) -> CadenceResult<CriticalPath> {
        algorithms::critical_path(&*self.read()?)
    }

    pub fn stats(&self) -> CadenceResult<GraphStats> {
        let inner = self.read()?;
        let mut stats = GraphStats {
            total_tasks: inner.tasks.len(),
            edges: inner.edge_count,
            hard_edges: inner
                .deps
                .values()
                .flat_map(|d| d.values())
                .filter(|k| k.is_blocking())
                .count(),
            ..GraphStats::default()
        };
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}

/// The cycle `task -> depends_on -> ... -> task` that adding the edge would
/// close, listed from `task` without repeating it.
fn cycle_if_added(inner: &GraphInner, task: &TaskId, depends_on: &TaskId) -> Option<Vec<String>> {
    if task == depends_on {
        return Some(vec![task.to_string()]);
    }
    let path = algorithms::find_path(inner, depends_on, task)?;
    let mut cycle = Vec::with_capacity(path.len());
    cycle.push(task.to_string());
    cycle.extend(path[..path.len() - 1].iter().map(|id| id.to_string()));
    Some(cycle)
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
