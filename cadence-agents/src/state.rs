//! Current agent state and progress history.

use cadence_core::{
    validate_progress, AgentId, AgentState, AgentStatus, CadenceError, CadenceResult,
    EntityType, ProgressReport, ProgressSample, TaskId, Timestamp,
};
use cadence_storage::StorageTrait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-agent liveness and progress records.
///
/// Writes are validated before anything is stored; a rejected write leaves
/// the previous record untouched. Lock order is always `agents` then
/// `history`.
pub struct AgentStateStore {
    agents: DashMap<AgentId, AgentState>,
    history: DashMap<AgentId, VecDeque<ProgressSample>>,
    history_limit: usize,
    storage: Option<Arc<dyn StorageTrait>>,
}

impl std::fmt::Debug for AgentStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStateStore")
            .field("agents", &self.agents.len())
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

impl AgentStateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            agents: DashMap::new(),
            history: DashMap::new(),
            history_limit: history_limit.max(1),
            storage: None,
        }
    }

    pub fn with_storage(history_limit: usize, storage: Arc<dyn StorageTrait>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new(history_limit)
        }
    }

    fn persist(&self, state: &AgentState, sample: Option<&ProgressSample>) -> CadenceResult<()> {
        if let Some(storage) = &self.storage {
            storage.save_agent_state(state)?;
            if let Some(sample) = sample {
                storage.save_agent_state_history(sample)?;
            }
        }
        Ok(())
    }

    /// Apply `change` to a copy of the record (a fresh Idle record for an
    /// unknown agent), persist it, then commit. Nothing is stored if
    /// persistence fails.
    fn upsert<F>(
        &self,
        agent_id: &AgentId,
        change: F,
        record_sample: bool,
    ) -> CadenceResult<AgentState>
    where
        F: FnOnce(&mut AgentState),
    {
        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let mut next = occupied.get().clone();
                change(&mut next);
                let sample = record_sample.then(|| ProgressSample::from(&next));
                self.persist(&next, sample.as_ref())?;
                occupied.insert(next.clone());
                if let Some(sample) = sample {
                    self.push_history(sample);
                }
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                let mut next = AgentState::new(agent_id.clone(), PathBuf::new());
                change(&mut next);
                let sample = record_sample.then(|| ProgressSample::from(&next));
                self.persist(&next, sample.as_ref())?;
                vacant.insert(next.clone());
                if let Some(sample) = sample {
                    self.push_history(sample);
                }
                Ok(next)
            }
        }
    }

    fn push_history(&self, sample: ProgressSample) {
        let mut history = self.history.entry(sample.agent_id.clone()).or_default();
        history.push_back(sample);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Register an agent with its working directory. Re-registering keeps
    /// status and progress and updates the directory.
    pub fn register_agent(
        &self,
        agent_id: AgentId,
        working_directory: impl Into<PathBuf>,
    ) -> CadenceResult<AgentState> {
        if agent_id.as_str().trim().is_empty() {
            return Err(CadenceError::invalid_input("agent_id", "must not be empty"));
        }
        let working_directory = working_directory.into();
        let next = self.upsert(
            &agent_id,
            |state| {
                state.working_directory = working_directory;
                state.last_update = Utc::now();
            },
            false,
        )?;
        tracing::debug!(agent_id = %agent_id, "agent registered");
        Ok(next)
    }

    /// Replace status, progress and current task in one step.
    ///
    /// Progress outside `[0, 100]` fails with `InvalidInput` and nothing is
    /// written. Unknown agents are created on first observation.
    pub fn update_agent_state(
        &self,
        agent_id: &AgentId,
        status: AgentStatus,
        progress: f64,
        current_task: Option<TaskId>,
    ) -> CadenceResult<AgentState> {
        validate_progress(progress)?;

        let next = self.upsert(
            agent_id,
            |state| {
                state.status = status;
                state.progress = progress;
                state.current_task = current_task;
                state.last_update = Utc::now();
            },
            true,
        )?;

        tracing::trace!(
            agent_id = %agent_id,
            status = %status,
            progress,
            "agent state updated"
        );
        Ok(next)
    }

    /// Apply a progress line reported by a worker.
    pub fn apply_report(&self, report: &ProgressReport) -> CadenceResult<AgentState> {
        self.update_agent_state(
            &report.agent_id,
            report.status,
            report.progress,
            report.current_task.clone(),
        )
    }

    /// Refresh `last_update` without recording a history sample.
    pub fn record_heartbeat(&self, agent_id: &AgentId) -> CadenceResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CadenceError::not_found(EntityType::Agent, agent_id))?;
        entry.last_update = Utc::now();
        Ok(())
    }

    pub fn set_process_id(&self, agent_id: &AgentId, process_id: Option<u32>) -> CadenceResult<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CadenceError::not_found(EntityType::Agent, agent_id))?;
        let mut next = entry.clone();
        next.process_id = process_id;
        self.persist(&next, None)?;
        *entry = next;
        Ok(())
    }

    pub fn get_agent_state(&self, agent_id: &AgentId) -> CadenceResult<AgentState> {
        self.agents
            .get(agent_id)
            .map(|s| s.clone())
            .ok_or_else(|| CadenceError::not_found(EntityType::Agent, agent_id))
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Every agent, sorted by id.
    pub fn all_agents(&self) -> Vec<AgentState> {
        let mut agents: Vec<AgentState> = self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Ids of Idle agents, sorted.
    pub fn idle_agents(&self) -> Vec<AgentId> {
        let mut idle: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|e| e.status.can_accept_work())
            .map(|e| e.key().clone())
            .collect();
        idle.sort();
        idle
    }

    /// Agents whose last update is older than `threshold` at `now`.
    pub fn stale_agents(&self, threshold: Duration, now: Timestamp) -> Vec<AgentId> {
        let mut stale: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|e| e.is_stale(threshold, now))
            .map(|e| e.key().clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn is_stale(&self, agent_id: &AgentId, threshold: Duration) -> CadenceResult<bool> {
        Ok(self
            .get_agent_state(agent_id)?
            .is_stale(threshold, Utc::now()))
    }

    /// History of one agent, oldest first. Reserved for trend analysis.
    pub(crate) fn history(&self, agent_id: &AgentId) -> Vec<ProgressSample> {
        self.history
            .get(agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_storage::InMemoryStorage;
    use cadence_test_utils::assertions::*;

    fn agent(s: &str) -> AgentId {
        AgentId::from(s)
    }

    #[test]
    fn test_first_update_creates_agent() {
        let store = AgentStateStore::new(10);
        let state = store
            .update_agent_state(&agent("backend"), AgentStatus::Working, 25.0, None)
            .unwrap();
        assert_eq!(state.progress, 25.0);
        assert_eq!(store.agent_count(), 1);
        assert_eq!(store.history(&agent("backend")).len(), 1);
    }

    #[test]
    fn test_out_of_range_progress_leaves_state_unchanged() {
        let store = AgentStateStore::new(10);
        let before = store
            .update_agent_state(&agent("qa"), AgentStatus::Working, 40.0, Some("T1".into()))
            .unwrap();
        assert_invalid_input(&store.update_agent_state(
            &agent("qa"),
            AgentStatus::Error,
            140.0,
            None,
        ));
        assert_eq!(store.get_agent_state(&agent("qa")).unwrap(), before);
        assert_eq!(store.history(&agent("qa")).len(), 1);
    }

    #[test]
    fn test_rejected_first_write_creates_nothing() {
        let store = AgentStateStore::new(10);
        assert_invalid_input(&store.update_agent_state(
            &agent("ghost"),
            AgentStatus::Working,
            -1.0,
            None,
        ));
        assert!(!store.contains(&agent("ghost")));
    }

    #[test]
    fn test_history_is_capped() {
        let store = AgentStateStore::new(3);
        for p in [10.0, 20.0, 30.0, 40.0, 50.0] {
            store
                .update_agent_state(&agent("a"), AgentStatus::Working, p, None)
                .unwrap();
        }
        let history = store.history(&agent("a"));
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].progress, 30.0);
        assert_eq!(history[2].progress, 50.0);
    }

    #[test]
    fn test_register_keeps_progress() {
        let store = AgentStateStore::new(10);
        store
            .update_agent_state(&agent("a"), AgentStatus::Working, 60.0, None)
            .unwrap();
        let state = store.register_agent(agent("a"), "/srv/a").unwrap();
        assert_eq!(state.progress, 60.0);
        assert_eq!(state.working_directory, PathBuf::from("/srv/a"));
    }

    #[test]
    fn test_idle_and_stale_queries() {
        let store = AgentStateStore::new(10);
        store.register_agent(agent("b"), "/b").unwrap();
        store.register_agent(agent("a"), "/a").unwrap();
        store
            .update_agent_state(&agent("c"), AgentStatus::Working, 5.0, None)
            .unwrap();
        assert_eq!(store.idle_agents(), vec![agent("a"), agent("b")]);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.stale_agents(Duration::from_secs(60), later).len(), 3);
        assert!(store.stale_agents(Duration::from_secs(60), Utc::now()).is_empty());
    }

    #[test]
    fn test_set_process_id_unknown_agent() {
        let store = AgentStateStore::new(10);
        assert_not_found(&store.set_process_id(&agent("x"), Some(1)), EntityType::Agent);
    }

    #[test]
    fn test_updates_are_persisted() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = AgentStateStore::with_storage(10, storage.clone());
        store.register_agent(agent("a"), "/a").unwrap();
        store
            .update_agent_state(&agent("a"), AgentStatus::Working, 10.0, None)
            .unwrap();
        store
            .update_agent_state(&agent("a"), AgentStatus::Working, 20.0, None)
            .unwrap();
        assert_eq!(storage.load_agent_state_history(&agent("a")).unwrap().len(), 2);
        assert_eq!(storage.load_agent_states().unwrap()[0].progress, 20.0);
    }
}
