//! Conflict-aware resource coordination.
//!
//! A task runs holding a named resource set. Holds are all-or-nothing: a
//! request that overlaps any held resource is refused as a whole and nothing
//! is granted.

use crate::AgentStateStore;
use cadence_core::{
    AgentId, AgentStatus, CadenceError, CadenceResult, CollaborationEfficiency, ResourceConflict,
    ResourceRequest, TaskId, Timestamp,
};
use cadence_graph::TaskGraph;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// TYPES
// ============================================================================

/// Who holds a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHolder {
    pub agent_id: AgentId,
    pub task_id: TaskId,
}

/// A successful all-or-nothing acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub resources: BTreeSet<String>,
    pub granted_at: Timestamp,
}

#[derive(Debug, Default)]
struct HoldTable {
    by_resource: HashMap<String, ResourceHolder>,
    by_task: HashMap<TaskId, BTreeSet<String>>,
}

impl HoldTable {
    fn remove_task(&mut self, task_id: &TaskId) -> Vec<String> {
        let Some(resources) = self.by_task.remove(task_id) else {
            return Vec::new();
        };
        for resource in &resources {
            self.by_resource.remove(resource);
        }
        resources.into_iter().collect()
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Grants and revokes resource holds for task execution.
///
/// Only the coordinator mutates holds. The hold table has its own lock and
/// is never held while calling into the graph or the agent store.
#[derive(Debug)]
pub struct Coordinator {
    graph: Arc<TaskGraph>,
    agents: Arc<AgentStateStore>,
    holds: Mutex<HoldTable>,
    grants: AtomicU64,
    conflicts: AtomicU64,
}

impl Coordinator {
    pub fn new(graph: Arc<TaskGraph>, agents: Arc<AgentStateStore>) -> Self {
        Self {
            graph,
            agents,
            holds: Mutex::new(HoldTable::default()),
            grants: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> CadenceResult<MutexGuard<'_, HoldTable>> {
        self.holds
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("coordinator holds"))
    }

    /// Acquire `resources` for `task_id` on behalf of `agent_id`.
    ///
    /// Fails with `ConflictDetected` listing every overlapping name (sorted)
    /// when any requested resource is held by another task. A task may hold
    /// at most one grant at a time. An empty resource set is granted
    /// trivially and holds nothing.
    pub fn request_task_execution(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        resources: &BTreeSet<String>,
    ) -> CadenceResult<ResourceGrant> {
        if resources.iter().any(|r| r.trim().is_empty()) {
            return Err(CadenceError::invalid_input(
                "resources",
                "resource names must not be empty",
            ));
        }
        self.agents.get_agent_state(agent_id)?;

        // Status is read under the hold lock so a cancel followed by a
        // release cannot slip between the check and the insert.
        let mut holds = self.lock()?;
        let task = self.graph.get_task(task_id)?;
        if task.is_terminal() {
            return Err(CadenceError::invalid_input(
                "task_id",
                format!("task {task_id} is already {}", task.status),
            ));
        }
        if holds.by_task.contains_key(task_id) {
            return Err(CadenceError::invalid_input(
                "task_id",
                format!("task {task_id} already holds resources"),
            ));
        }

        let overlapping: Vec<String> = resources
            .iter()
            .filter(|r| holds.by_resource.contains_key(r.as_str()))
            .cloned()
            .collect();
        if !overlapping.is_empty() {
            drop(holds);
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                agent_id = %agent_id,
                task_id = %task_id,
                resources = ?overlapping,
                "resource conflict"
            );
            return Err(CadenceError::ConflictDetected {
                resources: overlapping,
            });
        }

        let holder = ResourceHolder {
            agent_id: agent_id.clone(),
            task_id: task_id.clone(),
        };
        for resource in resources {
            holds.by_resource.insert(resource.clone(), holder.clone());
        }
        if !resources.is_empty() {
            holds.by_task.insert(task_id.clone(), resources.clone());
        }
        drop(holds);

        self.grants.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(agent_id = %agent_id, task_id = %task_id, count = resources.len(), "resources granted");
        Ok(ResourceGrant {
            agent_id: agent_id.clone(),
            task_id: task_id.clone(),
            resources: resources.clone(),
            granted_at: Utc::now(),
        })
    }

    /// Release the holds of one task. Returns what was released (sorted).
    pub fn release(&self, task_id: &TaskId) -> CadenceResult<Vec<String>> {
        let released = self.lock()?.remove_task(task_id);
        if !released.is_empty() {
            tracing::debug!(task_id = %task_id, count = released.len(), "resources released");
        }
        Ok(released)
    }

    /// Release every hold taken on behalf of `agent_id`.
    pub fn release_agent(&self, agent_id: &AgentId) -> CadenceResult<Vec<String>> {
        let mut holds = self.lock()?;
        let tasks: BTreeSet<TaskId> = holds
            .by_resource
            .values()
            .filter(|h| &h.agent_id == agent_id)
            .map(|h| h.task_id.clone())
            .collect();
        let mut released: Vec<String> = tasks
            .iter()
            .flat_map(|t| holds.remove_task(t))
            .collect();
        released.sort();
        Ok(released)
    }

    /// Drop every hold. Returns how many resources were released.
    pub fn release_all(&self) -> CadenceResult<usize> {
        let mut holds = self.lock()?;
        let count = holds.by_resource.len();
        holds.by_resource.clear();
        holds.by_task.clear();
        if count > 0 {
            tracing::info!(count, "all resource holds released");
        }
        Ok(count)
    }

    /// Release holds whose task has reached a terminal status or no longer
    /// exists. Returns the tasks swept.
    pub fn release_terminal(&self) -> CadenceResult<Vec<TaskId>> {
        let holding: Vec<TaskId> = self.lock()?.by_task.keys().cloned().collect();
        let mut finished = Vec::new();
        for task_id in holding {
            let done = match self.graph.get_task(&task_id) {
                Ok(task) => task.is_terminal(),
                Err(CadenceError::NotFound { .. }) => true,
                Err(e) => return Err(e),
            };
            if done {
                finished.push(task_id);
            }
        }
        let mut holds = self.lock()?;
        for task_id in &finished {
            holds.remove_task(task_id);
        }
        finished.sort();
        Ok(finished)
    }

    /// Current holds, by resource name.
    pub fn held_resources(&self) -> CadenceResult<BTreeMap<String, ResourceHolder>> {
        Ok(self
            .lock()?
            .by_resource
            .iter()
            .map(|(r, h)| (r.clone(), h.clone()))
            .collect())
    }

    pub fn holds_for(&self, task_id: &TaskId) -> CadenceResult<BTreeSet<String>> {
        Ok(self.lock()?.by_task.get(task_id).cloned().unwrap_or_default())
    }

    /// Agent concurrency and resource usage. Every ratio is in `[0, 1]`.
    pub fn analyze_collaboration_efficiency(&self) -> CadenceResult<CollaborationEfficiency> {
        let agents = self.agents.all_agents();
        let total_agents = agents.len();
        let working_agents = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count();
        let parallel_efficiency = ratio(working_agents, total_agents);

        let held: BTreeSet<String> = self.lock()?.by_resource.keys().cloned().collect();
        let mut demanded: BTreeSet<String> = self
            .graph
            .all_tasks()?
            .into_iter()
            .filter(|t| !t.is_terminal())
            .flat_map(|t| t.required_resources)
            .collect();
        demanded.extend(held.iter().cloned());

        Ok(CollaborationEfficiency {
            total_agents,
            working_agents,
            parallel_efficiency,
            resource_utilization: ratio(held.len(), demanded.len()),
            held_resources: held.len(),
            grants: self.grants.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            analyzed_at: Utc::now(),
        })
    }

    /// Every conflict among a batch of requests made at the same moment.
    ///
    /// Resources wanted by two or more requests are grouped by the exact set
    /// of requesters, so each returned conflict names the resources one group
    /// of requests is fighting over.
    pub fn detect_conflicts(requests: &[ResourceRequest]) -> Vec<ResourceConflict> {
        let mut wanted_by: BTreeMap<&str, BTreeSet<(AgentId, TaskId)>> = BTreeMap::new();
        for request in requests {
            for resource in &request.resources {
                wanted_by
                    .entry(resource.as_str())
                    .or_default()
                    .insert((request.agent_id.clone(), request.task_id.clone()));
            }
        }

        let mut groups: BTreeMap<Vec<(AgentId, TaskId)>, Vec<String>> = BTreeMap::new();
        for (resource, requesters) in wanted_by {
            if requesters.len() > 1 {
                groups
                    .entry(requesters.into_iter().collect())
                    .or_default()
                    .push(resource.to_string());
            }
        }

        groups
            .into_iter()
            .map(|(requesters, resources)| ResourceConflict {
                resources,
                requesters,
            })
            .collect()
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::TaskStatus;
    use cadence_test_utils::assertions::{assert_invalid_input, expect_conflict};
    use cadence_test_utils::fixtures::task_with_resources;
    use std::sync::Barrier;
    use std::thread;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<TaskGraph>, Arc<AgentStateStore>, Coordinator) {
        let graph = Arc::new(TaskGraph::new());
        let agents = Arc::new(AgentStateStore::new(10));
        graph.add_task(task_with_resources("T1", &["a", "b"])).unwrap();
        graph.add_task(task_with_resources("T2", &["b", "c"])).unwrap();
        graph.add_task(task_with_resources("T3", &["d"])).unwrap();
        for agent in ["alpha", "beta"] {
            agents.register_agent(AgentId::from(agent), "/work").unwrap();
        }
        let coordinator = Coordinator::new(graph.clone(), agents.clone());
        (graph, agents, coordinator)
    }

    #[test]
    fn test_overlap_is_refused_whole() {
        let (_, _, coordinator) = setup();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a", "b"]))
            .unwrap();
        let overlapping = expect_conflict(coordinator.request_task_execution(
            &"beta".into(),
            &"T2".into(),
            &set(&["b", "c"]),
        ));
        assert_eq!(overlapping, vec!["b".to_string()]);
        let held = coordinator.held_resources().unwrap();
        assert!(!held.contains_key("c"));
        assert_eq!(held["b"].task_id, TaskId::from("T1"));
    }

    #[test]
    fn test_release_makes_resources_available() {
        let (_, _, coordinator) = setup();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a", "b"]))
            .unwrap();
        assert_eq!(
            coordinator.release(&"T1".into()).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        coordinator
            .request_task_execution(&"beta".into(), &"T2".into(), &set(&["b", "c"]))
            .unwrap();
    }

    #[test]
    fn test_terminal_tasks_are_swept() {
        let (graph, _, coordinator) = setup();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a"]))
            .unwrap();
        coordinator
            .request_task_execution(&"beta".into(), &"T3".into(), &set(&["d"]))
            .unwrap();
        graph.update_status(&"T1".into(), TaskStatus::Cancelled).unwrap();
        assert_eq!(
            coordinator.release_terminal().unwrap(),
            vec![TaskId::from("T1")]
        );
        let held = coordinator.held_resources().unwrap();
        assert_eq!(held.keys().collect::<Vec<_>>(), vec!["d"]);
    }

    #[test]
    fn test_release_agent_and_all() {
        let (_, _, coordinator) = setup();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a"]))
            .unwrap();
        coordinator
            .request_task_execution(&"beta".into(), &"T3".into(), &set(&["d"]))
            .unwrap();
        assert_eq!(
            coordinator.release_agent(&"alpha".into()).unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(coordinator.release_all().unwrap(), 1);
        assert!(coordinator.held_resources().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unknown_and_finished() {
        let (graph, _, coordinator) = setup();
        assert!(matches!(
            coordinator.request_task_execution(&"ghost".into(), &"T1".into(), &set(&["a"])),
            Err(CadenceError::NotFound { .. })
        ));
        assert!(matches!(
            coordinator.request_task_execution(&"alpha".into(), &"T9".into(), &set(&["a"])),
            Err(CadenceError::NotFound { .. })
        ));
        graph.update_status(&"T3".into(), TaskStatus::Cancelled).unwrap();
        assert_invalid_input(&coordinator.request_task_execution(
            &"alpha".into(),
            &"T3".into(),
            &set(&["d"]),
        ));
        assert_invalid_input(&coordinator.request_task_execution(
            &"alpha".into(),
            &"T1".into(),
            &set(&[" "]),
        ));
    }

    #[test]
    fn test_second_grant_for_same_task_rejected() {
        let (_, _, coordinator) = setup();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a"]))
            .unwrap();
        assert_invalid_input(&coordinator.request_task_execution(
            &"alpha".into(),
            &"T1".into(),
            &set(&["z"]),
        ));
    }

    #[test]
    fn test_efficiency_ratios() {
        let (_, agents, coordinator) = setup();
        let empty = coordinator.analyze_collaboration_efficiency().unwrap();
        assert_eq!(empty.total_agents, 2);
        assert_eq!(empty.parallel_efficiency, 0.0);
        assert_eq!(empty.resource_utilization, 0.0);

        agents
            .update_agent_state(&"alpha".into(), AgentStatus::Working, 10.0, Some("T1".into()))
            .unwrap();
        coordinator
            .request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a", "b"]))
            .unwrap();
        let report = coordinator.analyze_collaboration_efficiency().unwrap();
        assert_eq!(report.working_agents, 1);
        assert_eq!(report.parallel_efficiency, 0.5);
        // a, b held out of a, b, c, d demanded
        assert_eq!(report.resource_utilization, 0.5);
        assert_eq!(report.grants, 1);
    }

    #[test]
    fn test_detect_conflicts_groups_by_requesters() {
        let request = |agent: &str, task: &str, res: &[&str]| ResourceRequest {
            agent_id: agent.into(),
            task_id: task.into(),
            resources: set(res),
        };
        let conflicts = Coordinator::detect_conflicts(&[
            request("alpha", "T1", &["a", "b", "x"]),
            request("beta", "T2", &["a", "b"]),
            request("gamma", "T3", &["x", "y"]),
        ]);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].resources, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(conflicts[1].resources, vec!["x".to_string()]);
        assert!(Coordinator::detect_conflicts(&[request("alpha", "T1", &["a"])]).is_empty());
    }

    #[test]
    fn test_concurrent_overlapping_requests_one_winner() {
        for _ in 0..20 {
            let (_, _, coordinator) = setup();
            let coordinator = Arc::new(coordinator);
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [("alpha", "T1", ["a", "b"]), ("beta", "T2", ["b", "c"])]
                .into_iter()
                .map(|(agent, task, res)| {
                    let coordinator = coordinator.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        coordinator.request_task_execution(
                            &agent.into(),
                            &task.into(),
                            &set(&res),
                        )
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1);
            let loser = results.into_iter().find(|r| r.is_err()).unwrap();
            assert_eq!(expect_conflict(loser), vec!["b".to_string()]);

            let held = coordinator.held_resources().unwrap();
            assert_eq!(held.len(), 2);
            let owners: BTreeSet<_> = held.values().map(|h| h.task_id.clone()).collect();
            assert_eq!(owners.len(), 1);
        }
    }

    #[test]
    fn test_cancel_racing_a_request_leaves_no_holds() {
        for _ in 0..50 {
            let (graph, _, coordinator) = setup();
            let coordinator = Arc::new(coordinator);
            let barrier = Arc::new(Barrier::new(2));

            let requester = {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.request_task_execution(&"alpha".into(), &"T1".into(), &set(&["a"]))
                })
            };
            let canceller = {
                let coordinator = coordinator.clone();
                let graph = graph.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    graph.cancel_task(&"T1".into()).unwrap();
                    coordinator.release(&"T1".into()).unwrap();
                })
            };
            let granted = requester.join().unwrap();
            canceller.join().unwrap();

            if let Err(e) = &granted {
                assert!(matches!(e, CadenceError::InvalidInput { .. }), "{e}");
            }
            assert_eq!(graph.get_task(&"T1".into()).unwrap().status, TaskStatus::Cancelled);
            assert!(coordinator.held_resources().unwrap().is_empty());
        }
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_requests() -> impl Strategy<Value = Vec<ResourceRequest>> {
        prop::collection::vec(prop::collection::btree_set("[a-e]", 0..4), 0..6).prop_map(|sets| {
            sets.into_iter()
                .enumerate()
                .map(|(i, resources)| ResourceRequest {
                    agent_id: AgentId::new(format!("agent-{i}")),
                    task_id: TaskId::new(format!("T{i}")),
                    resources,
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A resource is reported exactly when two or more requests want it.
        #[test]
        fn prop_detect_conflicts_matches_overlap(requests in arb_requests()) {
            let conflicts = Coordinator::detect_conflicts(&requests);
            let reported: BTreeSet<String> = conflicts
                .iter()
                .flat_map(|c| c.resources.iter().cloned())
                .collect();
            let mut expected = BTreeSet::new();
            for resource in ["a", "b", "c", "d", "e"] {
                let wanting = requests.iter().filter(|r| r.resources.contains(resource)).count();
                if wanting > 1 {
                    expected.insert(resource.to_string());
                }
            }
            prop_assert_eq!(reported, expected);
            for conflict in &conflicts {
                prop_assert!(!conflict.resources.is_empty());
                prop_assert!(conflict.requesters.len() > 1);
            }
        }

        /// Sequential requests never leave a resource with two holders.
        #[test]
        fn prop_no_double_holds(requests in arb_requests()) {
            let graph = Arc::new(TaskGraph::new());
            let agents = Arc::new(AgentStateStore::new(10));
            for r in &requests {
                graph.add_task(cadence_core::Task::new(r.task_id.clone(), "t")).unwrap();
                agents.register_agent(r.agent_id.clone(), "/w").unwrap();
            }
            let coordinator = Coordinator::new(graph, agents);
            let mut granted: BTreeSet<String> = BTreeSet::new();
            for r in &requests {
                match coordinator.request_task_execution(&r.agent_id, &r.task_id, &r.resources) {
                    Ok(grant) => {
                        prop_assert!(grant.resources.is_disjoint(&granted));
                        granted.extend(grant.resources);
                    }
                    Err(CadenceError::ConflictDetected { resources }) => {
                        prop_assert!(!resources.is_empty());
                        prop_assert!(resources.iter().all(|res| granted.contains(res)));
                    }
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
            }
            let held: BTreeSet<String> = coordinator.held_resources().unwrap().into_keys().collect();
            prop_assert_eq!(held, granted);
        }
    }
}
