//! Cadence Test Utilities
//!
//! Shared test infrastructure for the Cadence workspace:
//! - Proptest generators for tasks, statuses, progress values and random DAGs
//! - Fixtures with fast timings for async tests
//! - Assertions for the error taxonomy

pub use cadence_storage::InMemoryStorage;

pub use cadence_core::{
    AgentId, AgentState, AgentStatus, CadenceConfig, CadenceError, CadenceResult,
    DependencyEdge, DependencyKind, EntityType, Task, TaskId, TaskPriority, TaskStatus,
    Timestamp,
};

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fixed base time so generated creation times are reproducible.
pub fn base_time() -> Timestamp {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// Walk `task` through legal transitions until it reaches `status`.
pub fn with_status(mut task: Task, status: TaskStatus) -> Task {
    let path: &[TaskStatus] = match status {
        TaskStatus::Pending => &[],
        TaskStatus::InProgress => &[TaskStatus::InProgress],
        TaskStatus::Completed => &[TaskStatus::InProgress, TaskStatus::Completed],
        TaskStatus::Failed => &[TaskStatus::InProgress, TaskStatus::Failed],
        TaskStatus::Cancelled => &[TaskStatus::Cancelled],
    };
    for next in path {
        if let Err(e) = task.transition_to(*next) {
            panic!("fixture transition to {next} failed: {e}");
        }
    }
    task
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Cadence types.

    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    /// A randomly generated acyclic task graph.
    #[derive(Debug, Clone)]
    pub struct DagSpec {
        pub tasks: Vec<Task>,
        pub edges: Vec<DependencyEdge>,
    }

    pub fn arb_priority() -> impl Strategy<Value = TaskPriority> {
        prop_oneof![
            Just(TaskPriority::Low),
            Just(TaskPriority::Medium),
            Just(TaskPriority::High),
        ]
    }

    pub fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Pending),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Completed),
            Just(TaskStatus::Failed),
            Just(TaskStatus::Cancelled),
        ]
    }

    pub fn arb_dependency_kind() -> impl Strategy<Value = DependencyKind> {
        prop_oneof![
            3 => Just(DependencyKind::Hard),
            1 => Just(DependencyKind::Soft),
        ]
    }

    pub fn arb_agent_status() -> impl Strategy<Value = AgentStatus> {
        prop_oneof![
            Just(AgentStatus::Idle),
            Just(AgentStatus::Working),
            Just(AgentStatus::Blocked),
            Just(AgentStatus::Error),
            Just(AgentStatus::Completed),
        ]
    }

    /// Progress values inside [0, 100], including both bounds.
    pub fn arb_valid_progress() -> impl Strategy<Value = f64> {
        prop_oneof![Just(0.0), Just(100.0), 0.0f64..=100.0]
    }

    /// Progress values outside [0, 100], including NaN and infinities.
    pub fn arb_invalid_progress() -> impl Strategy<Value = f64> {
        prop_oneof![
            -1.0e9f64..-0.000_001,
            100.000_001f64..1.0e9,
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(f64::NEG_INFINITY),
        ]
    }

    /// Generate a task with the given id.
    pub fn arb_task(id: String) -> impl Strategy<Value = Task> {
        (
            arb_priority(),
            arb_task_status(),
            0u64..5_000,
            0i64..120,
            prop::collection::btree_set("[a-e]", 0..3),
        )
            .prop_map(move |(priority, status, estimate_ms, offset, resources)| {
                let task = Task::new(id.clone(), format!("task {id}"))
                    .with_priority(priority)
                    .with_estimate(Duration::from_millis(estimate_ms))
                    .with_resources(resources)
                    .with_created_at(base_time() + chrono::Duration::seconds(offset));
                with_status(task, status)
            })
    }

    /// Generate an acyclic graph of up to `max_tasks` tasks.
    ///
    /// Edges always point from a higher index to a lower one, so the
    /// generated edge set can be inserted in any order without a cycle.
    pub fn arb_dag(max_tasks: usize) -> impl Strategy<Value = DagSpec> {
        (1..=max_tasks.max(1)).prop_flat_map(|n| {
            let tasks = (0..n)
                .map(|i| arb_task(format!("T{i}")).boxed())
                .collect::<Vec<_>>();
            let edges = prop::collection::vec((0..n, 0..n, arb_dependency_kind()), 0..=n * 2);
            (tasks, edges).prop_map(|(tasks, raw_edges)| {
                let mut seen = BTreeSet::new();
                let edges = raw_edges
                    .into_iter()
                    .filter(|(a, b, _)| a != b)
                    .filter_map(|(a, b, kind)| {
                        let (task, dep) = if a > b { (a, b) } else { (b, a) };
                        seen.insert((task, dep)).then(|| DependencyEdge {
                            task: tasks[task].id.clone(),
                            depends_on: tasks[dep].id.clone(),
                            kind,
                        })
                    })
                    .collect();
                DagSpec { tasks, edges }
            })
        })
    }

    /// Generate a DAG where every task is still Pending.
    pub fn arb_pending_dag(max_tasks: usize) -> impl Strategy<Value = DagSpec> {
        arb_dag(max_tasks).prop_map(|mut dag| {
            for task in &mut dag.tasks {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.actual_duration = None;
            }
            dag
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use std::sync::Arc;

    /// A valid configuration with timings short enough for async tests.
    pub fn fast_config() -> CadenceConfig {
        let mut config = CadenceConfig {
            task_timeout: Duration::from_secs(5),
            stale_agent_threshold: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(50),
            restart_cooldown: Duration::from_millis(10),
            max_restart_attempts: 3,
            virtual_time_unit: Duration::from_millis(1),
            sprint_duration_units: 1_000,
            ..CadenceConfig::default()
        };
        config.circuit_breaker.call_timeout = Duration::from_secs(1);
        config.circuit_breaker.recovery_timeout = Duration::from_millis(100);
        config.retry.initial_backoff = Duration::from_millis(1);
        config.retry.max_backoff = Duration::from_millis(10);
        config
    }

    /// A pending task with a 10ms estimate.
    pub fn task(id: &str) -> Task {
        Task::new(id, format!("task {id}")).with_estimate(Duration::from_millis(10))
    }

    /// A pending task requiring the given resources.
    pub fn task_with_resources(id: &str, resources: &[&str]) -> Task {
        task(id).with_resources(resources.iter().copied())
    }

    /// `n` tasks where each depends on the previous one.
    pub fn chain(n: usize) -> (Vec<Task>, Vec<DependencyEdge>) {
        let tasks: Vec<Task> = (0..n).map(|i| task(&format!("T{i}"))).collect();
        let edges = (1..n)
            .map(|i| DependencyEdge::hard(format!("T{i}"), format!("T{}", i - 1)))
            .collect();
        (tasks, edges)
    }

    pub fn shared_storage() -> Arc<InMemoryStorage> {
        Arc::new(InMemoryStorage::new())
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Cadence error variants.

    use super::*;

    /// Assert that a result is an `InvalidInput` error.
    #[track_caller]
    pub fn assert_invalid_input<T: std::fmt::Debug>(result: &CadenceResult<T>) {
        match result {
            Err(CadenceError::InvalidInput { .. }) => {}
            other => panic!("Expected InvalidInput, got: {:?}", other),
        }
    }

    /// Assert that a result is a `NotFound` error for `entity_type`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(
        result: &CadenceResult<T>,
        entity_type: EntityType,
    ) {
        match result {
            Err(CadenceError::NotFound {
                entity_type: et, ..
            }) => assert_eq!(*et, entity_type),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert a `ConflictDetected` error and return the overlapping names.
    #[track_caller]
    pub fn expect_conflict<T: std::fmt::Debug>(result: CadenceResult<T>) -> Vec<String> {
        match result {
            Err(CadenceError::ConflictDetected { resources }) => {
                assert!(!resources.is_empty(), "conflict must name resources");
                resources
            }
            other => panic!("Expected ConflictDetected, got: {:?}", other),
        }
    }

    /// Assert a `CircularDependency` error and return the cycle.
    #[track_caller]
    pub fn expect_cycle<T: std::fmt::Debug>(result: CadenceResult<T>) -> Vec<String> {
        match result {
            Err(CadenceError::CircularDependency { cycle }) => cycle,
            other => panic!("Expected CircularDependency, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn test_with_status_reaches_target() {
        for status in TaskStatus::ALL {
            let task = with_status(fixtures::task("T"), status);
            assert_eq!(task.status, status);
        }
    }

    #[test]
    fn test_chain_fixture() {
        let (tasks, edges) = fixtures::chain(4);
        assert_eq!(tasks.len(), 4);
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].task.as_str(), "T1");
        assert_eq!(edges[0].depends_on.as_str(), "T0");
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fixtures::fast_config().validate().is_ok());
    }

    #[test]
    fn test_generated_dag_edges_point_backwards() {
        let mut runner = TestRunner::default();
        for _ in 0..20 {
            let dag = arb_dag(12).new_tree(&mut runner).unwrap().current();
            let index = |id: &TaskId| dag.tasks.iter().position(|t| &t.id == id).unwrap();
            for edge in &dag.edges {
                assert!(index(&edge.task) > index(&edge.depends_on));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_invalid_progress_is_rejected(p in arb_invalid_progress()) {
            prop_assert!(cadence_core::validate_progress(p).is_err());
        }
    }
}
