//! End-to-end scenarios through the collaboration facade.

use cadence_core::{AgentId, HealthStatus, TaskId, TaskStatus};
use cadence_orchestrator::{CollaborationFacade, SimulatedExecutor, TaskRunOutcome};
use cadence_test_utils::assertions::expect_cycle;
use cadence_test_utils::fixtures::{chain, fast_config, task};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn facade(agents: usize) -> Arc<CollaborationFacade> {
    let facade = CollaborationFacade::builder(fast_config())
        .executor(Arc::new(SimulatedExecutor::new(Duration::from_millis(1))))
        .build()
        .unwrap();
    for i in 0..agents {
        facade
            .register_agent(AgentId::from(format!("agent-{i:02}")), "/work")
            .unwrap();
    }
    Arc::new(facade)
}

fn executable_ids(facade: &CollaborationFacade) -> Vec<TaskId> {
    facade
        .graph()
        .get_executable_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_dependent_unblocks_after_completion() {
    let facade = facade(1);
    facade.add_task(task("T1")).unwrap();
    facade.add_task(task("T2")).unwrap();
    facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

    assert_eq!(executable_ids(&facade), vec![TaskId::from("T1")]);

    let results = facade.execute_workflow(&[TaskId::from("T1")]).await;
    assert_eq!(results[0].outcome, TaskRunOutcome::Completed);
    assert_eq!(executable_ids(&facade), vec![TaskId::from("T2")]);
}

#[test]
fn test_scenario_b_three_cycle_rejected() {
    let facade = facade(0);
    for id in ["T1", "T2", "T3"] {
        facade.add_task(task(id)).unwrap();
    }
    facade.add_dependency(&"T3".into(), &"T1".into()).unwrap();
    facade.add_dependency(&"T1".into(), &"T2".into()).unwrap();

    let cycle = expect_cycle(facade.add_dependency(&"T2".into(), &"T3".into()));
    assert_eq!(cycle.len(), 3);
    assert_eq!(facade.graph().edge_count().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_c_thousand_concurrent_adds() {
    let facade = facade(8);
    let mut handles = Vec::with_capacity(1000);
    for i in 0..1000 {
        let facade = facade.clone();
        handles.push(tokio::spawn(async move {
            facade.add_task(task(&format!("T{i:04}")))
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let tasks = facade.get_all_tasks().unwrap();
    assert_eq!(tasks.len(), 1000);
    let unique: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    assert_eq!(unique.len(), 1000);

    let ids: Vec<TaskId> = tasks.into_iter().map(|t| t.id).collect();
    let results = facade.execute_workflow(&ids).await;
    assert_eq!(results.len(), 1000);
    assert!(results
        .iter()
        .all(|r| r.outcome == TaskRunOutcome::Completed));
    let stats = facade.graph().stats().unwrap();
    assert_eq!(stats.completed, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_adds_keep_one() {
    let facade = facade(0);
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let facade = facade.clone();
            tokio::spawn(async move { facade.add_task(task("dup")) })
        })
        .collect();
    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(facade.graph().task_count().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chain_never_runs_out_of_order() {
    let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1)));
    let facade = CollaborationFacade::builder(fast_config())
        .executor(executor.clone())
        .build()
        .unwrap();
    for agent in ["a", "b", "c", "d"] {
        facade.register_agent(agent.into(), "/work").unwrap();
    }
    let (tasks, edges) = chain(12);
    let ids: Vec<TaskId> = tasks.iter().rev().map(|t| t.id.clone()).collect();
    for t in tasks {
        facade.add_task(t).unwrap();
    }
    for edge in edges {
        facade.add_dependency(&edge.task, &edge.depends_on).unwrap();
    }

    let results = facade.execute_workflow(&ids).await;
    assert!(results
        .iter()
        .all(|r| r.outcome == TaskRunOutcome::Completed));
    let expected: Vec<TaskId> = (0..12).map(|i| TaskId::from(format!("T{i}").as_str())).collect();
    assert_eq!(executor.executed(), expected);

    let path = facade.critical_path().unwrap();
    assert_eq!(path.tasks.len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_reports_after_a_run() {
    let facade = facade(2);
    for id in ["T1", "T2", "T3", "T4"] {
        facade.add_task(task(id)).unwrap();
    }
    facade.cancel_task(&"T4".into()).unwrap();
    let ids: Vec<TaskId> = ["T1", "T2", "T3", "T4"].into_iter().map(TaskId::from).collect();
    let results = facade.execute_workflow(&ids).await;
    assert_eq!(results[3].outcome, TaskRunOutcome::Skipped);

    let summary = facade.get_current_progress_summary().unwrap();
    assert_eq!(summary.total_tasks, 4);
    assert_eq!(summary.completed_tasks, 3);
    assert_eq!(summary.cancelled_tasks, 1);

    let efficiency = facade.analyze_collaboration_efficiency().unwrap();
    assert_eq!(efficiency.total_agents, 2);
    assert_eq!(efficiency.held_resources, 0);
    assert!(facade.analyze_progress_trend().is_ok());

    let health = facade.perform_system_health_check().await;
    assert_eq!(health.overall, HealthStatus::Healthy);
    assert_eq!(
        facade.get_task(&"T4".into()).unwrap().status,
        TaskStatus::Cancelled
    );
}
