//! Workflows driven through real `sh` worker processes.
#![cfg(unix)]

use cadence_core::{
    AgentId, DependencyEdge, EscalationSeverity, HealthStatus, TaskId, TaskStatus, WorkflowStage,
};
use cadence_orchestrator::workflow::{DecomposedBatch, StaticDecomposer};
use cadence_orchestrator::{
    CollaborationFacade, TaskRunOutcome, WorkerTaskExecutor, WorkflowSupervisor,
};
use cadence_supervisor::{
    ProcessLauncher, ProcessSupervisor, ResourceGuard, SupervisorConfig, WorkerSpec,
};
use cadence_test_utils::fixtures::{fast_config, task};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Answers every EXECUTE line: tasks whose id starts with `bad` fail, the
/// rest report progress and succeed.
const RESPONDER: &str = r#"
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"task_id":"\([^"]*\)".*/\1/p')
  case "$id" in
    bad*) echo "__TASK_FAILED__:$id lint errors" ;;
    *)
      echo "__PROGRESS__:{\"agent_id\":\"$AGENT\",\"status\":\"Working\",\"progress\":50.0,\"current_task\":\"$id\"}"
      echo "__TASK_DONE__:$id"
      ;;
  esac
done
"#;

struct Harness {
    facade: Arc<CollaborationFacade>,
    supervisor: Arc<ProcessSupervisor>,
}

impl Harness {
    async fn new(agents: &[&str]) -> Self {
        let config = fast_config();
        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig::from(&config),
            Arc::new(ProcessLauncher),
            Arc::new(ResourceGuard::new(config.resource_guard.clone())),
        ));
        let facade = Arc::new(
            CollaborationFacade::builder(config.clone())
                .supervisor(supervisor.clone())
                .executor(Arc::new(WorkerTaskExecutor::new(
                    supervisor.clone(),
                    config.task_timeout,
                )))
                .build()
                .unwrap(),
        );
        facade.spawn_output_bridge(supervisor.subscribe_output());

        for agent in agents {
            let spec = WorkerSpec::new(*agent, "sh")
                .with_args(["-c", RESPONDER])
                .with_env("AGENT", *agent);
            facade.register_agent(AgentId::from(*agent), "/tmp").unwrap();
            supervisor.register(spec).await.unwrap();
            supervisor.start(&AgentId::from(*agent)).await.unwrap();
        }
        Self { facade, supervisor }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_run_through_worker_processes() {
    let harness = Harness::new(&["w1", "w2"]).await;
    let facade = &harness.facade;
    for id in ["T1", "T2", "bad3"] {
        facade.add_task(task(id)).unwrap();
    }
    facade.add_dependency(&"T2".into(), &"T1".into()).unwrap();

    let ids: Vec<TaskId> = ["T1", "T2", "bad3"].into_iter().map(TaskId::from).collect();
    let results = facade.execute_workflow(&ids).await;

    assert_eq!(results[0].outcome, TaskRunOutcome::Completed);
    assert_eq!(results[1].outcome, TaskRunOutcome::Completed);
    assert_eq!(results[2].outcome, TaskRunOutcome::Failed);
    assert_eq!(results[2].detail.as_deref(), Some("lint errors"));
    for agent in facade.agents().all_agents() {
        assert!(agent.current_task.is_none());
    }

    harness.supervisor.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_over_workers_completes() {
    let harness = Harness::new(&["w1"]).await;
    let decomposer = Arc::new(StaticDecomposer::new(DecomposedBatch {
        tasks: vec![task("design"), task("build"), task("verify")],
        dependencies: vec![
            DependencyEdge::hard("build", "design"),
            DependencyEdge::hard("verify", "build"),
        ],
    }));
    let workflows = WorkflowSupervisor::new(harness.facade.clone(), decomposer);

    let state = workflows
        .run_to_completion(vec!["ship it".into()])
        .await
        .unwrap();
    assert_eq!(state.stage, WorkflowStage::Completion);
    assert_eq!(state.assignments[&AgentId::from("w1")].len(), 3);
    for task in harness.facade.get_all_tasks().unwrap() {
        assert_eq!(task.status, TaskStatus::Completed);
    }

    harness.supervisor.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scenario_d_silent_worker_escalates_into_workflow() {
    let config = fast_config();
    let supervisor = Arc::new(ProcessSupervisor::new(
        SupervisorConfig::from(&config),
        Arc::new(ProcessLauncher),
        Arc::new(ResourceGuard::new(config.resource_guard.clone())),
    ));
    let facade = Arc::new(
        CollaborationFacade::builder(config.clone())
            .supervisor(supervisor.clone())
            .build()
            .unwrap(),
    );
    let workflows = Arc::new(WorkflowSupervisor::new(
        facade.clone(),
        Arc::new(StaticDecomposer::default()),
    ));
    let mut escalations = workflows.subscribe_escalations();
    workflows.forward_supervisor_escalations(supervisor.subscribe());

    let agent = AgentId::from("silent");
    supervisor
        .register(WorkerSpec::new("silent", "sh").with_args(["-c", "exec sleep 30"]))
        .await
        .unwrap();
    supervisor.start(&agent).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    let event = tokio::time::timeout(Duration::from_secs(20), escalations.recv())
        .await
        .expect("no escalation within 20s")
        .unwrap();
    assert_eq!(event.severity, EscalationSeverity::Critical);
    assert_eq!(event.source, "supervisor");

    let health = facade.perform_system_health_check().await;
    assert_eq!(
        health.component("process_supervisor").unwrap().status,
        HealthStatus::Unhealthy
    );
    assert_eq!(health.overall, HealthStatus::Unhealthy);

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();
}
