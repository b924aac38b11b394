//! Cadence entry point
//!
//! Loads configuration, reads one batch file, runs its workflow until it
//! completes or needs an operator, and prints the outcome as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_core::{CadenceConfig, CadenceError, CadenceResult, SystemError};
use cadence_orchestrator::telemetry::{init_telemetry, TelemetryConfig};
use cadence_orchestrator::workflow::{StaticDecomposer, WorkflowQuery};
use cadence_orchestrator::{
    BatchFile, CollaborationFacade, QueryResponse, RunReport, WorkerTaskExecutor,
    WorkflowSupervisor,
};
use cadence_supervisor::{ProcessLauncher, ProcessSupervisor, ResourceGuard, SupervisorConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> CadenceResult<()> {
    let config = load_config()?;
    init_telemetry(&TelemetryConfig::from_env()?)?;

    let batch_path = std::env::args_os().nth(1).ok_or_else(|| {
        CadenceError::invalid_input("batch", "usage: cadence <batch.json>")
    })?;
    let batch = BatchFile::from_path(Path::new(&batch_path))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    let facade = if batch.is_simulated() {
        let facade = CollaborationFacade::new(config.clone())?;
        for agent_id in batch.simulated_agents() {
            facade.register_agent(agent_id, ".")?;
        }
        Arc::new(facade)
    } else {
        let guard = Arc::new(ResourceGuard::new(config.resource_guard.clone()));
        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig::from(&config),
            Arc::new(ProcessLauncher),
            guard.clone(),
        ));
        let facade = Arc::new(
            CollaborationFacade::builder(config.clone())
                .supervisor(supervisor.clone())
                .executor(Arc::new(WorkerTaskExecutor::new(
                    supervisor.clone(),
                    config.task_timeout,
                )))
                .build()?,
        );

        // Bridge first so no early progress line is missed.
        background.push(facade.spawn_output_bridge(supervisor.subscribe_output()));
        for spec in &batch.workers {
            let dir = spec.working_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            facade.register_agent(spec.agent_id.clone(), dir)?;
            supervisor.register(spec.clone()).await?;
            let pid = supervisor.start(&spec.agent_id).await?;
            facade.agents().set_process_id(&spec.agent_id, pid)?;
        }

        let run_loop = supervisor.clone();
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move { run_loop.run(rx).await }));

        let monitor = guard.spawn_memory_monitor(shutdown_rx.clone());
        background.push(tokio::spawn(async move {
            match monitor.await {
                Ok(Err(e)) => tracing::error!(error = %e, "memory monitor failed"),
                Err(e) => tracing::error!(error = %e, "memory monitor panicked"),
                Ok(Ok(())) => {}
            }
        }));
        facade
    };

    let workflows = Arc::new(WorkflowSupervisor::new(
        facade.clone(),
        Arc::new(StaticDecomposer::new(batch.decomposed())),
    ));
    if let Some(supervisor) = facade.supervisor() {
        background.push(workflows.forward_supervisor_escalations(supervisor.subscribe()));
    }

    tracing::info!(
        tasks = batch.tasks.len(),
        workers = batch.workers.len(),
        "starting workflow"
    );
    let outcome = tokio::select! {
        result = workflows.run_to_completion(batch.instructions.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            stop_active(&workflows)
        }
    };

    if let Some(supervisor) = facade.supervisor() {
        supervisor.stop_all().await;
    }
    let _ = shutdown_tx.send(true);
    for handle in background {
        handle.abort();
    }

    let report = RunReport {
        workflow: outcome?,
        tasks: facade.get_all_tasks()?,
        health: facade.perform_system_health_check().await,
        escalations: workflows.escalations(),
    };
    let json = serde_json::to_string_pretty(&report).map_err(|e| {
        CadenceError::System(SystemError::Storage {
            operation: "write_report".into(),
            reason: e.to_string(),
        })
    })?;
    println!("{json}");
    Ok(())
}

/// `CADENCE_CONFIG` names a TOML file; otherwise `CADENCE_*` variables.
fn load_config() -> CadenceResult<CadenceConfig> {
    match std::env::var_os("CADENCE_CONFIG") {
        Some(path) => CadenceConfig::from_path(Path::new(&path)),
        None => CadenceConfig::from_env(),
    }
}

/// Emergency-stop every active workflow and return the first one's state.
fn stop_active(
    workflows: &WorkflowSupervisor,
) -> CadenceResult<cadence_core::WorkflowState> {
    let QueryResponse::Active(active) = workflows.query(WorkflowQuery::Active)? else {
        return Err(CadenceError::invalid_input("query", "unexpected response"));
    };
    let mut stopped = Vec::with_capacity(active.len());
    for state in active {
        stopped.push(workflows.emergency_stop(state.id, "interrupted")?);
    }
    stopped
        .into_iter()
        .next()
        .ok_or_else(|| CadenceError::invalid_input("workflow", "no active workflow to stop"))
}
