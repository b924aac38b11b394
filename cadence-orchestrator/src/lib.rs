//! Cadence Orchestrator
//!
//! The outer layer of the orchestration core:
//!
//! - `CollaborationFacade`: the single entry point that composes the task
//!   graph, agent store, coordinator and fault-tolerance primitives into
//!   atomic multi-step operations
//! - `workflow`: the stage machine and the `WorkflowSupervisor` driving it
//! - `executor`: how a claimed task actually runs (worker process or
//!   simulation)
//! - `telemetry`: tracing subscriber setup for the `cadence` binary
//! - `batch`: the binary's input file and output report

pub mod batch;
pub mod executor;
pub mod facade;
pub mod telemetry;
pub mod workflow;

pub use batch::{BatchFile, RunReport};
pub use executor::{
    instruction_line, ExecutionOutcome, SimulatedExecutor, TaskExecutor, TaskInstruction,
    WorkerTaskExecutor,
};
pub use facade::{CollaborationFacade, FacadeBuilder, TaskRunOutcome, TaskRunResult};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig};
pub use workflow::{
    CommandResponse, ContinuationPolicy, OperatorDecision, QueryResponse, WorkflowCommand,
    WorkflowQuery, WorkflowSupervisor,
};
