//! Workflow stages: the pure stage machine, virtual time, the pluggable
//! decomposition and scoring steps, and the supervisor that drives them.

mod clock;
mod machine;
mod quality;
mod supervisor;

pub use clock::VirtualClock;
pub use machine::{
    decide, transition, ContinuationOutcome, ContinuationPolicy, OperatorDecision, StageInput,
    Transition,
};
pub use quality::{
    CompletionRatioEvaluator, DecomposedBatch, QualityEvaluator, StaticDecomposer, TaskDecomposer,
};
pub use supervisor::{
    CommandResponse, QueryResponse, WorkflowCommand, WorkflowQuery, WorkflowSupervisor,
};
