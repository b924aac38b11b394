//! Workflow stage machine.
//!
//! `transition` is a pure function from a state and an input to the next
//! state. It performs no I/O; the supervisor feeds it inputs derived from
//! the facade and records every result.
//!
//! ```text
//! Instruction -> TaskDecomposition -> SprintExecution -> QualityAssessment
//!      -> ContinuationDecision -> Completion
//!                 |  continue: back to SprintExecution
//!                 |  restart / out of sprints: wait for operator
//! EmergencyStop from any unfinished stage
//! ```

use cadence_core::{
    AgentId, CadenceConfig, CadenceError, CadenceResult, EscalationEvent, EscalationSeverity,
    TaskId, WorkflowStage, WorkflowState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// INPUTS AND OUTPUTS
// ============================================================================

/// Thresholds for the continuation decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPolicy {
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub max_sprint_iterations: u32,
}

impl From<&CadenceConfig> for ContinuationPolicy {
    fn from(config: &CadenceConfig) -> Self {
        Self {
            high_threshold: config.quality_high_threshold,
            low_threshold: config.quality_low_threshold,
            max_sprint_iterations: config.max_sprint_iterations,
        }
    }
}

/// What an operator decided for a workflow waiting on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorDecision {
    Approve,
    AnotherSprint,
}

/// Result of mapping a quality score through the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationOutcome {
    /// Score at or above the high threshold
    Approve,
    /// Score between the thresholds
    Continue,
    /// Score below the low threshold; a redesign is needed
    Restart,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    /// Decomposed tasks and edges are registered in the task graph.
    TasksRegistered { task_ids: Vec<TaskId> },
    SprintStarted,
    SprintFinished {
        assignments: BTreeMap<AgentId, Vec<TaskId>>,
    },
    Assessed { score: f64 },
    Decide(ContinuationPolicy),
    Operator(OperatorDecision),
    EmergencyStop { reason: String },
}

impl StageInput {
    fn name(&self) -> &'static str {
        match self {
            StageInput::TasksRegistered { .. } => "tasks_registered",
            StageInput::SprintStarted => "sprint_started",
            StageInput::SprintFinished { .. } => "sprint_finished",
            StageInput::Assessed { .. } => "assessed",
            StageInput::Decide(_) => "decide",
            StageInput::Operator(_) => "operator_decision",
            StageInput::EmergencyStop { .. } => "emergency_stop",
        }
    }
}

impl fmt::Display for StageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Next state plus anything the supervisor must act on.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: WorkflowState,
    /// Short label for the history log.
    pub event: String,
    pub outcome: Option<ContinuationOutcome>,
    pub escalation: Option<EscalationEvent>,
}

impl Transition {
    fn to(state: WorkflowState, event: impl Into<String>) -> Self {
        Self {
            state,
            event: event.into(),
            outcome: None,
            escalation: None,
        }
    }
}

// ============================================================================
// TRANSITION FUNCTION
// ============================================================================

/// Map a score to an outcome.
pub fn decide(score: f64, policy: &ContinuationPolicy) -> ContinuationOutcome {
    if score >= policy.high_threshold {
        ContinuationOutcome::Approve
    } else if score >= policy.low_threshold {
        ContinuationOutcome::Continue
    } else {
        ContinuationOutcome::Restart
    }
}

fn rejected(state: &WorkflowState, input: &StageInput) -> CadenceError {
    CadenceError::invalid_input(
        "workflow.stage",
        format!(
            "workflow {} cannot apply {input} in stage {}",
            state.id, state.stage
        ),
    )
}

fn enter(mut state: WorkflowState, stage: WorkflowStage) -> WorkflowState {
    state.stage = stage;
    state.touch();
    state
}

fn next_sprint(mut state: WorkflowState) -> WorkflowState {
    state.sprint_id += 1;
    state.awaiting_operator = false;
    enter(state, WorkflowStage::SprintExecution)
}

fn approve(mut state: WorkflowState) -> WorkflowState {
    state.completed = true;
    state.awaiting_operator = false;
    enter(state, WorkflowStage::Completion)
}

fn park(mut state: WorkflowState) -> WorkflowState {
    state.awaiting_operator = true;
    state.touch();
    state
}

/// Apply `input` to `state`.
///
/// Fails with `InvalidInput` when the input does not belong to the current
/// stage, when the workflow is already finished, or when a score is outside
/// [0, 100]. The passed state is never modified.
pub fn transition(state: &WorkflowState, input: StageInput) -> CadenceResult<Transition> {
    if state.is_finished() {
        return Err(CadenceError::invalid_input(
            "workflow.stage",
            format!("workflow {} already finished in {}", state.id, state.stage),
        ));
    }
    let current = state.clone();

    match (state.stage, input) {
        (_, StageInput::EmergencyStop { reason }) => {
            let mut next = current;
            next.stop_reason = Some(reason.clone());
            next.awaiting_operator = false;
            Ok(Transition::to(
                enter(next, WorkflowStage::EmergencyStop),
                format!("emergency_stop: {reason}"),
            ))
        }

        (WorkflowStage::Instruction, StageInput::TasksRegistered { task_ids }) => {
            let mut next = current;
            next.task_ids = task_ids;
            Ok(Transition::to(
                enter(next, WorkflowStage::TaskDecomposition),
                "tasks_registered",
            ))
        }

        (WorkflowStage::TaskDecomposition, StageInput::SprintStarted) => {
            Ok(Transition::to(next_sprint(current), "sprint_started"))
        }

        (WorkflowStage::SprintExecution, StageInput::SprintFinished { assignments }) => {
            let mut next = current;
            for (agent, tasks) in assignments {
                let entry = next.assignments.entry(agent).or_default();
                for task in tasks {
                    if !entry.contains(&task) {
                        entry.push(task);
                    }
                }
            }
            Ok(Transition::to(
                enter(next, WorkflowStage::QualityAssessment),
                "sprint_finished",
            ))
        }

        (WorkflowStage::QualityAssessment, StageInput::Assessed { score }) => {
            if !(0.0..=100.0).contains(&score) {
                return Err(CadenceError::invalid_input(
                    "quality_score",
                    format!("{score} is outside [0, 100]"),
                ));
            }
            let mut next = current;
            next.last_quality_score = Some(score);
            Ok(Transition::to(
                enter(next, WorkflowStage::ContinuationDecision),
                format!("assessed: {score:.1}"),
            ))
        }

        (WorkflowStage::ContinuationDecision, StageInput::Decide(policy))
            if !state.awaiting_operator =>
        {
            let score = state.last_quality_score.ok_or_else(|| {
                CadenceError::invalid_input(
                    "quality_score",
                    format!("workflow {} has not been assessed", state.id),
                )
            })?;
            Ok(apply_decision(current, score, &policy))
        }

        (WorkflowStage::ContinuationDecision, StageInput::Operator(decision))
            if state.awaiting_operator =>
        {
            let (next, event) = match decision {
                OperatorDecision::Approve => (approve(current), "operator_approved"),
                OperatorDecision::AnotherSprint => (next_sprint(current), "operator_another_sprint"),
            };
            Ok(Transition::to(next, event))
        }

        (_, input) => Err(rejected(state, &input)),
    }
}

fn apply_decision(state: WorkflowState, score: f64, policy: &ContinuationPolicy) -> Transition {
    let outcome = decide(score, policy);
    let id = state.id;
    let sprint = state.sprint_id;

    let mut transition = match outcome {
        ContinuationOutcome::Approve => Transition::to(approve(state), "approved"),
        ContinuationOutcome::Continue if sprint < policy.max_sprint_iterations => {
            Transition::to(next_sprint(state), "continue")
        }
        ContinuationOutcome::Continue => {
            let mut t = Transition::to(park(state), "awaiting_operator: sprints exhausted");
            t.escalation = Some(
                EscalationEvent::new(
                    EscalationSeverity::Warning,
                    "workflow",
                    format!(
                        "quality {score:.1} still below {:.1} after {sprint} sprint(s)",
                        policy.high_threshold
                    ),
                )
                .for_workflow(id),
            );
            t
        }
        ContinuationOutcome::Restart => {
            let mut t = Transition::to(park(state), "awaiting_operator: redesign");
            t.escalation = Some(
                EscalationEvent::new(
                    EscalationSeverity::Critical,
                    "workflow",
                    format!(
                        "quality {score:.1} below {:.1}, redesign needed",
                        policy.low_threshold
                    ),
                )
                .for_workflow(id),
            );
            t
        }
    };
    transition.outcome = Some(outcome);
    transition
}
