//! Pluggable decomposition and quality evaluation steps.
//!
//! Turning free text into tasks and judging the result are outside the
//! orchestration core. The core talks to them through `TaskDecomposer` and
//! `QualityEvaluator`; the defaults here cover pre-decomposed batches.

use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, DependencyEdge, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// Tasks and edges produced from one instruction batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecomposedBatch {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

impl DecomposedBatch {
    /// Reject duplicate ids and edges naming tasks outside the batch.
    /// Cycles are left to the task graph.
    pub fn validate(&self) -> CadenceResult<()> {
        let mut ids = std::collections::BTreeSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !ids.insert(&task.id) {
                return Err(CadenceError::invalid_input(
                    "batch.tasks",
                    format!("task {} appears more than once", task.id),
                ));
            }
        }
        for edge in &self.dependencies {
            for id in [&edge.task, &edge.depends_on] {
                if !ids.contains(id) {
                    return Err(CadenceError::invalid_input(
                        "batch.dependencies",
                        format!("edge {} -> {} names unknown task {id}", edge.task, edge.depends_on),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait TaskDecomposer: Send + Sync {
    async fn decompose(&self, instructions: &[String]) -> CadenceResult<DecomposedBatch>;
}

/// Returns a batch decomposed ahead of time, ignoring the instruction text.
#[derive(Debug, Clone, Default)]
pub struct StaticDecomposer {
    batch: DecomposedBatch,
}

impl StaticDecomposer {
    pub fn new(batch: DecomposedBatch) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl TaskDecomposer for StaticDecomposer {
    async fn decompose(&self, _instructions: &[String]) -> CadenceResult<DecomposedBatch> {
        Ok(self.batch.clone())
    }
}

/// Produces an opaque 0-100 quality score for a sprint's tasks.
#[async_trait]
pub trait QualityEvaluator: Send + Sync {
    async fn evaluate(&self, tasks: &[Task]) -> CadenceResult<f64>;
}

/// Completed share of tasks times 100, minus a fixed penalty per failed
/// task, clamped to [0, 100]. An empty task list scores 100.
#[derive(Debug, Clone, Default)]
pub struct CompletionRatioEvaluator {
    failure_penalty: f64,
}

impl CompletionRatioEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_penalty(mut self, penalty: f64) -> Self {
        self.failure_penalty = penalty.max(0.0);
        self
    }
}

#[async_trait]
impl QualityEvaluator for CompletionRatioEvaluator {
    async fn evaluate(&self, tasks: &[Task]) -> CadenceResult<f64> {
        if tasks.is_empty() {
            return Ok(100.0);
        }
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let ratio = completed as f64 / tasks.len() as f64 * 100.0;
        Ok((ratio - failed as f64 * self.failure_penalty).clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_test_utils::{fixtures::task, with_status};

    #[tokio::test]
    async fn test_completion_ratio() {
        let tasks = vec![
            with_status(task("A"), TaskStatus::Completed),
            with_status(task("B"), TaskStatus::Completed),
            with_status(task("C"), TaskStatus::Completed),
            task("D"),
        ];
        let score = CompletionRatioEvaluator::new().evaluate(&tasks).await.unwrap();
        assert!((score - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_penalty_clamps_at_zero() {
        let tasks = vec![
            with_status(task("A"), TaskStatus::Failed),
            with_status(task("B"), TaskStatus::Failed),
        ];
        let evaluator = CompletionRatioEvaluator::new().with_failure_penalty(30.0);
        assert_eq!(evaluator.evaluate(&tasks).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_sprint_scores_full() {
        let score = CompletionRatioEvaluator::new().evaluate(&[]).await.unwrap();
        assert_eq!(score, 100.0);
    }

    #[tokio::test]
    async fn test_static_decomposer_ignores_text() {
        let batch = DecomposedBatch {
            tasks: vec![task("A")],
            dependencies: vec![],
        };
        let decomposer = StaticDecomposer::new(batch.clone());
        let out = decomposer.decompose(&["anything".into()]).await.unwrap();
        assert_eq!(out, batch);
    }

    #[test]
    fn test_batch_rejects_duplicates_and_dangling_edges() {
        let dup = DecomposedBatch {
            tasks: vec![task("A"), task("A")],
            dependencies: vec![],
        };
        assert!(dup.validate().is_err());

        let dangling = DecomposedBatch {
            tasks: vec![task("A")],
            dependencies: vec![DependencyEdge::hard("A", "Z")],
        };
        assert!(dangling.validate().is_err());

        let ok = DecomposedBatch {
            tasks: vec![task("A"), task("B")],
            dependencies: vec![DependencyEdge::hard("B", "A")],
        };
        assert!(ok.validate().is_ok());
    }
}
