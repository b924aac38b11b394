//! Derived report types. Produced on demand, never the source of truth.

use crate::{duration_ms, AgentId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Point-in-time projection of task and agent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub in_progress_tasks: usize,
    /// Pending tasks with at least one unsatisfied hard dependency.
    pub blocked_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub completion_percentage: f64,
    #[serde(with = "duration_ms")]
    pub estimated_remaining: Duration,
    pub active_agents: usize,
    pub generated_at: Timestamp,
}

/// Direction of aggregate velocity across the trend window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Accelerating,
    Steady,
    Slowing,
    Stalled,
}

/// Velocity of a single agent over its recent history samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVelocity {
    pub agent_id: AgentId,
    pub samples: usize,
    /// Percentage points of progress per minute.
    pub velocity_per_minute: f64,
    pub latest_progress: f64,
}

/// Follow-up suggested by trend analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecommendedAction {
    NoActionNeeded,
    InvestigateStalledAgent { agent_id: AgentId },
    RebalanceWork { idle_agents: usize, executable_tasks: usize },
    ReviewBlockedTasks { blocked_tasks: usize },
    RetryFailedTasks { failed_tasks: usize },
    ExtendTimeline { overrun_ratio: f64 },
}

/// Velocity and efficiency analysis. `recommended_actions` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressTrend {
    /// Mean velocity of agents with at least two samples.
    pub velocity_per_minute: f64,
    pub agent_velocities: Vec<AgentVelocity>,
    /// Estimated work finished divided by actual time spent on it.
    /// 1.0 means on estimate, below 1.0 means slower than estimated.
    pub efficiency: f64,
    pub direction: TrendDirection,
    pub recommended_actions: Vec<RecommendedAction>,
    pub analyzed_at: Timestamp,
}

/// Agent concurrency and resource usage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEfficiency {
    pub total_agents: usize,
    pub working_agents: usize,
    /// Working agents over all agents. Zero when there are no agents.
    pub parallel_efficiency: f64,
    /// Held resources over every resource any task requires.
    pub resource_utilization: f64,
    pub held_resources: usize,
    pub grants: u64,
    pub conflicts: u64,
    pub analyzed_at: Timestamp,
}

/// A request by one agent to run one task holding a resource set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub resources: BTreeSet<String>,
}

/// Resource names requested by two or more in-flight requests at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub resources: Vec<String>,
    pub requesters: Vec<(AgentId, TaskId)>,
}

/// Maximum-duration dependency chain, first task to run first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CriticalPath {
    #[serde(with = "duration_ms")]
    pub total_duration: Duration,
    pub tasks: Vec<TaskId>,
}

/// Task counts per status plus edge counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub edges: usize,
    pub hard_edges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_action_is_tagged() {
        let json = serde_json::to_value(RecommendedAction::ReviewBlockedTasks {
            blocked_tasks: 3,
        })
        .unwrap();
        assert_eq!(json["action"], "review_blocked_tasks");
        assert_eq!(json["blocked_tasks"], 3);
    }

    #[test]
    fn test_empty_critical_path_default() {
        let path = CriticalPath::default();
        assert!(path.tasks.is_empty());
        assert_eq!(path.total_duration, Duration::ZERO);
    }
}
