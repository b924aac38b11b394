//! Progress summaries and trend analysis.

use crate::AgentStateStore;
use cadence_core::{
    AgentStatus, AgentVelocity, CadenceResult, ProgressSample, ProgressSummary, ProgressTrend,
    RecommendedAction, Task, TaskStatus, TrendDirection,
};
use cadence_graph::TaskGraph;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Velocity change between window halves that still counts as steady.
const STEADY_BAND: f64 = 0.10;

/// Efficiency below this suggests extending the timeline.
const LOW_EFFICIENCY: f64 = 0.8;

/// Read-only projections over the task graph and the agent store.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    graph: Arc<TaskGraph>,
    agents: Arc<AgentStateStore>,
    trend_window: usize,
    stale_threshold: Duration,
}

impl ProgressAggregator {
    pub fn new(
        graph: Arc<TaskGraph>,
        agents: Arc<AgentStateStore>,
        trend_window: usize,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            graph,
            agents,
            trend_window: trend_window.max(2),
            stale_threshold,
        }
    }

    /// Point-in-time summary. Never mutates tasks or agents.
    ///
    /// Remaining time is the outstanding estimated work (in-progress tasks
    /// credited for time already spent) spread across the agents currently
    /// working, or one agent when none are.
    pub fn get_current_summary(&self) -> CadenceResult<ProgressSummary> {
        let tasks = self.graph.all_tasks()?;
        let blocked = self.graph.blocked_tasks()?.len();
        let active_agents = self
            .agents
            .all_agents()
            .iter()
            .filter(|a| a.status.is_active())
            .count();

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let total = tasks.len();
        let completed = count(TaskStatus::Completed);
        let completion_percentage = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };

        let now = Utc::now();
        let outstanding = tasks
            .iter()
            .filter_map(|t| remaining_estimate(t, now))
            .fold(Duration::ZERO, Duration::saturating_add);
        let estimated_remaining = outstanding / active_agents.max(1) as u32;

        Ok(ProgressSummary {
            total_tasks: total,
            completed_tasks: completed,
            in_progress_tasks: count(TaskStatus::InProgress),
            blocked_tasks: blocked,
            failed_tasks: count(TaskStatus::Failed),
            cancelled_tasks: count(TaskStatus::Cancelled),
            completion_percentage,
            estimated_remaining,
            active_agents,
            generated_at: now,
        })
    }

    /// Velocity per agent over the most recent history samples, an
    /// estimate-versus-actual efficiency ratio, and recommendations.
    ///
    /// The recommendation list always has at least one entry.
    pub fn analyze_progress_trend(&self) -> CadenceResult<ProgressTrend> {
        let agents = self.agents.all_agents();
        let now = Utc::now();

        let mut agent_velocities = Vec::new();
        let mut early_rates = Vec::new();
        let mut late_rates = Vec::new();
        for agent in &agents {
            let history = self.agents.history(&agent.agent_id);
            let window = &history[history.len().saturating_sub(self.trend_window)..];
            if let Some(velocity) = velocity_per_minute(window) {
                agent_velocities.push(AgentVelocity {
                    agent_id: agent.agent_id.clone(),
                    samples: window.len(),
                    velocity_per_minute: velocity,
                    latest_progress: agent.progress,
                });
            }
            let (early, late) = window.split_at(window.len() / 2);
            if let (Some(e), Some(l)) = (velocity_per_minute(early), velocity_per_minute(late)) {
                early_rates.push(e);
                late_rates.push(l);
            }
        }

        let velocity = mean(agent_velocities.iter().map(|v| v.velocity_per_minute));
        let any_working = agents.iter().any(|a| a.status.is_active());
        let direction = if velocity <= 0.0 {
            if any_working {
                TrendDirection::Stalled
            } else {
                TrendDirection::Steady
            }
        } else {
            classify(mean(early_rates.into_iter()), mean(late_rates.into_iter()))
        };

        let tasks = self.graph.all_tasks()?;
        let efficiency = estimate_efficiency(&tasks);

        let mut actions = Vec::new();
        for agent in agents.iter().filter(|a| a.status.is_active()) {
            let stalled = agent.is_stale(self.stale_threshold, now)
                || agent_velocities
                    .iter()
                    .any(|v| v.agent_id == agent.agent_id && v.velocity_per_minute <= 0.0);
            if stalled {
                actions.push(RecommendedAction::InvestigateStalledAgent {
                    agent_id: agent.agent_id.clone(),
                });
            }
        }

        let idle_agents = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .count();
        let executable_tasks = self.graph.get_executable_tasks()?.len();
        if idle_agents > 0 && executable_tasks > 0 {
            actions.push(RecommendedAction::RebalanceWork {
                idle_agents,
                executable_tasks,
            });
        }

        let blocked_tasks = self.graph.blocked_tasks()?.len();
        let in_progress = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        if blocked_tasks > 0 && executable_tasks == 0 && in_progress == 0 {
            actions.push(RecommendedAction::ReviewBlockedTasks { blocked_tasks });
        }

        let failed_tasks = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        if failed_tasks > 0 {
            actions.push(RecommendedAction::RetryFailedTasks { failed_tasks });
        }

        if efficiency > 0.0 && efficiency < LOW_EFFICIENCY {
            actions.push(RecommendedAction::ExtendTimeline {
                overrun_ratio: 1.0 / efficiency,
            });
        }

        if actions.is_empty() {
            actions.push(RecommendedAction::NoActionNeeded);
        }

        Ok(ProgressTrend {
            velocity_per_minute: velocity,
            agent_velocities,
            efficiency,
            direction,
            recommended_actions: actions,
            analyzed_at: now,
        })
    }
}

fn remaining_estimate(task: &Task, now: cadence_core::Timestamp) -> Option<Duration> {
    match task.status {
        TaskStatus::Pending => Some(task.estimated_duration),
        TaskStatus::InProgress => {
            let spent = task
                .started_at
                .and_then(|s| (now - s).to_std().ok())
                .unwrap_or_default();
            Some(task.estimated_duration.saturating_sub(spent))
        }
        _ => None,
    }
}

/// Sum of progress increases divided by the sampled span, in points per
/// minute. Drops (a new task restarting at 0) are ignored. `None` with fewer
/// than two samples or a zero span.
fn velocity_per_minute(samples: &[ProgressSample]) -> Option<f64> {
    let (first, last) = (samples.first()?, samples.last()?);
    if samples.len() < 2 {
        return None;
    }
    let span_ms = (last.recorded_at - first.recorded_at).num_milliseconds();
    if span_ms <= 0 {
        return None;
    }
    let gained: f64 = samples
        .windows(2)
        .map(|pair| (pair[1].progress - pair[0].progress).max(0.0))
        .sum();
    Some(gained / (span_ms as f64 / 60_000.0))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn classify(early: f64, late: f64) -> TrendDirection {
    if early <= 0.0 {
        return if late > 0.0 {
            TrendDirection::Accelerating
        } else {
            TrendDirection::Steady
        };
    }
    let change = (late - early) / early;
    if change > STEADY_BAND {
        TrendDirection::Accelerating
    } else if change < -STEADY_BAND {
        TrendDirection::Slowing
    } else {
        TrendDirection::Steady
    }
}

/// Estimated over actual duration across completed tasks that recorded
/// one. 1.0 when nothing has been measured yet.
fn estimate_efficiency(tasks: &[Task]) -> f64 {
    let (estimated, actual) = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| t.actual_duration.map(|a| (t.estimated_duration, a)))
        .fold((Duration::ZERO, Duration::ZERO), |(e, a), (te, ta)| {
            (e.saturating_add(te), a.saturating_add(ta))
        });
    if actual.is_zero() || estimated.is_zero() {
        1.0
    } else {
        estimated.as_secs_f64() / actual.as_secs_f64()
    }
}
