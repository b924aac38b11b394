//! Task and dependency edge types

use crate::{
    duration_ms, AgentId, CadenceError, CadenceResult, DependencyKind, TaskId, TaskPriority,
    TaskStatus, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

/// A unit of work in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Non-owning reference to the agent working on this task.
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    #[serde(with = "duration_ms", default)]
    pub estimated_duration: Duration,
    #[serde(with = "duration_ms::option", default)]
    pub actual_duration: Option<Duration>,
    #[serde(default)]
    pub required_resources: BTreeSet<String>,
    #[serde(default = "Utc::now")]
    pub created_at: Timestamp,
    #[serde(default = "Utc::now")]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            assigned_agent: None,
            estimated_duration: Duration::ZERO,
            actual_duration: None,
            required_resources: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Validate fields a caller controls before the task enters a graph.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(CadenceError::invalid_input("task.id", "must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(CadenceError::invalid_input(
                "task.title",
                format!("task {} has an empty title", self.id),
            ));
        }
        if self.required_resources.iter().any(|r| r.trim().is_empty()) {
            return Err(CadenceError::invalid_input(
                "task.required_resources",
                format!("task {} names an empty resource", self.id),
            ));
        }
        Ok(())
    }

    /// Move the task to `next`, enforcing the status table.
    ///
    /// Cancelling an already cancelled task is a no-op.
    pub fn transition_to(&mut self, next: TaskStatus) -> CadenceResult<()> {
        if self.status == TaskStatus::Cancelled && next == TaskStatus::Cancelled {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CadenceError::invalid_input(
                "task.status",
                format!("task {} cannot move from {} to {}", self.id, self.status, next),
            ));
        }
        let now = Utc::now();
        if next == TaskStatus::InProgress {
            self.started_at = Some(now);
        }
        if matches!(next, TaskStatus::Completed | TaskStatus::Failed)
            && self.actual_duration.is_none()
        {
            self.actual_duration = self
                .started_at
                .and_then(|started| (now - started).to_std().ok());
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Scheduling order for executable tasks: priority descending, then
/// creation time ascending, then id for a total order.
pub fn scheduling_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Ordered pair `(task, depends_on)`: `task` cannot run until `depends_on`
/// is Completed when the edge is hard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub task: TaskId,
    pub depends_on: TaskId,
    #[serde(default)]
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn hard(task: impl Into<TaskId>, depends_on: impl Into<TaskId>) -> Self {
        Self {
            task: task.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Hard,
        }
    }

    pub fn soft(task: impl Into<TaskId>, depends_on: impl Into<TaskId>) -> Self {
        Self {
            task: task.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::Soft,
        }
    }
}
