//! Task data model for the dependency graph.
//!
//! Tasks are the schedulable units of work. Each task tracks its declared
//! dependencies, complexity class, budget allocation, lifecycle status and
//! the history of refinement iterations run against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::iteration::IterationRecord;
use crate::error::{Error, Result};

/// Unique identity of a task: its name.
///
/// Ordering is lexical, which is what the scheduler's tie-break relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TaskId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Estimated complexity class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Budget multiplier applied by the allocator.
    pub fn multiplier(&self) -> f64 {
        match self {
            Complexity::Low => 1.0,
            Complexity::Medium => 1.5,
            Complexity::High => 2.2,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// Task status in its lifecycle.
///
/// Only the orchestrator mutates a task's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet resolved.
    #[default]
    Pending,
    /// Dependencies resolved, waiting to be dispatched.
    Ready,
    /// The iteration controller is driving this task.
    InProgress,
    /// Reached the confidence threshold.
    Completed,
    /// Accepted below the confidence threshold.
    Partial,
    /// Not executed, or abandoned without acceptance.
    Skipped,
    /// The executor failed twice in a row.
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Partial => write!(f, "partial"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Resolved tasks unblock their dependents.
    pub fn is_resolved(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Partial)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Partial | TaskStatus::Skipped | TaskStatus::Failed
        )
    }
}

/// Why a task ended in PARTIAL, SKIPPED or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Thrashing,
    Oscillation,
    ScopeCreep,
    DiminishingReturns,
    IterationLimit,
    BudgetExhausted,
    /// Commitment reached its maximum through spirals while budget remained.
    CommitmentSaturated,
    ExecutorFailure,
    DependencyFailed,
    DependencySkipped,
    Escalated,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ReasonCode::Thrashing => "THRASHING",
            ReasonCode::Oscillation => "OSCILLATION",
            ReasonCode::ScopeCreep => "SCOPE_CREEP",
            ReasonCode::DiminishingReturns => "DIMINISHING_RETURNS",
            ReasonCode::IterationLimit => "ITERATION_LIMIT",
            ReasonCode::BudgetExhausted => "BUDGET_EXHAUSTED",
            ReasonCode::CommitmentSaturated => "COMMITMENT_SATURATED",
            ReasonCode::ExecutorFailure => "EXECUTOR_FAILURE",
            ReasonCode::DependencyFailed => "DEPENDENCY_FAILED",
            ReasonCode::DependencySkipped => "DEPENDENCY_SKIPPED",
            ReasonCode::Escalated => "ESCALATED",
        };
        write!(f, "{}", code)
    }
}

/// Declared definition of a task, as read from a task definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: TaskId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub complexity: Complexity,
    /// Artifacts the task is expected to touch. Empty means unrestricted.
    #[serde(default)]
    pub scope: BTreeSet<String>,
}

impl TaskSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: TaskId::from(name),
            description: String::new(),
            depends_on: Vec::new(),
            complexity: Complexity::default(),
            scope: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.depends_on.push(TaskId::from(dependency));
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_scope<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = artifacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// A single task in the orchestration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// The declared definition.
    pub spec: TaskSpec,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Reason attached to a PARTIAL, SKIPPED or FAILED outcome.
    pub reason: Option<ReasonCode>,
    /// Budget allocation assigned once during planning.
    allocation: Option<f64>,
    /// Budget actually deducted for this task.
    pub consumed: f64,
    /// Completed iterations, in order.
    pub history: Vec<IterationRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from its definition.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
            reason: None,
            allocation: None,
            consumed: 0.0,
            history: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.name
    }

    /// The budget allocation, or 0.0 before planning.
    pub fn allocation(&self) -> f64 {
        self.allocation.unwrap_or(0.0)
    }

    pub fn has_allocation(&self) -> bool {
        self.allocation.is_some()
    }

    /// Assign the budget allocation.
    ///
    /// # Errors
    /// Returns an error if an allocation was already assigned.
    pub fn set_allocation(&mut self, amount: f64) -> Result<()> {
        if self.allocation.is_some() {
            return Err(Error::AllocationAlreadySet(self.id().clone()));
        }
        self.allocation = Some(amount);
        Ok(())
    }

    /// Completion ratio reported by the latest iteration, or 0.0.
    pub fn last_ratio(&self) -> f64 {
        self.history
            .last()
            .map(|r| r.completion_ratio)
            .unwrap_or(0.0)
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Finish the task with a terminal status.
    pub fn finish(&mut self, status: TaskStatus, reason: Option<ReasonCode>) {
        self.status = status;
        self.reason = reason;
        self.completed_at = Some(Utc::now());
    }

    /// Return an interrupted task to PENDING, discarding its partial history.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.reason = None;
        self.history.clear();
        self.started_at = None;
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can be dispatched (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }
}
