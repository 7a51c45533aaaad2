//! Final session report and process exit codes.

use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::core::task::{ReasonCode, TaskId, TaskStatus};
use crate::state::{OrchestrationState, SessionId};

/// Every task COMPLETED, or a plan printed.
pub const OK: i32 = 0;
/// Some task ended PARTIAL, SKIPPED or FAILED.
pub const DEGRADED: i32 = 1;
/// The session refused to start: cyclic dependency or invalid input.
pub const REFUSED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    DegradedSuccess,
    Failure,
}

impl SessionOutcome {
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a TaskStatus>) -> Self {
        let mut all_completed = true;
        for status in statuses {
            match status {
                TaskStatus::Failed => return SessionOutcome::Failure,
                TaskStatus::Completed => {}
                _ => all_completed = false,
            }
        }
        if all_completed {
            SessionOutcome::Success
        } else {
            SessionOutcome::DegradedSuccess
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Success => OK,
            SessionOutcome::DegradedSuccess | SessionOutcome::Failure => DEGRADED,
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Success => write!(f, "success"),
            SessionOutcome::DegradedSuccess => write!(f, "degraded success"),
            SessionOutcome::Failure => write!(f, "failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub status: TaskStatus,
    pub reason: Option<ReasonCode>,
    pub allocation: f64,
    pub consumed: f64,
    pub iterations: usize,
    pub completion_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub total_budget: f64,
    pub remaining_budget: f64,
    pub commitment: u8,
    /// In topological order.
    pub tasks: Vec<TaskReport>,
}

impl SessionReport {
    /// Build the report, listing tasks in `order`.
    pub fn from_state(state: &OrchestrationState, order: &[TaskId]) -> Self {
        let tasks: Vec<TaskReport> = order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|task| TaskReport {
                id: task.id().clone(),
                status: task.status,
                reason: task.reason,
                allocation: task.allocation(),
                consumed: task.consumed,
                iterations: task.history.len(),
                completion_ratio: task.last_ratio(),
            })
            .collect();
        Self {
            session_id: state.session_id,
            outcome: SessionOutcome::from_statuses(tasks.iter().map(|t| &t.status)),
            total_budget: state.ledger.total(),
            remaining_budget: state.ledger.remaining(),
            commitment: state.ledger.commitment().value(),
            tasks,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }

    /// Human-readable summary, one line per task.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "session {} ({})", self.session_id.short(), self.outcome);
        let _ = writeln!(
            out,
            "budget {:.1}/{:.1} remaining, commitment {}/5",
            self.remaining_budget, self.total_budget, self.commitment
        );
        let width = self
            .tasks
            .iter()
            .map(|t| t.id.as_str().len())
            .max()
            .unwrap_or(0);
        for task in &self.tasks {
            let reason = task.reason.map(|r| r.to_string()).unwrap_or_default();
            let _ = writeln!(
                out,
                "  {:<width$}  {:<11}  {:>3.0}%  {:>2} iter  {:>6.1}/{:<6.1} {}",
                task.id.as_str(),
                task.status.to_string(),
                task.completion_ratio * 100.0,
                task.iterations,
                task.consumed,
                task.allocation,
                reason,
                width = width
            );
        }
        out
    }
}
