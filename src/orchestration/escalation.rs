//! Escalation of stuck tasks to an operator.
//!
//! When the decision panel cannot justify another pass and the partial result
//! is not usable, the task is surfaced with its full history. The operator
//! decides whether to keep the partial result or drop the task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::iteration::IterationRecord;
use crate::core::task::TaskId;
use crate::orchestration::commitment::CommitmentLevel;
use crate::orchestration::panel::Decision;

/// Everything an operator sees about an escalated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub task: TaskId,
    pub history: Vec<IterationRecord>,
    pub decision: Decision,
    pub commitment: CommitmentLevel,
    pub remaining_budget: f64,
}

impl Escalation {
    pub fn last_ratio(&self) -> f64 {
        self.history
            .last()
            .map(|r| r.completion_ratio)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorDecision {
    AcceptPartial,
    Skip,
}

/// Decision point for escalated tasks.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn decide(&self, escalation: &Escalation) -> OperatorDecision;
}

/// Used when nobody is watching: every escalation is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOperator;

#[async_trait]
impl Operator for NoOperator {
    async fn decide(&self, escalation: &Escalation) -> OperatorDecision {
        info!(
            task = %escalation.task,
            ratio = escalation.last_ratio(),
            "escalation without operator, skipping task"
        );
        OperatorDecision::Skip
    }
}

/// Accepts any escalated task whose last ratio reaches a floor.
#[derive(Debug, Clone, Copy)]
pub struct AcceptAbove(pub f64);

#[async_trait]
impl Operator for AcceptAbove {
    async fn decide(&self, escalation: &Escalation) -> OperatorDecision {
        if escalation.last_ratio() >= self.0 {
            OperatorDecision::AcceptPartial
        } else {
            OperatorDecision::Skip
        }
    }
}
