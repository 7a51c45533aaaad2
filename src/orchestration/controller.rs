//! Per-task iteration state machine.
//!
//! ```text
//! NOT_STARTED -> ITERATING -> (DONE | LIMIT_REACHED)
//!                    ^              |
//!                    +-- CONTINUE --+   (at most once per task)
//! ```
//!
//! The controller drives one task from its first iteration to a terminal
//! resolution. It never touches the budget; it reads the commitment level
//! from the shared ledger and raises it when a spiral is detected.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::iteration::IterationRecord;
use crate::core::task::{ReasonCode, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::executor::{ExecutorReport, TaskContext, TaskExecutor};
use crate::orchestration::escalation::{Escalation, NoOperator, Operator, OperatorDecision};
use crate::orchestration::ledger::SharedLedger;
use crate::orchestration::orchestrator::OrchestratorEvent;
use crate::orchestration::panel::{Decision, DecisionPanel, PanelInput, Verdict};
use crate::orchestration::spiral::{SpiralDetector, SpiralSignal};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.9;
pub const DEFAULT_ITERATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    Iterating,
    LimitReached,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    /// Ratio at which a task counts as completed.
    pub confidence_threshold: f64,
    /// Wall-clock limit for a single executor call.
    pub iteration_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iteration_timeout: DEFAULT_ITERATION_TIMEOUT,
        }
    }
}

/// Terminal result of driving one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub status: TaskStatus,
    pub reason: Option<ReasonCode>,
    pub history: Vec<IterationRecord>,
    /// Iterations whose executor call succeeded.
    pub iterations_used: u32,
    /// Panel decision, if the task reached its limit.
    pub decision: Option<Decision>,
    /// Set if the task went to the operator.
    pub escalated: bool,
}

impl TaskOutcome {
    fn new(task: TaskId, status: TaskStatus, reason: Option<ReasonCode>) -> Self {
        Self {
            task,
            status,
            reason,
            history: Vec::new(),
            iterations_used: 0,
            decision: None,
            escalated: false,
        }
    }
}

/// Drives tasks through their iterations.
///
/// Cheap to clone; parallel task loops each get their own copy sharing the
/// executor, operator and ledger.
#[derive(Clone)]
pub struct IterationController {
    executor: Arc<dyn TaskExecutor>,
    operator: Arc<dyn Operator>,
    ledger: SharedLedger,
    detector: SpiralDetector,
    panel: DecisionPanel,
    config: ControllerConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl IterationController {
    pub fn new(executor: Arc<dyn TaskExecutor>, ledger: SharedLedger, config: ControllerConfig) -> Self {
        Self {
            executor,
            operator: Arc::new(NoOperator),
            ledger,
            detector: SpiralDetector::default(),
            panel: DecisionPanel::default(),
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_detector(mut self, detector: SpiralDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_panel(mut self, panel: DecisionPanel) -> Self {
        self.panel = panel;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Option<mpsc::Sender<OrchestratorEvent>>) -> Self {
        self.events = events;
        self
    }

    /// Drive a task to its terminal resolution.
    ///
    /// `dependents_waiting` is the integrator's snapshot, taken when the task
    /// was dispatched.
    ///
    /// # Errors
    /// Returns `Cancelled` if the session was cancelled. Executor failures
    /// are not errors; they resolve the task as FAILED.
    pub async fn run(&self, mut ctx: TaskContext, dependents_waiting: bool) -> Result<TaskOutcome> {
        let mut state = ControllerState::NotStarted;
        let mut limit = self.config.max_iterations;
        let mut extra_pass_used = false;
        let mut limit_reason = ReasonCode::IterationLimit;
        let mut decision = None;
        let mut escalated = false;

        let (status, reason) = loop {
            match state {
                ControllerState::NotStarted => {
                    debug!(task = %ctx.id, allocation = ctx.allocation, "controller started");
                    state = ControllerState::Iterating;
                }
                ControllerState::Iterating => {
                    let index = ctx.history.len() as u32 + 1;
                    if index > 1 && self.ledger.commitment().await.forces_completion() {
                        debug!(task = %ctx.id, index, "commitment gate closed, forcing limit");
                        limit_reason = self.forced_reason().await;
                        state = ControllerState::LimitReached;
                        continue;
                    }

                    let report = match self.attempt(&ctx, index).await {
                        Ok(report) => report,
                        Err(e) if self.cancel.is_cancelled() => {
                            debug!(task = %ctx.id, error = %e, "iteration abandoned on cancellation");
                            return Err(Error::Cancelled);
                        }
                        Err(e) => {
                            warn!(task = %ctx.id, index, error = %e, "executor failed twice");
                            break (TaskStatus::Failed, Some(ReasonCode::ExecutorFailure));
                        }
                    };

                    let record = report.into_record(index, &ctx.scope);
                    let ratio = record.completion_ratio;
                    ctx.history.push(record);
                    self.emit(OrchestratorEvent::IterationFinished {
                        task: ctx.id.clone(),
                        index,
                        completion_ratio: ratio,
                    })
                    .await;

                    if ratio >= self.config.confidence_threshold {
                        state = ControllerState::Done;
                        continue;
                    }

                    let signal = self.detector.classify(&ctx.history);
                    if signal.is_spiral() {
                        let commitment = self.ledger.raise_commitment().await;
                        info!(task = %ctx.id, index, %signal, %commitment, "spiral detected");
                        self.emit(OrchestratorEvent::SpiralDetected {
                            task: ctx.id.clone(),
                            signal,
                            commitment: commitment.value(),
                        })
                        .await;
                        if commitment.exits_on_spiral() {
                            limit_reason = spiral_reason(signal);
                            state = ControllerState::LimitReached;
                            continue;
                        }
                    }

                    if index >= limit {
                        state = ControllerState::LimitReached;
                    }
                }
                ControllerState::LimitReached => {
                    let input = PanelInput {
                        completion_ratio: ctx.history.last().map(|r| r.completion_ratio).unwrap_or(0.0),
                        remaining_budget: self.ledger.remaining().await,
                        allocation: ctx.allocation,
                        dependents_waiting,
                        regression: ctx.history.last().is_some_and(|r| r.regression),
                        commitment: self.ledger.commitment().await,
                        extra_pass_available: !extra_pass_used,
                    };
                    let verdict = self.panel.decide(&input);
                    decision = Some(verdict);
                    self.emit(OrchestratorEvent::PanelDecided {
                        task: ctx.id.clone(),
                        verdict: verdict.verdict,
                        forced: verdict.forced,
                    })
                    .await;

                    match verdict.verdict {
                        Verdict::Continue => {
                            info!(task = %ctx.id, score = verdict.score, "panel granted an extra iteration");
                            extra_pass_used = true;
                            limit = ctx.history.len() as u32 + 1;
                            state = ControllerState::Iterating;
                        }
                        Verdict::AcceptPartial => {
                            let reason = if verdict.forced {
                                self.forced_reason().await
                            } else {
                                limit_reason
                            };
                            break (TaskStatus::Partial, Some(reason));
                        }
                        Verdict::Skip => {
                            break (TaskStatus::Skipped, Some(self.forced_reason().await));
                        }
                        Verdict::Escalate => {
                            escalated = true;
                            let escalation = Escalation {
                                task: ctx.id.clone(),
                                history: ctx.history.clone(),
                                decision: verdict,
                                commitment: input.commitment,
                                remaining_budget: input.remaining_budget,
                            };
                            self.emit(OrchestratorEvent::Escalated { task: ctx.id.clone() }).await;
                            let status = match self.operator.decide(&escalation).await {
                                OperatorDecision::AcceptPartial => TaskStatus::Partial,
                                OperatorDecision::Skip => TaskStatus::Skipped,
                            };
                            break (status, Some(ReasonCode::Escalated));
                        }
                    }
                }
                ControllerState::Done => break (TaskStatus::Completed, None),
            }
        };

        let mut outcome = TaskOutcome::new(ctx.id, status, reason);
        outcome.iterations_used = ctx.history.len() as u32;
        outcome.history = ctx.history;
        outcome.decision = decision;
        outcome.escalated = escalated;
        Ok(outcome)
    }

    /// Run one iteration, retrying once on error.
    async fn attempt(&self, ctx: &TaskContext, index: u32) -> Result<ExecutorReport> {
        match self.call(ctx, index).await {
            Ok(report) => Ok(report),
            Err(e) if self.cancel.is_cancelled() => Err(e),
            Err(e) => {
                warn!(task = %ctx.id, index, error = %e, "executor error, retrying once");
                self.call(ctx, index).await
            }
        }
    }

    async fn call(&self, ctx: &TaskContext, index: u32) -> Result<ExecutorReport> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let token = self.cancel.child_token();
        let timeout = self.config.iteration_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.executor.run_iteration(ctx, index, token.clone())) => {
                match result {
                    Ok(report) => report,
                    Err(_) => {
                        token.cancel();
                        Err(Error::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Reason for a force-mode resolution.
    async fn forced_reason(&self) -> ReasonCode {
        if self.ledger.remaining().await <= 0.0 {
            ReasonCode::BudgetExhausted
        } else {
            ReasonCode::CommitmentSaturated
        }
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

fn spiral_reason(signal: SpiralSignal) -> ReasonCode {
    signal.reason().unwrap_or(ReasonCode::IterationLimit)
}
