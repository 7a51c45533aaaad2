//! Session scheduler.
//!
//! The Orchestrator owns the session state. It dispatches ready tasks in
//! lexical order (up to `parallelism` at once) to iteration controllers,
//! deducts what each task consumed from the shared ledger, propagates
//! failures to dependents and checkpoints after every task transition.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::dag::DependencyGraph;
use crate::core::task::{ReasonCode, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::executor::{TaskContext, TaskExecutor};
use crate::orchestration::controller::{IterationController, TaskOutcome};
use crate::orchestration::escalation::{NoOperator, Operator};
use crate::orchestration::ledger::SharedLedger;
use crate::orchestration::panel::Verdict;
use crate::orchestration::spiral::SpiralSignal;
use crate::planning::plan;
use crate::report::{SessionOutcome, SessionReport};
use crate::state::{CheckpointStore, OrchestrationState, SessionId};

/// Events emitted while a session runs.
///
/// These let a caller follow progress without polling the checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    SessionStarted {
        session: SessionId,
        tasks: usize,
    },
    TaskStarted {
        task: TaskId,
        allocation: f64,
        dependents_waiting: bool,
    },
    IterationFinished {
        task: TaskId,
        index: u32,
        completion_ratio: f64,
    },
    SpiralDetected {
        task: TaskId,
        signal: SpiralSignal,
        commitment: u8,
    },
    PanelDecided {
        task: TaskId,
        verdict: Verdict,
        forced: bool,
    },
    /// The panel handed the task to the operator.
    Escalated {
        task: TaskId,
    },
    TaskFinished {
        task: TaskId,
        status: TaskStatus,
        reason: Option<ReasonCode>,
    },
    /// Remaining budget hit zero; every later task runs in force mode.
    BudgetExhausted,
    SessionFinished {
        outcome: SessionOutcome,
    },
}

pub struct Orchestrator {
    state: OrchestrationState,
    graph: DependencyGraph,
    order: Vec<TaskId>,
    executor: Arc<dyn TaskExecutor>,
    operator: Arc<dyn Operator>,
    store: Arc<dyn CheckpointStore>,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Plan a new session.
    ///
    /// # Errors
    /// Structural errors (cycle, unknown dependency, duplicate task) and
    /// invalid configuration are returned before anything runs.
    pub fn new(
        specs: &[TaskSpec],
        config: Config,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (_, plan) = plan(specs, config.total_budget, config.base_unit)?;
        let state = OrchestrationState::new(specs, &plan.allocation, config)?;
        Self::from_state(state, executor, store)
    }

    /// Take over an existing state, rebuilding the graph from its task
    /// definitions.
    pub fn from_state(
        state: OrchestrationState,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        state.check_version()?;
        if let Some(task) = state.tasks.values().find(|t| !t.has_allocation()) {
            return Err(Error::InvalidInput(format!("task {} has no allocation", task.id())));
        }
        let graph = DependencyGraph::build(&state.specs())?;
        let order = graph.topological_order();
        Ok(Self {
            state,
            graph,
            order,
            executor,
            operator: Arc::new(NoOperator),
            store,
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Resume a checkpointed session.
    ///
    /// Tasks that were in progress when the session stopped start over.
    pub async fn resume(
        session: SessionId,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        let mut state = store
            .load_checkpoint(session)
            .await?
            .ok_or_else(|| Error::CheckpointNotFound(session.to_string()))?;
        state.prepare_resume();
        info!(session = %session, "resuming session");
        Self::from_state(state, executor, store)
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.state.session_id
    }

    pub fn state(&self) -> &OrchestrationState {
        &self.state
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Tasks in the order they are scheduled and reported.
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    /// Run the session to completion.
    ///
    /// # Errors
    /// `SessionLocked` if another orchestrator owns the session,
    /// `Persistence` if a checkpoint cannot be written, and `Cancelled` if
    /// the session token fired. Task failures are reported, not returned.
    pub async fn run(&mut self) -> Result<SessionReport> {
        let session = self.state.session_id;
        self.store.acquire_lock(session).await?;
        let result = self.drive().await;
        let released = self.store.release_lock(session).await;
        let report = result?;
        released?;
        Ok(report)
    }

    async fn drive(&mut self) -> Result<SessionReport> {
        let session = self.state.session_id;
        let ledger = SharedLedger::new(self.state.ledger.clone());
        let controller = IterationController::new(
            Arc::clone(&self.executor),
            ledger.clone(),
            self.state.settings.controller_config(),
        )
        .with_detector(self.state.settings.spiral)
        .with_panel(self.state.settings.panel)
        .with_operator(Arc::clone(&self.operator))
        .with_cancellation(self.cancel.clone())
        .with_events(self.events.clone());
        let parallelism = self.state.settings.parallelism.max(1);

        info!(
            session = %session,
            tasks = self.state.tasks.len(),
            budget = self.state.ledger.remaining(),
            parallelism,
            "session started"
        );
        self.emit(OrchestratorEvent::SessionStarted {
            session,
            tasks: self.state.tasks.len(),
        })
        .await;

        // A resumed checkpoint may hold failures whose dependents were
        // not yet skipped.
        let unresolved: Vec<TaskId> = self
            .state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
            .map(|t| t.id().clone())
            .collect();
        for id in unresolved {
            self.propagate(&id).await?;
        }
        self.checkpoint(&ledger).await?;

        let mut running = FuturesUnordered::new();
        let mut claimed: BTreeSet<TaskId> = BTreeSet::new();
        let mut cancelled = false;

        loop {
            if !self.cancel.is_cancelled() {
                let ready = self.graph.ready(&self.state.statuses());
                self.mark_ready(&ready)?;
                for id in ready {
                    if running.len() >= parallelism {
                        break;
                    }
                    if !self.state.task(&id)?.can_start() || !claimed.insert(id.clone()) {
                        continue;
                    }
                    let waiting = self.dependents_waiting(&id);
                    let ctx = {
                        let task = self.state.task_mut(&id)?;
                        task.start();
                        TaskContext {
                            id: id.clone(),
                            description: task.spec.description.clone(),
                            scope: task.spec.scope.clone(),
                            allocation: task.allocation(),
                            history: task.history.clone(),
                        }
                    };
                    info!(task = %id, allocation = ctx.allocation, "task dispatched");
                    self.emit(OrchestratorEvent::TaskStarted {
                        task: id.clone(),
                        allocation: ctx.allocation,
                        dependents_waiting: waiting,
                    })
                    .await;
                    self.checkpoint(&ledger).await?;

                    let controller = controller.clone();
                    running.push(async move {
                        let result = controller.run(ctx, waiting).await;
                        (id, result)
                    });
                }
            }

            let Some((id, result)) = running.next().await else {
                break;
            };
            claimed.remove(&id);
            match result {
                Ok(outcome) => self.record(outcome, &ledger).await?,
                Err(Error::Cancelled) => {
                    debug!(task = %id, "task interrupted by cancellation");
                    cancelled = true;
                }
                Err(e) => return Err(e),
            }
        }

        if cancelled || self.cancel.is_cancelled() {
            warn!(session = %session, "session cancelled");
            self.checkpoint(&ledger).await?;
            return Err(Error::Cancelled);
        }

        let report = SessionReport::from_state(&self.state, &self.order);
        info!(
            session = %session,
            outcome = %report.outcome,
            remaining = report.remaining_budget,
            commitment = report.commitment,
            "session finished"
        );
        self.emit(OrchestratorEvent::SessionFinished {
            outcome: report.outcome,
        })
        .await;
        Ok(report)
    }

    /// Unblocked tasks still PENDING become READY.
    fn mark_ready(&mut self, ready: &BTreeSet<TaskId>) -> Result<()> {
        for id in ready {
            let task = self.state.task_mut(id)?;
            if task.status == TaskStatus::Pending {
                task.mark_ready();
                debug!(task = %id, "task ready");
            }
        }
        Ok(())
    }

    /// Integrator snapshot: some dependent has already started.
    fn dependents_waiting(&self, id: &TaskId) -> bool {
        self.graph.dependents(id).iter().any(|dependent| {
            self.state
                .tasks
                .get(dependent)
                .is_some_and(|t| t.started_at.is_some())
        })
    }

    async fn record(&mut self, outcome: TaskOutcome, ledger: &SharedLedger) -> Result<()> {
        let id = outcome.task.clone();
        let allocation = self.state.task(&id)?.allocation();
        let max_iterations = self.state.settings.max_iterations.max(1);
        let consumption = allocation * f64::from(outcome.iterations_used) / f64::from(max_iterations);
        let deduction = ledger.deduct(consumption).await;

        let task = self.state.task_mut(&id)?;
        task.consumed = deduction.deducted;
        task.history = outcome.history;
        task.finish(outcome.status, outcome.reason);

        match outcome.status {
            TaskStatus::Failed => warn!(task = %id, reason = ?outcome.reason, "task failed"),
            status => info!(
                task = %id,
                %status,
                reason = ?outcome.reason,
                iterations = outcome.iterations_used,
                consumed = deduction.deducted,
                remaining = deduction.remaining,
                commitment = %deduction.commitment,
                "task finished"
            ),
        }
        self.emit(OrchestratorEvent::TaskFinished {
            task: id.clone(),
            status: outcome.status,
            reason: outcome.reason,
        })
        .await;
        if deduction.exhausted_now {
            self.emit(OrchestratorEvent::BudgetExhausted).await;
        }

        if matches!(outcome.status, TaskStatus::Failed | TaskStatus::Skipped) {
            self.propagate(&id).await?;
        }
        self.checkpoint(ledger).await
    }

    /// Skip everything downstream of a failed or skipped task.
    async fn propagate(&mut self, origin: &TaskId) -> Result<()> {
        let reason = if self.state.task(origin)?.status == TaskStatus::Failed {
            ReasonCode::DependencyFailed
        } else {
            ReasonCode::DependencySkipped
        };
        let mut skipped = Vec::new();
        for id in self.graph.transitive_dependents(origin) {
            let task = self.state.task_mut(&id)?;
            if !task.is_finished() {
                task.finish(TaskStatus::Skipped, Some(reason));
                skipped.push(id);
            }
        }
        for id in skipped {
            info!(task = %id, origin = %origin, %reason, "task skipped");
            self.emit(OrchestratorEvent::TaskFinished {
                task: id,
                status: TaskStatus::Skipped,
                reason: Some(reason),
            })
            .await;
        }
        Ok(())
    }

    async fn checkpoint(&mut self, ledger: &SharedLedger) -> Result<()> {
        self.state.ledger = ledger.snapshot().await;
        self.state.touch();
        self.store
            .save_checkpoint(self.state.session_id, &self.state)
            .await
            .map_err(|e| match e {
                Error::Persistence(_) => e,
                other => Error::Persistence(other.to_string()),
            })
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}
