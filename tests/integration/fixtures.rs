//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted executors replaying per-task iteration results
//! - Collecting orchestrator events
//! - Building sessions with fixed allocations

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use keel::config::Config;
use keel::core::task::{TaskId, TaskSpec};
use keel::executor::{ExecutorReport, TaskContext, TaskExecutor};
use keel::planning::Allocation;
use keel::{Error, OrchestrationState, OrchestratorEvent, Result};

/// One scripted iteration result.
#[derive(Debug, Clone)]
pub enum Step {
    Report(ExecutorReport),
    Fail(String),
    /// Wait for the call's cancellation token, then report cancellation.
    Hang,
}

impl Step {
    pub fn ok(ratio: f64, touched: &[&str]) -> Self {
        Step::Report(ExecutorReport::new(touched.iter().copied(), ratio))
    }

    pub fn regression(ratio: f64, touched: &[&str]) -> Self {
        Step::Report(ExecutorReport::new(touched.iter().copied(), ratio).with_regression())
    }

    pub fn fail(message: &str) -> Self {
        Step::Fail(message.to_string())
    }
}

/// Executor that replays a script per task.
///
/// Each call consumes the next step of the task's script; once the script
/// runs out the last step repeats. Optionally sleeps per call and cancels a
/// token when a given task starts.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    cursor: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(String, u32)>>,
    delay: Option<Duration>,
    cancel_on: Option<(String, CancellationToken)>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().insert(task.to_string(), steps);
        self
    }

    /// Every task completes on its first iteration.
    pub fn completing(self, tasks: &[&str]) -> Self {
        tasks
            .iter()
            .fold(self, |exec, task| exec.script(task, vec![Step::ok(1.0, &[*task])]))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel `token` as soon as `task` is first executed.
    pub fn cancel_when(mut self, task: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((task.to_string(), token));
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Every call made, as (task, iteration index).
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    /// Tasks in the order they were first executed.
    pub fn tasks_started(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (task, _) in self.calls() {
            if !seen.contains(&task) {
                seen.push(task);
            }
        }
        seen
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.calls().iter().filter(|(t, _)| t == task).count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_step(&self, task: &str) -> Option<Step> {
        let scripts = self.scripts.lock().unwrap();
        let steps = scripts.get(task)?;
        let mut cursor = self.cursor.lock().unwrap();
        let position = cursor.entry(task.to_string()).or_insert(0);
        let step = steps.get(*position).or_else(|| steps.last()).cloned();
        *position += 1;
        step
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn run_iteration(
        &self,
        task: &TaskContext,
        index: u32,
        cancel: CancellationToken,
    ) -> Result<ExecutorReport> {
        self.calls
            .lock()
            .unwrap()
            .push((task.id.to_string(), index));
        if let Some((target, token)) = &self.cancel_on {
            if target == task.id.as_str() {
                token.cancel();
            }
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.next_step(task.id.as_str());
        let result = match step {
            Some(Step::Report(report)) => Ok(report),
            Some(Step::Fail(message)) => Err(Error::Executor(message)),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
            None => Err(Error::Executor(format!("no script for {}", task.id))),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Drain events in the background; await the handle after the run.
pub fn collect_events() -> (mpsc::Sender<OrchestratorEvent>, JoinHandle<Vec<OrchestratorEvent>>) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, handle)
}

/// Independent low-complexity tasks.
pub fn independent(names: &[&str]) -> Vec<TaskSpec> {
    names.iter().map(|name| TaskSpec::new(name)).collect()
}

pub fn config(total_budget: f64) -> Config {
    Config {
        total_budget,
        ..Config::default()
    }
}

/// A fresh session whose allocations are fixed rather than planned.
pub fn state_with_allocations(
    specs: &[TaskSpec],
    amount: f64,
    settings: Config,
) -> OrchestrationState {
    let per_task: BTreeMap<TaskId, f64> = specs.iter().map(|s| (s.name.clone(), amount)).collect();
    let allocation = Allocation {
        per_task,
        rescale_factor: 1.0,
    };
    OrchestrationState::new(specs, &allocation, settings).unwrap()
}
