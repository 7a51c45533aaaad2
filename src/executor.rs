//! Task executors: the collaborators that perform one iteration of work.
//!
//! The orchestration core never does the work itself. It hands a
//! `TaskContext` to a `TaskExecutor` and receives an `ExecutorReport` with
//! the completion-ratio signal it steers by.
//!
//! `CommandExecutor` runs an external command once per iteration. The task is
//! described through environment variables and the command prints a JSON
//! report as the last line of its stdout:
//!
//! ```json
//! {"touched_artifacts": ["src/api.rs"], "completion_ratio": 0.7, "regression": false}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::iteration::{clamp_ratio, IterationRecord};
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Everything an executor is told about the task it works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: TaskId,
    pub description: String,
    /// Declared scope baseline; empty means unrestricted.
    pub scope: BTreeSet<String>,
    pub allocation: f64,
    /// Iterations completed so far.
    pub history: Vec<IterationRecord>,
}

/// What an executor reports back for one iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutorReport {
    #[serde(default)]
    pub touched_artifacts: BTreeSet<String>,
    pub completion_ratio: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub out_of_scope: bool,
    #[serde(default)]
    pub regression: bool,
}

impl ExecutorReport {
    pub fn new<I, S>(touched: I, completion_ratio: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            touched_artifacts: touched.into_iter().map(Into::into).collect(),
            completion_ratio,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_regression(mut self) -> Self {
        self.regression = true;
        self
    }

    pub fn with_out_of_scope(mut self) -> Self {
        self.out_of_scope = true;
        self
    }

    /// Turn the report into an iteration record.
    ///
    /// Touches outside a non-empty scope baseline mark the record out of
    /// scope even when the executor did not flag them.
    pub fn into_record(self, index: u32, scope: &BTreeSet<String>) -> IterationRecord {
        let outside_scope =
            !scope.is_empty() && self.touched_artifacts.iter().any(|a| !scope.contains(a));
        IterationRecord {
            index,
            touched: self.touched_artifacts,
            completion_ratio: clamp_ratio(self.completion_ratio),
            duration_ms: self.duration_ms,
            out_of_scope: self.out_of_scope || outside_scope,
            regression: self.regression,
        }
    }
}

/// Performs the actual work of one iteration.
///
/// Implementations must tolerate being retried once for the same index, and
/// should stop promptly once `cancel` fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_iteration(
        &self,
        task: &TaskContext,
        index: u32,
        cancel: CancellationToken,
    ) -> Result<ExecutorReport>;
}

/// Runs an external command for every iteration.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    /// Create an executor from a command line split into words.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the command is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("executor command cannot be empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Parse the report from the last non-empty stdout line.
    pub fn parse_report(stdout: &str) -> Result<ExecutorReport> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::Executor("executor printed no report".to_string()))?;
        Ok(serde_json::from_str(line)?)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn run_iteration(
        &self,
        task: &TaskContext,
        index: u32,
        cancel: CancellationToken,
    ) -> Result<ExecutorReport> {
        let scope = task.scope.iter().cloned().collect::<Vec<_>>().join(",");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("KEEL_TASK", task.id.as_str())
            .env("KEEL_ITERATION", index.to_string())
            .env("KEEL_DESCRIPTION", &task.description)
            .env("KEEL_SCOPE", scope)
            .env("KEEL_ALLOCATION", task.allocation.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(task = %task.id, index, program = %self.program, "running executor command");
        let started = Instant::now();
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = command.output() => output?,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "executor exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Executor(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = Self::parse_report(&stdout)?;
        if report.duration_ms == 0 {
            return Ok(report.with_duration(elapsed_ms));
        }
        Ok(report)
    }
}
