//! Durable orchestration state and the stores that checkpoint it.
//!
//! An `OrchestrationState` is everything needed to resume a session: the
//! task definitions (and so the dependency graph), every task's status,
//! allocation and history, and the budget ledger.

mod store;

pub use store::{CheckpointStore, FileStore, MemoryStore, CHECKPOINT_FILE, LOCK_FILE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::ledger::Ledger;
use crate::planning::Allocation;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub version: u32,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub ledger: Ledger,
    /// Configuration the session was planned with.
    pub settings: Config,
}

impl OrchestrationState {
    /// Create a fresh state with every task pending and allocated.
    ///
    /// # Errors
    /// Returns `TaskNotFound` if a task has no allocation.
    pub fn new(specs: &[TaskSpec], allocation: &Allocation, settings: Config) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for spec in specs {
            let amount = allocation
                .get(&spec.name)
                .ok_or_else(|| Error::TaskNotFound(spec.name.clone()))?;
            let mut task = Task::new(spec.clone());
            task.set_allocation(amount)?;
            tasks.insert(spec.name.clone(), task);
        }
        let now = Utc::now();
        Ok(Self {
            version: STATE_VERSION,
            session_id: SessionId::new(),
            created_at: now,
            updated_at: now,
            tasks,
            ledger: Ledger::new(settings.total_budget, &settings.commitment_thresholds),
            settings,
        })
    }

    pub fn specs(&self) -> Vec<TaskSpec> {
        self.tasks.values().map(|t| t.spec.clone()).collect()
    }

    pub fn statuses(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.status))
            .collect()
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Whether every task reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(Task::is_finished)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn check_version(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(Error::UnsupportedStateVersion {
                found: self.version,
                expected: STATE_VERSION,
            });
        }
        Ok(())
    }

    /// Return interrupted tasks to PENDING before a resume.
    ///
    /// Their budget was never deducted, so their partial history goes too.
    pub fn prepare_resume(&mut self) -> Vec<TaskId> {
        let mut reset = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            if task.status == TaskStatus::InProgress {
                task.reset();
                reset.push(id.clone());
            }
        }
        if !reset.is_empty() {
            info!(session = %self.session_id, count = reset.len(), "reset interrupted tasks");
        }
        reset
    }
}
