//! Checkpoint, interruption and resume against the file store.

use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use keel::config::Config;
use keel::core::task::{TaskId, TaskSpec, TaskStatus};
use keel::state::{CheckpointStore, FileStore, LOCK_FILE};
use keel::{Error, Orchestrator, SessionId, SessionOutcome};

use crate::fixtures::{ScriptedExecutor, Step};

fn chain() -> Vec<TaskSpec> {
    vec![TaskSpec::new("a"), TaskSpec::new("b").depends_on("a")]
}

#[tokio::test]
async fn test_resume_after_interrupt_skips_finished_work() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let cancel = CancellationToken::new();

    let first = ScriptedExecutor::new()
        .script("a", vec![Step::ok(1.0, &["a.rs"])])
        .script("b", vec![Step::Hang])
        .cancel_when("b", cancel.clone())
        .build();
    let mut orchestrator = Orchestrator::new(&chain(), Config::default(), first.clone(), store.clone())
        .unwrap()
        .with_cancellation(cancel);
    let session = orchestrator.session_id();

    assert!(matches!(orchestrator.run().await, Err(Error::Cancelled)));
    assert_eq!(first.tasks_started(), vec!["a", "b"]);
    assert!(store.checkpoint_path(session).exists());

    let saved = store.load_checkpoint(session).await.unwrap().unwrap();
    assert_eq!(saved.task(&TaskId::from("a")).unwrap().status, TaskStatus::Completed);
    assert_eq!(saved.task(&TaskId::from("b")).unwrap().status, TaskStatus::InProgress);
    let remaining_after_a = saved.ledger.remaining();
    assert!((remaining_after_a - (100.0 - 10.0 / 3.0)).abs() < 1e-9);

    let second = ScriptedExecutor::new().completing(&["a", "b"]).build();
    let mut resumed = Orchestrator::resume(session, second.clone(), store.clone())
        .await
        .unwrap();
    assert_eq!(resumed.session_id(), session);
    assert!((resumed.state().ledger.remaining() - remaining_after_a).abs() < 1e-9);

    let report = resumed.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Success);
    assert_eq!(second.calls_for("a"), 0);
    assert_eq!(second.calls_for("b"), 1);

    let b = report.task("b").unwrap();
    assert!((report.remaining_budget - (remaining_after_a - b.consumed)).abs() < 1e-9);
}

/// PID of a child that has already been reaped.
#[cfg(unix)]
fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[cfg(unix)]
#[tokio::test]
async fn test_resume_takes_over_lock_left_by_crash() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let cancel = CancellationToken::new();

    let first = ScriptedExecutor::new()
        .script("a", vec![Step::ok(1.0, &["a.rs"])])
        .script("b", vec![Step::Hang])
        .cancel_when("b", cancel.clone())
        .build();
    let mut orchestrator = Orchestrator::new(&chain(), Config::default(), first, store.clone())
        .unwrap()
        .with_cancellation(cancel);
    let session = orchestrator.session_id();
    assert!(matches!(orchestrator.run().await, Err(Error::Cancelled)));

    // A crashed process never releases its lock.
    let lock = store.session_dir(session).join(LOCK_FILE);
    std::fs::write(&lock, format!("{}\n", exited_pid())).unwrap();

    let second = ScriptedExecutor::new().completing(&["a", "b"]).build();
    let mut resumed = Orchestrator::resume(session, second.clone(), store.clone())
        .await
        .unwrap();
    let report = resumed.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Success);
    assert_eq!(second.calls_for("b"), 1);
    assert!(!lock.exists());
}

#[tokio::test]
async fn test_resume_unknown_session() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let executor = ScriptedExecutor::new().build();
    let result = Orchestrator::resume(SessionId::new(), executor, store).await;
    assert!(matches!(result, Err(Error::CheckpointNotFound(_))));
}

#[tokio::test]
async fn test_second_orchestrator_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let holder = FileStore::new(dir.path());
    let executor = ScriptedExecutor::new().completing(&["a", "b"]).build();
    let mut orchestrator = Orchestrator::new(
        &chain(),
        Config::default(),
        executor.clone(),
        Arc::new(FileStore::new(dir.path())),
    )
    .unwrap();

    holder.acquire_lock(orchestrator.session_id()).await.unwrap();
    assert!(matches!(orchestrator.run().await, Err(Error::SessionLocked(_))));
    assert!(executor.calls().is_empty());

    holder.release_lock(orchestrator.session_id()).await.unwrap();
    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Success);
}

#[tokio::test]
async fn test_completed_session_checkpoint_is_final() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let executor = ScriptedExecutor::new().completing(&["a", "b"]).build();
    let mut orchestrator =
        Orchestrator::new(&chain(), Config::default(), executor, store.clone()).unwrap();
    let session = orchestrator.session_id();
    orchestrator.run().await.unwrap();

    let saved = store.load_checkpoint(session).await.unwrap().unwrap();
    assert!(saved.is_finished());
    assert!((saved.ledger.remaining() - orchestrator.state().ledger.remaining()).abs() < 1e-9);
}
