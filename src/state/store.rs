use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::state::{OrchestrationState, SessionId};
use crate::util::blocking;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = "session.lock";

/// Where session checkpoints live.
///
/// A session is owned by one orchestrator at a time; the lock is advisory
/// and must be taken before the first save.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, session: SessionId, state: &OrchestrationState) -> Result<()>;

    async fn load_checkpoint(&self, session: SessionId) -> Result<Option<OrchestrationState>>;

    /// # Errors
    /// Returns `SessionLocked` if another orchestrator holds the session.
    async fn acquire_lock(&self, session: SessionId) -> Result<()>;

    async fn release_lock(&self, session: SessionId) -> Result<()>;
}

/// Checkpoints as JSON files under `<root>/<session>/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session: SessionId) -> PathBuf {
        self.root.join(session.to_string())
    }

    pub fn checkpoint_path(&self, session: SessionId) -> PathBuf {
        self.session_dir(session).join(CHECKPOINT_FILE)
    }

    fn lock_path(&self, session: SessionId) -> PathBuf {
        self.session_dir(session).join(LOCK_FILE)
    }
}

fn persistence(path: &Path, e: std::io::Error) -> Error {
    Error::Persistence(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn save_checkpoint(&self, session: SessionId, state: &OrchestrationState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        let dir = self.session_dir(session);
        let path = self.checkpoint_path(session);

        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| persistence(&dir, e))?;

            if path.exists() {
                let backup_path = path.with_extension("json.bak");
                fs::copy(&path, &backup_path).map_err(|e| persistence(&backup_path, e))?;
            }

            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents).map_err(|e| persistence(&temp_path, e))?;
            fs::rename(&temp_path, &path).map_err(|e| persistence(&path, e))?;
            debug!(path = %path.display(), "checkpoint saved");
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self, session: SessionId) -> Result<Option<OrchestrationState>> {
        let path = self.checkpoint_path(session);
        blocking(move || {
            if !path.exists() {
                debug!(path = %path.display(), "no checkpoint");
                return Ok(None);
            }
            let contents = fs::read_to_string(&path)?;
            let state: OrchestrationState = serde_json::from_str(&contents)?;
            state.check_version()?;
            Ok(Some(state))
        })
        .await
    }

    /// Take the session lock. A lock left by a process that no longer
    /// exists is taken over.
    async fn acquire_lock(&self, session: SessionId) -> Result<()> {
        let dir = self.session_dir(session);
        let path = self.lock_path(session);
        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| persistence(&dir, e))?;
            let mut took_over = false;
            loop {
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(mut file) => {
                        writeln!(file, "{}", std::process::id()).map_err(|e| persistence(&path, e))?;
                        debug!(path = %path.display(), "session lock acquired");
                        return Ok(());
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        let Some(holder) = stale_holder(&path).filter(|_| !took_over) else {
                            return Err(Error::SessionLocked(session.to_string()));
                        };
                        warn!(session = %session, pid = holder, "taking over lock of exited process");
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(persistence(&path, e)),
                        }
                        took_over = true;
                    }
                    Err(e) => return Err(persistence(&path, e)),
                }
            }
        })
        .await
    }

    async fn release_lock(&self, session: SessionId) -> Result<()> {
        let path = self.lock_path(session);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence(&path, e)),
        })
        .await
    }
}

/// PID recorded in a lock file whose process has exited.
///
/// Unreadable or empty lock files are never stale: their writer may still
/// be between creating and filling them.
fn stale_holder(path: &Path) -> Option<u32> {
    let pid = fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()?;
    (!pid_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)),
        _ => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<SessionId, String>>,
    locks: Mutex<HashSet<SessionId>>,
    saves: AtomicUsize,
    /// Saves beyond this count fail.
    fail_after: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose saves start failing after `saves` successful ones.
    pub fn failing_after(saves: usize) -> Self {
        Self {
            fail_after: Some(saves),
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self, session: SessionId) -> bool {
        self.locks
            .lock()
            .map(|locks| locks.contains(&session))
            .unwrap_or(false)
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Persistence("memory store lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save_checkpoint(&self, session: SessionId, state: &OrchestrationState) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.save_count() >= limit {
                return Err(Error::Persistence("checkpoint write refused".to_string()));
            }
        }
        let contents = serde_json::to_string(state)?;
        self.checkpoints
            .lock()
            .map_err(poisoned)?
            .insert(session, contents);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_checkpoint(&self, session: SessionId) -> Result<Option<OrchestrationState>> {
        let contents = self
            .checkpoints
            .lock()
            .map_err(poisoned)?
            .get(&session)
            .cloned();
        match contents {
            Some(contents) => {
                let state: OrchestrationState = serde_json::from_str(&contents)?;
                state.check_version()?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn acquire_lock(&self, session: SessionId) -> Result<()> {
        if !self.locks.lock().map_err(poisoned)?.insert(session) {
            return Err(Error::SessionLocked(session.to_string()));
        }
        Ok(())
    }

    async fn release_lock(&self, session: SessionId) -> Result<()> {
        self.locks.lock().map_err(poisoned)?.remove(&session);
        Ok(())
    }
}
