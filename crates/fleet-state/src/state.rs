//! Scheduler state record — pause flag and dispatch bookkeeping.
//!
//! The record is tiny and rewritten whole. Writers go through
//! [`StateBackend::update`], which serialises read-modify-write cycles and
//! replaces the file atomically so readers never see a half-written value.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::RUNTIME_DIR;
use crate::error::{StateError, StateResult};
use crate::lock::FileLock;

pub const STATE_FILE: &str = "scheduler-state.json";
pub const STATE_LOCK_FILE: &str = "scheduler-state.lock";

/// Fleet-wide scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub paused_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatch_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_dispatch_count: u32,
}

impl SchedulerState {
    pub fn set_paused(&mut self, actor: &str) {
        self.paused = true;
        self.paused_by = actor.to_string();
        self.paused_at = Some(Utc::now());
    }

    pub fn set_resumed(&mut self) {
        self.paused = false;
        self.paused_by.clear();
        self.paused_at = None;
    }

    pub fn record_dispatch(&mut self, count: u32) {
        self.last_dispatch_at = Some(Utc::now());
        self.last_dispatch_count = count;
    }
}

/// Injected accessor for the state record.
pub trait StateBackend: Send + Sync {
    /// Read the current record. A missing record reads as the default.
    fn load(&self) -> StateResult<SchedulerState>;

    /// Atomically read, modify, and write back the record.
    fn update(&self, apply: &mut dyn FnMut(&mut SchedulerState)) -> StateResult<SchedulerState>;

    /// Pause dispatch. Returns `false` if it was already paused.
    fn pause(&self, actor: &str) -> StateResult<bool> {
        let mut changed = false;
        self.update(&mut |state| {
            if !state.paused {
                state.set_paused(actor);
                changed = true;
            }
        })?;
        Ok(changed)
    }

    /// Resume dispatch. Returns `false` if it was not paused.
    fn resume(&self) -> StateResult<bool> {
        let mut changed = false;
        self.update(&mut |state| {
            if state.paused {
                state.set_resumed();
                changed = true;
            }
        })?;
        Ok(changed)
    }
}

/// State record persisted as JSON under `<root>/.runtime/`.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStateBackend {
    pub fn for_root(root: &Path) -> Self {
        let dir = root.join(RUNTIME_DIR);
        Self {
            path: dir.join(STATE_FILE),
            lock_path: dir.join(STATE_LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StateResult<SchedulerState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SchedulerState::default());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(SchedulerState::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn write(&self, state: &SchedulerState) -> StateResult<()> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut body =
            serde_json::to_vec_pretty(state).map_err(|e| StateError::Serialize(e.to_string()))?;
        body.push(b'\n');

        let tmp = dir.join(format!("{STATE_FILE}.tmp.{}", std::process::id()));
        let result = (|| {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        })();
        if let Err(source) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(source));
        }
        debug!(path = %self.path.display(), "scheduler state written");
        Ok(())
    }
}

impl StateBackend for FileStateBackend {
    fn load(&self) -> StateResult<SchedulerState> {
        self.read()
    }

    fn update(&self, apply: &mut dyn FnMut(&mut SchedulerState)) -> StateResult<SchedulerState> {
        let _guard = FileLock::acquire(&self.lock_path)?;
        let mut state = self.read()?;
        apply(&mut state);
        self.write(&state)?;
        info!(paused = state.paused, "scheduler state updated");
        Ok(state)
    }
}

/// In-memory state record for tests.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    state: Mutex<SchedulerState>,
    fail_loads: AtomicBool,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SchedulerState) -> Self {
        Self {
            state: Mutex::new(state),
            fail_loads: AtomicBool::new(false),
        }
    }

    /// Make every subsequent load fail as if the record were corrupt.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StateResult<()> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StateError::Corrupt {
                path: PathBuf::from("<memory>"),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl StateBackend for MemoryStateBackend {
    fn load(&self) -> StateResult<SchedulerState> {
        self.check()?;
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn update(&self, apply: &mut dyn FnMut(&mut SchedulerState)) -> StateResult<SchedulerState> {
        self.check()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut state);
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::for_root(dir.path());
        assert_eq!(backend.load().unwrap(), SchedulerState::default());
    }

    #[test]
    fn pause_and_resume_persist() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::for_root(dir.path());

        assert!(backend.pause("mayor").unwrap());
        assert!(!backend.pause("someone-else").unwrap());

        let reopened = FileStateBackend::for_root(dir.path());
        let state = reopened.load().unwrap();
        assert!(state.paused);
        assert_eq!(state.paused_by, "mayor");
        assert!(state.paused_at.is_some());

        assert!(reopened.resume().unwrap());
        assert!(!reopened.resume().unwrap());
        let state = backend.load().unwrap();
        assert!(!state.paused);
        assert!(state.paused_by.is_empty());
        assert!(state.paused_at.is_none());
    }

    #[test]
    fn update_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::for_root(dir.path());
        backend.update(&mut |s| s.record_dispatch(3)).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join(RUNTIME_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&STATE_FILE.to_string()));
        assert!(!names.iter().any(|n| n.contains(".tmp.")));
        assert_eq!(backend.load().unwrap().last_dispatch_count, 3);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::for_root(dir.path());
        std::fs::create_dir_all(dir.path().join(RUNTIME_DIR)).unwrap();
        std::fs::write(backend.path(), "{not json").unwrap();
        assert!(matches!(backend.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn record_dispatch_keeps_pause_flag() {
        let backend = MemoryStateBackend::new();
        backend.pause("witness").unwrap();
        let state = backend.update(&mut |s| s.record_dispatch(2)).unwrap();
        assert!(state.paused);
        assert_eq!(state.last_dispatch_count, 2);
        assert!(state.last_dispatch_at.is_some());
    }

    #[test]
    fn memory_backend_injected_failure() {
        let backend = MemoryStateBackend::new();
        backend.set_fail_loads(true);
        assert!(backend.load().is_err());
        backend.set_fail_loads(false);
        assert!(backend.load().is_ok());
    }
}
