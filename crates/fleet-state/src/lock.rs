//! Advisory file locks built on `flock(2)`.
//!
//! `flock` locks belong to the open file description, so two handles
//! opened separately conflict even inside one process. Dropping the guard
//! releases the lock; a crashed holder releases it when the kernel closes
//! the descriptor.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::RUNTIME_DIR;
use crate::error::{StateError, StateResult};

/// File name of the dispatch cycle lock under the runtime directory.
pub const DISPATCH_LOCK_FILE: &str = "scheduler-dispatch.lock";

/// An exclusive lock held on a file until dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock without waiting. `Ok(None)` means another
    /// holder has it.
    pub fn try_acquire(path: &Path) -> StateResult<Option<FileLock>> {
        let file = open_lock_file(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {
                debug!(path = %path.display(), "lock acquired");
                Ok(Some(FileLock {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                debug!(path = %path.display(), "lock held elsewhere");
                Ok(None)
            }
            Err(source) => Err(StateError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Take the lock, waiting for the current holder if necessary.
    pub fn acquire(path: &Path) -> StateResult<FileLock> {
        let file = open_lock_file(path)?;
        loop {
            match flock(&file, libc::LOCK_EX) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(StateError::Lock {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
        Ok(FileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
        debug!(path = %self.path.display(), "lock released");
    }
}

/// The fleet-wide lock that allows one dispatch cycle at a time.
#[derive(Debug, Clone)]
pub struct DispatchLock {
    path: PathBuf,
}

impl DispatchLock {
    /// Lock file under `<root>/.runtime/`.
    pub fn for_root(root: &Path) -> Self {
        Self::at(root.join(RUNTIME_DIR).join(DISPATCH_LOCK_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Non-blocking: `Ok(None)` when a cycle is already in flight.
    pub fn try_lock(&self) -> StateResult<Option<FileLock>> {
        FileLock::try_acquire(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> StateResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| StateError::Lock {
            path: path.to_path_buf(),
            source,
        })
}

fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
