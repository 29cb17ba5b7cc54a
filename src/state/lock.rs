//! Cross-process mutual exclusion over the state document.
//!
//! The lock lives in a sidecar `<state>.lock` file so that the atomic rename
//! of the document itself never swaps the inode a waiter is blocked on.
//! `fs2` selects the platform primitive (flock on unix, LockFileEx on
//! windows); callers only see `FileLock::acquire` and `LockGuard::release`.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::errors::StateError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Acquires exclusive locks on a lock file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file path used for a given state document.
    pub fn for_document(document: &Path) -> Self {
        let mut name = document
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        Self::new(document.with_file_name(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, retrying with exponential backoff until `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard, StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateError::io("Failed to create lock directory", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                StateError::io(format!("Failed to open lock file {}", self.path.display()), e)
            })?;

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!(path = %self.path.display(), "state lock acquired");
                    return Ok(LockGuard {
                        file: Some(file),
                        path: self.path.clone(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        tracing::warn!(
                            path = %self.path.display(),
                            waited_ms = waited.as_millis() as u64,
                            "state lock contention"
                        );
                        return Err(StateError::LockContention {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    std::thread::sleep(backoff.min(timeout - waited));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    return Err(StateError::io(
                        format!("Failed to lock {}", self.path.display()),
                        e,
                    ));
                }
            }
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == std::io::ErrorKind::WouldBlock
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; dropping the guard has the same effect.
    pub fn release(mut self) -> Result<(), StateError> {
        match self.file.take() {
            Some(file) => FileExt::unlock(&file)
                .map_err(|e| StateError::io(format!("Failed to unlock {}", self.path.display()), e)),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}
