//! Per-run advisory file locking.
//!
//! The lock is an OS-level exclusive flock on `<run_root>/state.sqlite.lock`
//! so that independent scheduler processes coordinate correctly. Acquisition
//! is non-blocking: contention surfaces as [`StoreError::LockBusy`] and the
//! caller decides whether to skip or retry.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::store::StoreError;

/// Suffix appended to the database path to form the lock file.
pub const LOCK_FILE_NAME: &str = "state.sqlite.lock";

/// Scoped exclusive lock on a run. Released on drop (and by the OS if the
/// process dies, which is what makes crash recovery safe).
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to acquire the run lock, failing fast when another process (or
    /// another handle in this process) already holds it.
    pub fn acquire(run_root: &Path) -> Result<Self, StoreError> {
        let path = run_root.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;

        file.try_lock_exclusive().map_err(|_| StoreError::LockBusy {
            path: path.clone(),
        })?;

        tracing::debug!(lock = %path.display(), "acquired run lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
