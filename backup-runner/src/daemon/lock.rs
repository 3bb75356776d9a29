//! Run-lock scoped to the backup root.
//!
//! Two runs against the same root could interleave labels and prune each
//! other's sets, so a run holds an exclusive `flock` on
//! `<root>/.backup-runner.lock` until it finishes. The lock file itself is
//! never removed.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".backup-runner.lock";

/// Held for the duration of a run; released on drop.
pub struct RunLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting. Fails with `Locked` if another run has it.
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| BackupError::io_at(root, e))?;

        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| BackupError::io_at(&path, e))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Acquired run lock {}", path.display());
                Ok(Self { _lock: lock, path })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(BackupError::Locked(path)),
            Err((_, errno)) => Err(BackupError::io_at(&path, std::io::Error::from(errno))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Released run lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_locked() -> Result<()> {
        let temp_dir = TempDir::new()?;

        let first = RunLock::acquire(temp_dir.path())?;
        assert_eq!(first.path(), temp_dir.path().join(LOCK_FILE_NAME));

        let second = RunLock::acquire(temp_dir.path());
        assert!(matches!(second, Err(BackupError::Locked(_))));

        drop(first);
        assert!(RunLock::acquire(temp_dir.path()).is_ok());
        Ok(())
    }

    #[test]
    fn test_creates_missing_root() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("fresh/backups");
        let _lock = RunLock::acquire(&root)?;
        assert!(root.join(LOCK_FILE_NAME).is_file());
        Ok(())
    }
}
