//! Exclusive run-lock and pid marker
//!
//! One agent per root directory. The lock is an advisory `flock` on
//! `<root>/minion.lock`, held for the lifetime of [`RunLock`]; the pid marker
//! `<root>/minion.pid` is written on acquire and removed on drop.

use crate::{MinionError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock file name inside the agent root
pub const LOCK_FILE: &str = "minion.lock";

/// Pid marker file name inside the agent root
pub const PID_FILE: &str = "minion.pid";

/// Held run-lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    file: File,
    pid_path: PathBuf,
}

impl RunLock {
    /// Take the lock for `root`, failing with `AlreadyRunning` if it is held
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            return Err(if contended {
                MinionError::AlreadyRunning(root.display().to_string())
            } else {
                e.into()
            });
        }

        let pid_path = root.join(PID_FILE);
        std::fs::write(&pid_path, format!("{}\n", std::process::id()))?;
        debug!("Acquired run-lock in {}", root.display());

        Ok(Self { file, pid_path })
    }

    /// Path of the pid marker
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid() {
        let root = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(root.path()).unwrap();

        let pid = std::fs::read_to_string(lock.pid_path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let _held = RunLock::acquire(root.path()).unwrap();

        let result = RunLock::acquire(root.path());
        assert!(matches!(result, Err(MinionError::AlreadyRunning(_))));
    }

    #[test]
    fn test_drop_releases_lock_and_pid() {
        let root = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(root.path()).unwrap();
        let pid_path = lock.pid_path().to_path_buf();
        drop(lock);

        assert!(!pid_path.exists());
        assert!(RunLock::acquire(root.path()).is_ok());
    }
}
