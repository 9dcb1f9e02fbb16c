//! Run Lock: a marker file that exists while a test run is executing.
//!
//! The reload coordinator never restarts the process while the marker
//! exists, so a run that touches persistent state (a scratch database)
//! always reaches a clean stopping point first.
//!
//! ## Key Features
//!
//! - **RunLockGuard**: RAII guard that removes the marker on Drop, so every
//!   exit path (return, early `?`, panic) releases the lock
//! - **clear_stale**: startup recovery for a marker left behind by a crash

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Well-known marker name, relative to the working directory
pub const LOCK_FILE_NAME: &str = "testing.inprogress";

/// Handle on the marker file location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// The lock in the given working directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True while a run is executing
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Remove a marker left over from an abnormal termination.
    ///
    /// Must only be called at process start, before any run begins.
    /// Returns whether a stale marker was found.
    pub fn clear_stale(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("cleared stale run lock {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the marker. It is removed when the guard drops.
    pub fn acquire(&self) -> io::Result<RunLockGuard> {
        File::create(&self.path)?;
        debug!("acquired run lock {}", self.path.display());
        Ok(RunLockGuard {
            path: self.path.clone(),
        })
    }
}

/// Proof that the current run owns the marker file.
///
/// Only the guard deletes the marker it created.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("released run lock {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to release run lock {}: {}", self.path.display(), e),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;
    use tempfile::TempDir;

    #[test]
    fn test_lock_held_only_while_guard_lives() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::in_dir(dir.path());
        assert!(!lock.is_held());
        {
            let guard = lock.acquire().unwrap();
            assert!(lock.is_held());
            assert_eq!(guard.path(), dir.path().join(LOCK_FILE_NAME));
        }
        assert!(!lock.is_held());
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::in_dir(dir.path());

        fn failing_run(lock: &RunLock) -> io::Result<()> {
            let _guard = lock.acquire()?;
            Err(io::Error::new(io::ErrorKind::Other, "suite blew up"))
        }

        assert!(failing_run(&lock).is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_lock_released_on_panic() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::in_dir(dir.path());
        let probe = lock.clone();

        let result = panic::catch_unwind(move || {
            let _guard = lock.acquire().unwrap();
            panic!("uncaught error inside the run");
        });

        assert!(result.is_err());
        assert!(!probe.is_held());
    }

    #[test]
    fn test_clear_stale() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::in_dir(dir.path());
        assert!(!lock.clear_stale().unwrap());

        std::fs::write(lock.path(), b"").unwrap();
        assert!(lock.is_held());
        assert!(lock.clear_stale().unwrap());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_guard_tolerates_marker_already_gone() {
        let dir = TempDir::new().unwrap();
        let lock = RunLock::in_dir(dir.path());
        let guard = lock.acquire().unwrap();
        std::fs::remove_file(lock.path()).unwrap();
        drop(guard);
        assert!(!lock.is_held());
    }
}
