//! Reload Coordinator Integration Tests
//!
//! Runs the watched-run loop with short poll intervals against real files
//! and a real run lock.

mod common;

use runtester::errors::{HarnessError, ImportErrorKind, ImportFailure};
use runtester::lifecycle::RunLock;
use runtester::reload::{run_watched, ReloadCoordinator, WatchOutcome};
use runtester::signals::Shutdown;
use runtester::watch::ChangeDetector;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

const FAST: Duration = Duration::from_millis(10);

fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

fn source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "x = 1\n").unwrap();
    set_mtime(&path, 1_000);
    path
}

#[test]
fn test_change_during_run_restarts_only_after_run_finishes() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let module = source(dir.path(), "core.py");
    let lock = RunLock::in_dir(dir.path());
    let coordinator = ReloadCoordinator::new(ChangeDetector::new(vec![module.clone()]), lock.clone())
        .with_poll_interval(FAST);

    let finished = Arc::new(AtomicBool::new(false));
    let run_finished = finished.clone();
    let probe = lock.clone();
    let outcome = run_watched(coordinator, &Shutdown::new(), move || {
        assert!(probe.is_held());
        thread::sleep(Duration::from_millis(100));
        // The developer saves a file while tests are still running
        set_mtime(&module, 2_000);
        thread::sleep(Duration::from_millis(200));
        run_finished.store(true, Ordering::SeqCst);
        Ok(1)
    })
    .unwrap();

    assert_eq!(outcome, WatchOutcome::Restart);
    assert!(finished.load(Ordering::SeqCst), "restart must wait for the run");
    assert!(!lock.is_held());
}

#[test]
fn test_leftover_lock_does_not_block_restart() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let module = source(dir.path(), "core.py");
    let lock = RunLock::in_dir(dir.path());
    fs::write(lock.path(), b"").unwrap();

    let coordinator = ReloadCoordinator::new(ChangeDetector::new(vec![module.clone()]), lock.clone())
        .with_poll_interval(FAST);
    let toucher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        set_mtime(&module, 2_000);
    });

    let outcome = run_watched(coordinator, &Shutdown::new(), || Ok(0)).unwrap();
    toucher.join().unwrap();

    assert_eq!(outcome, WatchOutcome::Restart);
    assert!(!lock.is_held());
}

#[test]
fn test_import_failure_file_triggers_restart_when_fixed() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let module = source(dir.path(), "core.py");
    let broken = source(dir.path(), "broken.py");
    let lock = RunLock::in_dir(dir.path());

    // The broken module never made it into the snapshot
    let coordinator = ReloadCoordinator::new(ChangeDetector::new(vec![module]), lock.clone())
        .with_poll_interval(FAST);

    let failure = ImportFailure {
        kind: ImportErrorKind::Syntax,
        filename: Some(broken.clone()),
        frames: vec![],
    };
    let fixer_target = broken.clone();
    let fixer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        set_mtime(&fixer_target, 3_000);
    });

    let outcome = run_watched(coordinator, &Shutdown::new(), move || {
        Err(HarnessError::Import(failure))
    })
    .unwrap();
    fixer.join().unwrap();

    assert_eq!(outcome, WatchOutcome::Restart);
    assert!(!lock.is_held());
}

#[test]
fn test_shutdown_waits_for_run_then_exits_cleanly() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let module = source(dir.path(), "core.py");
    let lock = RunLock::in_dir(dir.path());
    let coordinator = ReloadCoordinator::new(ChangeDetector::new(vec![module]), lock.clone())
        .with_poll_interval(FAST);

    let shutdown = Shutdown::new();
    shutdown.request();

    let finished = Arc::new(AtomicBool::new(false));
    let run_finished = finished.clone();
    let outcome = run_watched(coordinator, &shutdown, move || {
        thread::sleep(Duration::from_millis(100));
        run_finished.store(true, Ordering::SeqCst);
        Err(HarnessError::Suite("agent crashed".to_string()))
    })
    .unwrap();

    assert_eq!(outcome, WatchOutcome::Shutdown);
    assert_eq!(outcome.exit_code(), 0);
    assert!(finished.load(Ordering::SeqCst));
    assert!(!lock.is_held());
}

#[cfg(unix)]
mod supervisor {
    use super::*;
    use runtester::reload::{supervise_with, RESTART_EXIT_CODE, RUN_MAIN_ENV};
    use std::process::Command;

    /// Exits with the restart code until a marker exists, then with 7.
    fn flaky_child(marker: &Path) -> Command {
        let script = format!(
            "test \"${}\" = true || exit 99; if [ -f '{}' ]; then exit 7; else touch '{}'; exit {}; fi",
            RUN_MAIN_ENV,
            marker.display(),
            marker.display(),
            RESTART_EXIT_CODE
        );
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_supervisor_relaunches_until_other_status() {
        common::init_tracing();
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("launched");
        let mut launches = 0;
        let code = supervise_with(&Shutdown::new(), || {
            launches += 1;
            flaky_child(&marker)
        })
        .unwrap();
        assert_eq!(code, 7);
        assert_eq!(launches, 2);
    }

    #[test]
    fn test_supervisor_stops_relaunching_on_shutdown() {
        common::init_tracing();
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("launched");
        let shutdown = Shutdown::new();
        shutdown.request();
        let code = supervise_with(&shutdown, || flaky_child(&marker)).unwrap();
        assert_eq!(code, RESTART_EXIT_CODE);
    }
}
