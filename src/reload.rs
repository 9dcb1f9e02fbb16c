//! Reload Coordinator: restart the whole process when sources change, but
//! never while a test run holds the run lock.
//!
//! ```text
//! RUNNING --change--> CHANGE_PENDING --lock absent--> RESTART_SIGNALLED
//! ```
//!
//! RESTART_SIGNALLED is terminal: the process exits with
//! [`RESTART_EXIT_CODE`] and the supervisor launches a fresh one, which starts
//! again in RUNNING. The run and the watcher share nothing in-process except
//! a channel for failed-import files; the lock file is the only thing the
//! watcher waits on.

use crate::errors::{HarnessError, Result};
use crate::lifecycle::RunLock;
use crate::signals::Shutdown;
use crate::watch::ChangeSource;
use crossbeam_channel::{tick, unbounded, Receiver, Sender};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exit status meaning "supervisor, please relaunch me".
pub const RESTART_EXIT_CODE: i32 = 3;

/// Set in the environment of every process the supervisor launches.
pub const RUN_MAIN_ENV: &str = "RUNTESTER_RUN_MAIN";

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Running,
    ChangePending,
    RestartSignalled,
}

/// How the watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Restart,
    Shutdown,
}

impl WatchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WatchOutcome::Restart => RESTART_EXIT_CODE,
            WatchOutcome::Shutdown => 0,
        }
    }
}

pub struct ReloadCoordinator<C: ChangeSource> {
    changes: C,
    lock: RunLock,
    state: ReloadState,
    poll_interval: Duration,
    failed_imports: Option<Receiver<PathBuf>>,
}

impl<C: ChangeSource> ReloadCoordinator<C> {
    pub fn new(changes: C, lock: RunLock) -> Self {
        Self {
            changes,
            lock,
            state: ReloadState::Running,
            poll_interval: POLL_INTERVAL,
            failed_imports: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> ReloadState {
        self.state
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    pub fn changes(&self) -> &C {
        &self.changes
    }

    /// Channel on which a run reports files whose modules failed to load.
    pub fn failed_import_sender(&mut self) -> Sender<PathBuf> {
        let (tx, rx) = unbounded();
        self.failed_imports = Some(rx);
        tx
    }

    fn drain_failed_imports(&mut self) {
        if let Some(rx) = &self.failed_imports {
            for path in rx.try_iter() {
                self.changes.retain_failed_import(path);
            }
        }
    }

    fn check_lock(&mut self) {
        if self.lock.is_held() {
            debug!("change pending, waiting for the run to release {}", self.lock.path().display());
        } else {
            self.state = ReloadState::RestartSignalled;
        }
    }

    /// Advance the state machine by one poll.
    pub fn step(&mut self) -> ReloadState {
        self.drain_failed_imports();
        match self.state {
            ReloadState::Running => {
                if self.changes.has_changed() {
                    info!("source change detected");
                    self.state = ReloadState::ChangePending;
                    self.check_lock();
                }
            }
            ReloadState::ChangePending => self.check_lock(),
            ReloadState::RestartSignalled => {}
        }
        self.state
    }

    /// Poll at the configured cadence until a restart is due or shutdown
    /// was requested and no run holds the lock.
    pub fn wait_for_restart(&mut self, shutdown: &Shutdown) -> WatchOutcome {
        let ticker = tick(self.poll_interval);
        loop {
            if shutdown.is_requested() && !self.lock.is_held() {
                return WatchOutcome::Shutdown;
            }
            if self.step() == ReloadState::RestartSignalled {
                return WatchOutcome::Restart;
            }
            let _ = ticker.recv();
        }
    }
}

/// Hold the run lock for exactly the duration of `run`.
pub fn guarded_run<F>(lock: &RunLock, run: F) -> Result<usize>
where
    F: FnOnce() -> Result<usize>,
{
    let _guard = lock.acquire()?;
    run()
}

/// Run `run` on its own thread under the run lock while this thread watches
/// for changes.
///
/// A stale lock from a crashed predecessor is cleared before anything
/// starts. The lock is taken before the run thread is spawned, so the
/// watcher never observes a run that has begun but not yet locked. Import
/// failures of the run are fed back to the change source so that fixing the
/// broken file triggers the restart.
pub fn run_watched<C, F>(
    mut coordinator: ReloadCoordinator<C>,
    shutdown: &Shutdown,
    run: F,
) -> Result<WatchOutcome>
where
    C: ChangeSource,
    F: FnOnce() -> Result<usize> + Send + 'static,
{
    if let Err(e) = coordinator.lock().clear_stale() {
        warn!("could not clear stale run lock: {}", e);
    }

    let guard = coordinator.lock().acquire()?;
    let failed_tx = coordinator.failed_import_sender();

    thread::Builder::new()
        .name("test-run".to_string())
        .spawn(move || {
            let outcome = run();
            if let Err(HarnessError::Import(failure)) = &outcome {
                if let Some(path) = failure.responsible_file() {
                    let _ = failed_tx.send(path.to_path_buf());
                }
            }
            drop(guard);

            match outcome {
                Ok(0) => info!("run finished, all tests passed"),
                Ok(count) => info!("run finished with {} failure(s)", count),
                Err(e) => error!("run failed: {}", e),
            }
        })?;

    let outcome = coordinator.wait_for_restart(shutdown);
    info!("watcher stopping: {:?}", outcome);
    Ok(outcome)
}

/// True inside a process launched by [`supervise`].
pub fn is_supervised_child() -> bool {
    env::var_os(RUN_MAIN_ENV).is_some()
}

/// Relaunch the current executable with the same arguments for as long as
/// it asks to be restarted. Returns the first other exit status.
pub fn supervise(shutdown: &Shutdown) -> Result<i32> {
    let exe = env::current_exe()?;
    let args: Vec<OsString> = env::args_os().skip(1).collect();
    supervise_with(shutdown, || {
        let mut command = Command::new(&exe);
        command.args(&args);
        command
    })
}

/// Supervisor loop over an arbitrary child command.
pub fn supervise_with<F>(shutdown: &Shutdown, mut make_command: F) -> Result<i32>
where
    F: FnMut() -> Command,
{
    loop {
        let status = make_command().env(RUN_MAIN_ENV, "true").status()?;
        match status.code() {
            Some(RESTART_EXIT_CODE) if !shutdown.is_requested() => {
                info!("relaunching after source change");
            }
            Some(code) => return Ok(code),
            // Killed by a signal
            None => return Ok(1),
        }
    }
}
