//! Suite execution: hands a list of labels to the test framework and streams
//! its lifecycle events into a reporter.
//!
//! The framework itself runs in a Python agent process that prints one JSON
//! object per line on STDOUT (see `events::TestEvent` for the wire form).
//! Startup failures arrive as a `load_error` record instead.

use crate::config::{ProjectConfig, RunOptions};
use crate::discovery::ModuleDescriptor;
use crate::environment::python_executable;
use crate::errors::{HarnessError, ImportErrorKind, ImportFailure, Result};
use crate::events::{RunSummary, TestEvent};
use crate::reporter::Reporter;
use crate::signals::Shutdown;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Module the default agent command runs.
pub const AGENT_MODULE: &str = "runtester_agent";

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteRequest {
    pub labels: Vec<String>,
    pub verbosity: u8,
    pub interactive: bool,
    pub fail_fast: bool,
    /// False runs without creating a test database
    pub database: bool,
    /// Additional pre-built tests to add to the suite, by dotted id
    pub extra_tests: Vec<String>,
}

impl SuiteRequest {
    pub fn new(labels: &[String], options: &RunOptions) -> Self {
        Self {
            labels: labels.to_vec(),
            verbosity: options.verbosity,
            interactive: options.interactive,
            fail_fast: options.fail_fast,
            database: options.database_required,
            extra_tests: Vec::new(),
        }
    }

    pub fn with_extra_tests(mut self, extra: &[String]) -> Self {
        self.extra_tests = extra.to_vec();
        self
    }

    /// Agent arguments: `--verbosity N [--noinput] [--failfast] [--nodb] LABELS... EXTRA...`
    pub fn agent_args(&self) -> Vec<String> {
        let mut args = vec!["--verbosity".to_string(), self.verbosity.to_string()];
        if !self.interactive {
            args.push("--noinput".to_string());
        }
        if self.fail_fast {
            args.push("--failfast".to_string());
        }
        if !self.database {
            args.push("--nodb".to_string());
        }
        args.extend(self.labels.iter().cloned());
        args.extend(self.extra_tests.iter().cloned());
        args
    }
}

/// The suite-execution collaborator.
///
/// Implementations call the reporter's run-start hook, every event in order,
/// then the run-finished hook, and return the tally.
pub trait SuiteRunner: Send {
    fn run(&mut self, request: &SuiteRequest, reporter: &mut dyn Reporter) -> Result<RunSummary>;
}

/// Whether the event source should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Feeds events to a reporter, keeps the tally and decides when to stop.
///
/// A run stops after the `Stopped` event of a test when fail-fast is on and
/// the test did not pass, when the test was interrupted, when the reporter
/// asks for it, or when shutdown was requested.
pub struct EventPump<'a> {
    reporter: &'a mut dyn Reporter,
    summary: RunSummary,
    fail_fast: bool,
    interrupted: bool,
    shutdown: Option<Shutdown>,
    started_at: Instant,
}

impl<'a> EventPump<'a> {
    pub fn start(reporter: &'a mut dyn Reporter, request: &SuiteRequest) -> Result<Self> {
        reporter.on_run_start(&request.labels)?;
        Ok(Self {
            reporter,
            summary: RunSummary::default(),
            fail_fast: request.fail_fast,
            interrupted: false,
            shutdown: None,
            started_at: Instant::now(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn push(&mut self, event: &TestEvent) -> Result<Flow> {
        let failures_before = self.summary.failure_count();
        self.summary.record(event);
        self.reporter.on_event(event)?;

        match event {
            TestEvent::Started { .. } => self.interrupted = false,
            _ if event.is_interrupt() => self.interrupted = true,
            _ => {}
        }
        if !matches!(event, TestEvent::Stopped { .. }) {
            return Ok(Flow::Continue);
        }
        if self.interrupted {
            info!("test interrupted, stopping after the current test");
            return Ok(Flow::Stop);
        }
        if self.fail_fast && self.summary.failure_count() > failures_before {
            info!("fail-fast: stopping after first failure");
            return Ok(Flow::Stop);
        }
        if self.reporter.stop_requested() {
            info!("reporter requested stop after the current test");
            return Ok(Flow::Stop);
        }
        if self.shutdown.as_ref().is_some_and(Shutdown::is_requested) {
            info!("shutdown requested, stopping after the current test");
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    /// Remember the modules the agent has loaded so far.
    pub fn record_loaded(&mut self, modules: Vec<ModuleDescriptor>) {
        debug!("agent reports {} loaded modules", modules.len());
        self.summary.loaded.extend(modules);
    }

    /// Report a fatal error through the reporter.
    pub fn fail(&mut self, message: &str) {
        self.reporter.on_error(message);
    }

    /// Report a fatal error, then close the run so file reports stay complete.
    pub fn abort(mut self, message: &str) -> Result<RunSummary> {
        self.fail(message);
        self.finish()
    }

    pub fn finish(mut self) -> Result<RunSummary> {
        self.summary.elapsed = self.started_at.elapsed();
        self.reporter.on_run_finished(&self.summary)?;
        Ok(self.summary)
    }
}

/// Modules imported by the agent, sent before it exits.
#[derive(Deserialize)]
struct Loaded {
    modules: Vec<ModuleDescriptor>,
}

#[derive(Deserialize)]
struct LoadError {
    kind: String,
    filename: Option<PathBuf>,
    #[serde(default)]
    frames: Vec<PathBuf>,
}

impl LoadError {
    fn into_error(self) -> HarnessError {
        match ImportErrorKind::from_name(&self.kind) {
            Some(kind) => HarnessError::Import(ImportFailure {
                kind,
                filename: self.filename,
                frames: self.frames,
            }),
            None => {
                let location = self.filename.or_else(|| self.frames.last().cloned());
                HarnessError::Suite(match location {
                    Some(path) => format!("{} while loading {}", self.kind, path.display()),
                    None => format!("{} while loading test modules", self.kind),
                })
            }
        }
    }
}

/// Read agent output until it ends or the pump says stop.
pub fn read_events<R: BufRead>(reader: R, pump: &mut EventPump<'_>) -> Result<Flow> {
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                debug!("agent: {}", line);
                continue;
            }
        };

        match value.get("event").and_then(|e| e.as_str()) {
            Some("load_error") => {
                let load_error: LoadError = serde_json::from_value(value)
                    .map_err(|e| HarnessError::Suite(format!("malformed load_error record: {}", e)))?;
                return Err(load_error.into_error());
            }
            Some("loaded") => {
                match serde_json::from_value::<Loaded>(value) {
                    Ok(loaded) => pump.record_loaded(loaded.modules),
                    Err(e) => warn!("unrecognised agent record {}: {}", line, e),
                }
                continue;
            }
            _ => {}
        }

        match serde_json::from_value::<TestEvent>(value) {
            Ok(event) => {
                if pump.push(&event)? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
            Err(e) => warn!("unrecognised agent record {}: {}", line, e),
        }
    }
    Ok(Flow::Continue)
}

/// Runs the suite in a child process speaking the NDJSON agent protocol.
#[derive(Debug, Clone)]
pub struct ProcessSuiteRunner {
    argv: Vec<String>,
    cwd: PathBuf,
    shutdown: Shutdown,
}

impl ProcessSuiteRunner {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>) -> Result<Self> {
        if argv.is_empty() {
            return Err(HarnessError::Config("suite_command must not be empty".to_string()));
        }
        Ok(Self {
            argv,
            cwd: cwd.into(),
            shutdown: Shutdown::new(),
        })
    }

    /// `suite_command` from the project file, else the venv interpreter
    /// running the bundled agent module.
    pub fn from_config(config: &ProjectConfig, project_root: &Path) -> Result<Self> {
        let argv = match &config.suite_command {
            Some(argv) => argv.clone(),
            None => vec![
                python_executable(project_root).to_string_lossy().into_owned(),
                "-m".to_string(),
                AGENT_MODULE.to_string(),
            ],
        };
        Self::new(argv, project_root)
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Full command line for a request.
    pub fn command_line(&self, request: &SuiteRequest) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend(request.agent_args());
        argv
    }
}

impl SuiteRunner for ProcessSuiteRunner {
    fn run(&mut self, request: &SuiteRequest, reporter: &mut dyn Reporter) -> Result<RunSummary> {
        let argv = self.command_line(request);
        debug!("launching suite agent: {}", argv.join(" "));

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.cwd)
            .stdin(if request.interactive { Stdio::inherit() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HarnessError::Suite(format!("failed to launch {}: {}", argv[0], e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Suite("agent stdout unavailable".to_string()))?;

        let mut pump = EventPump::start(reporter, request)?.with_shutdown(self.shutdown.clone());
        let flow = read_events(BufReader::new(stdout), &mut pump);

        if !matches!(flow, Ok(Flow::Continue)) {
            // The agent may still be running more tests
            if let Err(e) = child.kill() {
                debug!("agent already gone: {}", e);
            }
        }
        let status = child.wait()?;

        if let Err(e) = flow {
            if let Err(close_err) = pump.abort(&e.to_string()) {
                warn!("could not finish report after failed run: {}", close_err);
            }
            return Err(e);
        }

        let summary = pump.finish()?;
        if summary.tests == 0 && !status.success() {
            return Err(HarnessError::Suite(format!(
                "agent exited with {} before running any test",
                status
            )));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::INTERRUPT_KIND;
    use crate::reporter::{HumanReporter, JsonReporter};
    use std::io::Cursor;
    use std::time::Duration;

    fn request() -> SuiteRequest {
        SuiteRequest::new(&["billing".to_string()], &RunOptions::default())
    }

    #[test]
    fn test_agent_args() {
        let options = RunOptions {
            interactive: false,
            fail_fast: true,
            database_required: false,
            verbosity: 2,
            ..RunOptions::default()
        };
        let request = SuiteRequest::new(&["billing".to_string()], &options)
            .with_extra_tests(&["billing.tests.Extra".to_string()]);
        assert_eq!(
            request.agent_args(),
            vec!["--verbosity", "2", "--noinput", "--failfast", "--nodb", "billing", "billing.tests.Extra"]
        );
        assert_eq!(request_args_default(), vec!["--verbosity", "1", "billing"]);
    }

    fn request_args_default() -> Vec<String> {
        request().agent_args()
    }

    #[test]
    fn test_read_events_tallies_and_skips_noise() {
        let output = concat!(
            "Creating test database...\n",
            r#"{"event":"started","id":"billing.tests.T.test_a"}"#, "\n",
            r#"{"event":"succeeded"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.01}"#, "\n",
            "\n",
            r#"{"event":"started","id":"billing.tests.T.test_b"}"#, "\n",
            r#"{"event":"failed","kind":"AssertionError","trace":"boom"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.02}"#, "\n",
        );
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        assert_eq!(read_events(Cursor::new(output), &mut pump).unwrap(), Flow::Continue);
        let summary = pump.finish().unwrap();
        assert_eq!(summary.tests, 2);
        assert_eq!(summary.failure_count(), 1);

        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 8);
    }

    #[test]
    fn test_fail_fast_stops_after_failing_test() {
        let output = concat!(
            r#"{"event":"started","id":"a.T.test_1"}"#, "\n",
            r#"{"event":"errored","kind":"ValueError","trace":"x"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.0}"#, "\n",
            r#"{"event":"started","id":"a.T.test_2"}"#, "\n",
        );
        let mut reporter = JsonReporter::new(Vec::new());
        let mut req = request();
        req.fail_fast = true;
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        assert_eq!(read_events(Cursor::new(output), &mut pump).unwrap(), Flow::Stop);
        assert_eq!(pump.finish().unwrap().tests, 1);
    }

    #[test]
    fn test_shutdown_stops_after_current_test() {
        let output = concat!(
            r#"{"event":"started","id":"a.T.test_1"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.0}"#, "\n",
            r#"{"event":"started","id":"a.T.test_2"}"#, "\n",
        );
        let shutdown = Shutdown::new();
        shutdown.request();
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap().with_shutdown(shutdown);
        assert_eq!(read_events(Cursor::new(output), &mut pump).unwrap(), Flow::Stop);
    }

    #[test]
    fn test_interrupt_stops_any_reporter() {
        let mut reporter = HumanReporter::new(Vec::new(), 1);
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        assert_eq!(pump.push(&TestEvent::started("a.T.test_slow", None)).unwrap(), Flow::Continue);
        assert_eq!(pump.push(&TestEvent::errored(INTERRUPT_KIND, "^C")).unwrap(), Flow::Continue);
        assert_eq!(pump.push(&TestEvent::stopped(Duration::ZERO)).unwrap(), Flow::Stop);
    }

    #[test]
    fn test_interrupted_run_never_starts_next_test() {
        let output = concat!(
            r#"{"event":"started","id":"a.T.test_1"}"#, "\n",
            r#"{"event":"errored","kind":"KeyboardInterrupt","trace":"^C"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.0}"#, "\n",
            r#"{"event":"started","id":"a.T.test_2"}"#, "\n",
            r#"{"event":"succeeded"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.0}"#, "\n",
        );
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        assert_eq!(read_events(Cursor::new(output), &mut pump).unwrap(), Flow::Stop);
        assert_eq!(pump.finish().unwrap().tests, 1);
    }

    #[test]
    fn test_plain_error_does_not_stop() {
        let mut reporter = HumanReporter::new(Vec::new(), 1);
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        pump.push(&TestEvent::started("a.T.test_1", None)).unwrap();
        pump.push(&TestEvent::errored("ValueError", "x")).unwrap();
        assert_eq!(pump.push(&TestEvent::stopped(Duration::ZERO)).unwrap(), Flow::Continue);
    }

    #[test]
    fn test_loaded_record_is_collected() {
        let output = concat!(
            r#"{"event":"started","id":"billing.tests.T.test_a"}"#, "\n",
            r#"{"event":"stopped","elapsed":0.0}"#, "\n",
            r#"{"event":"loaded","modules":[{"name":"billing.core","path":"billing/core.py"}]}"#, "\n",
        );
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        read_events(Cursor::new(output), &mut pump).unwrap();
        let summary = pump.finish().unwrap();
        assert_eq!(summary.tests, 1);
        assert_eq!(summary.loaded, vec![ModuleDescriptor::new("billing.core", "billing/core.py")]);

        // Not forwarded to the reporter as a test event
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(!out.contains("billing/core.py"));
    }

    #[test]
    fn test_import_class_load_error() {
        let output = r#"{"event":"load_error","kind":"SyntaxError","filename":"billing/broken.py","frames":["manage.py"]}"#;
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        match read_events(Cursor::new(output), &mut pump) {
            Err(HarnessError::Import(failure)) => {
                assert_eq!(failure.kind, ImportErrorKind::Syntax);
                assert_eq!(failure.responsible_file(), Some(Path::new("billing/broken.py")));
            }
            other => panic!("expected import failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_other_load_error_is_suite_error() {
        let output = r#"{"event":"load_error","kind":"RuntimeError","frames":["billing/apps.py"]}"#;
        let mut reporter = JsonReporter::new(Vec::new());
        let req = request();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        let err = read_events(Cursor::new(output), &mut pump).unwrap_err();
        assert!(matches!(err, HarnessError::Suite(ref m) if m.contains("billing/apps.py")));
    }

    #[test]
    fn test_empty_suite_command_rejected() {
        assert!(matches!(
            ProcessSuiteRunner::new(vec![], "."),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_command_line_from_config() {
        let mut config = ProjectConfig::default();
        config.suite_command = Some(vec!["python".to_string(), "agent.py".to_string()]);
        let runner = ProcessSuiteRunner::from_config(&config, Path::new(".")).unwrap();
        assert_eq!(
            runner.command_line(&request()),
            vec!["python", "agent.py", "--verbosity", "1", "billing"]
        );
    }
}
