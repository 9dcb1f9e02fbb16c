//! Reporter Module: Trait-based output for console, NDJSON and XML formats
//!
//! ## Architecture
//!
//! - `Reporter` trait receives the test lifecycle events as they happen
//! - `HumanReporter` writes console output (to stderr)
//! - `JsonReporter` writes NDJSON (to stdout)
//! - `XmlReporter` (see `xmlreport`) streams the structured report to a file
//!
//! ## Stdout Purity
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout.
//! All other output (logs, console progress) goes to stderr.

use crate::events::{RunSummary, TestEvent};
use serde::Serialize;
use std::io::{self, Write};

/// Run-level records for JSON output. Per-test records are the
/// `TestEvent` wire form itself.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunRecord<'a> {
    /// Emitted at start of test run
    RunStart { labels: &'a [String] },
    /// Emitted at end of test run
    RunFinished {
        tests: usize,
        failures: usize,
        errors: usize,
        duration_ms: u64,
    },
    /// Emitted on fatal error
    Error { message: &'a str },
}

/// Reporter trait for output abstraction
pub trait Reporter {
    /// Called once before the first test starts
    fn on_run_start(&mut self, labels: &[String]) -> io::Result<()>;

    /// Called for every lifecycle event, in order
    fn on_event(&mut self, event: &TestEvent) -> io::Result<()>;

    /// Called once after the last test stopped
    fn on_run_finished(&mut self, summary: &RunSummary) -> io::Result<()>;

    /// Called on fatal error
    fn on_error(&mut self, message: &str);

    /// Checked by the suite runner after each `Stopped` event.
    fn stop_requested(&self) -> bool {
        false
    }
}

// =============================================================================
// JsonReporter
// =============================================================================

/// JSON Reporter - outputs NDJSON
pub struct JsonReporter<W: Write = io::Stdout> {
    out: W,
}

impl JsonReporter {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn on_run_start(&mut self, labels: &[String]) -> io::Result<()> {
        self.emit(&RunRecord::RunStart { labels })
    }

    fn on_event(&mut self, event: &TestEvent) -> io::Result<()> {
        self.emit(event)
    }

    fn on_run_finished(&mut self, summary: &RunSummary) -> io::Result<()> {
        self.emit(&RunRecord::RunFinished {
            tests: summary.tests,
            failures: summary.failures,
            errors: summary.errors,
            duration_ms: summary.elapsed.as_millis() as u64,
        })
    }

    fn on_error(&mut self, message: &str) {
        let _ = self.emit(&RunRecord::Error { message });
    }
}

// =============================================================================
// HumanReporter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Ok,
    Fail,
    Error,
}

/// Human Reporter - outputs readable text to stderr
///
/// Verbosity 0 prints only the summary, 1 prints one glyph per test and
/// 2 prints one line per test.
pub struct HumanReporter<W: Write = io::Stderr> {
    out: W,
    verbosity: u8,
    current: Option<String>,
    status: Status,
    /// (test id, label, kind, trace) for the post-run listing
    problems: Vec<(String, &'static str, String, String)>,
}

impl HumanReporter {
    pub fn stderr(verbosity: u8) -> Self {
        Self::new(io::stderr(), verbosity)
    }
}

impl<W: Write> HumanReporter<W> {
    pub fn new(out: W, verbosity: u8) -> Self {
        Self {
            out,
            verbosity,
            current: None,
            status: Status::Ok,
            problems: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn remember(&mut self, label: &'static str, kind: &str, trace: &str) {
        let id = self.current.clone().unwrap_or_default();
        self.problems.retain(|(known, ..)| known != &id);
        self.problems
            .push((id, label, kind.to_string(), trace.to_string()));
    }
}

impl<W: Write> Reporter for HumanReporter<W> {
    fn on_run_start(&mut self, labels: &[String]) -> io::Result<()> {
        if self.verbosity > 1 {
            if labels.is_empty() {
                writeln!(self.out, "[runtester] Running all components...")?;
            } else {
                writeln!(self.out, "[runtester] Running {}...", labels.join(", "))?;
            }
        }
        self.problems.clear();
        Ok(())
    }

    fn on_event(&mut self, event: &TestEvent) -> io::Result<()> {
        match event {
            TestEvent::Started { id, .. } => {
                self.current = Some(id.clone());
                self.status = Status::Ok;
                if self.verbosity > 1 {
                    write!(self.out, "{} ... ", id)?;
                }
            }
            TestEvent::Failed { kind, trace } => {
                self.status = Status::Fail;
                self.remember("FAIL", kind, trace);
            }
            TestEvent::Errored { kind, trace } => {
                self.status = Status::Error;
                self.remember("ERROR", kind, trace);
            }
            TestEvent::Stopped { .. } => {
                match (self.verbosity, self.status) {
                    (0, _) => {}
                    (1, Status::Ok) => write!(self.out, ".")?,
                    (1, Status::Fail) => write!(self.out, "F")?,
                    (1, Status::Error) => write!(self.out, "E")?,
                    (_, Status::Ok) => writeln!(self.out, "ok")?,
                    (_, Status::Fail) => writeln!(self.out, "FAIL")?,
                    (_, Status::Error) => writeln!(self.out, "ERROR")?,
                }
                self.current = None;
                self.out.flush()?;
            }
            TestEvent::Succeeded | TestEvent::AssertionNote { .. } => {}
        }
        Ok(())
    }

    fn on_run_finished(&mut self, summary: &RunSummary) -> io::Result<()> {
        if self.verbosity == 1 && summary.tests > 0 {
            writeln!(self.out)?;
        }
        for (id, label, kind, trace) in &self.problems {
            writeln!(self.out, "{}", "=".repeat(70))?;
            writeln!(self.out, "{}: {}", label, id)?;
            writeln!(self.out, "{}", "-".repeat(70))?;
            for line in trace.lines() {
                writeln!(self.out, "{}", line)?;
            }
            if !trace.contains(kind.as_str()) {
                writeln!(self.out, "{}", kind)?;
            }
            writeln!(self.out)?;
        }
        writeln!(self.out, "{}", "-".repeat(70))?;
        writeln!(
            self.out,
            "Ran {} test{} in {:.3}s",
            summary.tests,
            if summary.tests == 1 { "" } else { "s" },
            summary.elapsed.as_secs_f64()
        )?;
        writeln!(self.out)?;
        if summary.failure_count() == 0 {
            writeln!(self.out, "OK")?;
        } else {
            let mut parts = Vec::new();
            if summary.failures > 0 {
                parts.push(format!("failures={}", summary.failures));
            }
            if summary.errors > 0 {
                parts.push(format!("errors={}", summary.errors));
            }
            writeln!(self.out, "FAILED ({})", parts.join(", "))?;
        }
        self.out.flush()
    }

    fn on_error(&mut self, message: &str) {
        let _ = writeln!(self.out, "[runtester] FATAL ERROR: {}", message);
    }
}

// =============================================================================
// MultiReporter
// =============================================================================

/// MultiReporter - broadcasts events to multiple borrowed reporters
pub struct MultiReporter<'a> {
    reporters: Vec<&'a mut dyn Reporter>,
}

impl<'a> MultiReporter<'a> {
    pub fn new(reporters: Vec<&'a mut dyn Reporter>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: &'a mut dyn Reporter) {
        self.reporters.push(reporter);
    }
}

impl Reporter for MultiReporter<'_> {
    fn on_run_start(&mut self, labels: &[String]) -> io::Result<()> {
        for r in &mut self.reporters {
            r.on_run_start(labels)?;
        }
        Ok(())
    }

    fn on_event(&mut self, event: &TestEvent) -> io::Result<()> {
        for r in &mut self.reporters {
            r.on_event(event)?;
        }
        Ok(())
    }

    fn on_run_finished(&mut self, summary: &RunSummary) -> io::Result<()> {
        for r in &mut self.reporters {
            r.on_run_finished(summary)?;
        }
        Ok(())
    }

    fn on_error(&mut self, message: &str) {
        for r in &mut self.reporters {
            r.on_error(message);
        }
    }

    fn stop_requested(&self) -> bool {
        self.reporters.iter().any(|r| r.stop_requested())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn feed<R: Reporter>(reporter: &mut R, events: &[TestEvent]) -> RunSummary {
        let mut summary = RunSummary::default();
        reporter.on_run_start(&[]).unwrap();
        for event in events {
            summary.record(event);
            reporter.on_event(event).unwrap();
        }
        reporter.on_run_finished(&summary).unwrap();
        summary
    }

    fn one_pass_one_fail() -> Vec<TestEvent> {
        vec![
            TestEvent::started("app.tests.T.test_ok", None),
            TestEvent::Succeeded,
            TestEvent::stopped(Duration::from_millis(2)),
            TestEvent::started("app.tests.T.test_bad", None),
            TestEvent::failed("AssertionError", "Traceback\n  assert 1 == 2\nAssertionError"),
            TestEvent::stopped(Duration::from_millis(2)),
        ]
    }

    #[test]
    fn test_json_reporter_emits_one_line_per_record() {
        let mut reporter = JsonReporter::new(Vec::new());
        feed(&mut reporter, &one_pass_one_fail());
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[0].contains("\"event\":\"run_start\""));
        assert!(lines[1].contains("\"event\":\"started\""));
        assert!(lines[7].contains("\"failures\":1"));
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn test_human_reporter_progress_glyphs() {
        let mut reporter = HumanReporter::new(Vec::new(), 1);
        feed(&mut reporter, &one_pass_one_fail());
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(out.starts_with(".F\n"));
        assert!(out.contains("FAIL: app.tests.T.test_bad"));
        assert!(out.contains("Ran 2 tests"));
        assert!(out.contains("FAILED (failures=1)"));
    }

    #[test]
    fn test_human_reporter_verbose_lines() {
        let mut reporter = HumanReporter::new(Vec::new(), 2);
        feed(&mut reporter, &one_pass_one_fail());
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(out.contains("app.tests.T.test_ok ... ok\n"));
        assert!(out.contains("app.tests.T.test_bad ... FAIL\n"));
    }

    #[test]
    fn test_human_reporter_quiet_prints_summary_only() {
        let mut reporter = HumanReporter::new(Vec::new(), 0);
        let events = vec![
            TestEvent::started("a", None),
            TestEvent::Succeeded,
            TestEvent::stopped(Duration::from_millis(1)),
        ];
        feed(&mut reporter, &events);
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(!out.starts_with('.'));
        assert!(out.contains("Ran 1 test in"));
        assert!(out.trim_end().ends_with("OK"));
    }

    #[test]
    fn test_human_reporter_lists_only_latest_problem_per_test() {
        let mut reporter = HumanReporter::new(Vec::new(), 1);
        let events = vec![
            TestEvent::started("a", None),
            TestEvent::failed("AssertionError", "first"),
            TestEvent::errored("RuntimeError", "second"),
            TestEvent::stopped(Duration::from_millis(1)),
        ];
        feed(&mut reporter, &events);
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(out.contains("ERROR: a"));
        assert!(!out.contains("FAIL: a"));
    }

    struct Stopper;

    impl Reporter for Stopper {
        fn on_run_start(&mut self, _labels: &[String]) -> io::Result<()> {
            Ok(())
        }
        fn on_event(&mut self, _event: &TestEvent) -> io::Result<()> {
            Ok(())
        }
        fn on_run_finished(&mut self, _summary: &RunSummary) -> io::Result<()> {
            Ok(())
        }
        fn on_error(&mut self, _message: &str) {}
        fn stop_requested(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_multi_reporter_forwards_stop_request() {
        let mut quiet = HumanReporter::new(Vec::new(), 0);
        let mut stopper = Stopper;
        let mut multi = MultiReporter::new(vec![&mut quiet as &mut dyn Reporter]);
        assert!(!multi.stop_requested());
        multi.push(&mut stopper);
        assert!(multi.stop_requested());
    }
}
