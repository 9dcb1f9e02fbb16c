//! Streaming XML Reporter for CI Integration
//!
//! Writes one `<testcase>` element per test while the run is still going.
//! The start tag is written as soon as a test starts; its `time` attribute,
//! the failure block and the assertion notes can only be written when the
//! test stops, so they are buffered until then.
//!
//! ```text
//! NOT_STARTED --Started--> OPEN --Stopped--> CLOSED
//! ```
//!
//! Only one element is open at a time.

use crate::events::{RunSummary, TestEvent};
use crate::reporter::Reporter;
use quick_xml::escape::escape;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

/// Assertion notes are hard-cut to this many characters.
pub const NOTE_LIMIT: usize = 110;

/// Strip ANSI color codes and NUL bytes, neither of which may appear in XML
fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip escape sequence
            if chars.peek() == Some(&'[') {
                chars.next(); // consume '['
                // Skip until we hit a letter
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            result.push(c);
        }
    }
    result
}

/// Markup-safe form of free text: quotes and angle brackets escaped.
fn clean(text: &str) -> String {
    escape(strip_ansi_codes(text).as_str()).into_owned()
}

fn truncate_note(text: &str) -> String {
    text.chars().take(NOTE_LIMIT).collect()
}

/// Per-test state of the element being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    NotStarted,
    Open,
    Closed,
}

/// Reporter that streams a structured XML report.
pub struct XmlReporter<W: Write> {
    out: W,
    suite_name: String,
    state: ElementState,
    started_at: Instant,
    /// Most recent failure or error block of the open test
    pending_failure: Option<String>,
    /// Notes of the open test, deduplicated, in arrival order
    notes: Vec<String>,
    seen_notes: HashSet<String>,
    stop: bool,
}

impl XmlReporter<BufWriter<File>> {
    /// Open the report file, creating its directory on demand.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!("streaming XML report to {}", path.display());
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> XmlReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            suite_name: "runtester".to_string(),
            state: ElementState::NotStarted,
            started_at: Instant::now(),
            pending_failure: None,
            notes: Vec::new(),
            seen_notes: HashSet::new(),
            stop: false,
        }
    }

    pub fn with_suite_name(mut self, name: impl Into<String>) -> Self {
        self.suite_name = name.into();
        self
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn open(&mut self, id: &str, description: Option<&str>) -> io::Result<()> {
        if self.state == ElementState::Open {
            warn!("test {} started before the previous one stopped", id);
            let elapsed = self.started_at.elapsed().as_secs_f64();
            self.close(elapsed)?;
        }

        let (classname, name) = id.rsplit_once('.').unwrap_or(("unknown", id));
        write!(
            self.out,
            "<testcase classname=\"{}\" name=\"{}\"",
            clean(classname),
            clean(name)
        )?;
        if let Some(desc) = description.filter(|d| !d.is_empty()) {
            write!(self.out, " desc=\"{}\"", clean(desc))?;
        }
        self.started_at = Instant::now();
        self.state = ElementState::Open;
        self.out.flush()
    }

    fn buffer_failure(&mut self, element: &str, kind: &str, trace: &str) {
        let body = trace.lines().map(clean).collect::<Vec<_>>().join("\n");
        self.pending_failure = Some(format!(
            "<{element} type=\"{}\">{}</{element}>",
            clean(kind),
            body
        ));
    }

    fn buffer_note(&mut self, text: &str) {
        if self.seen_notes.insert(text.to_string()) {
            self.notes.push(text.to_string());
        }
    }

    fn close(&mut self, elapsed: f64) -> io::Result<()> {
        let elapsed = if elapsed.is_finite() { elapsed.max(0.0) } else { 0.0 };
        write!(self.out, " time=\"{:.3}\">", elapsed)?;
        if let Some(block) = self.pending_failure.take() {
            self.out.write_all(block.as_bytes())?;
        }
        for note in std::mem::take(&mut self.notes) {
            write!(self.out, "<assert>{}</assert>", clean(&truncate_note(&note)))?;
        }
        self.seen_notes.clear();
        writeln!(self.out, "</testcase>")?;
        self.state = ElementState::Closed;
        self.out.flush()
    }
}

impl<W: Write> Reporter for XmlReporter<W> {
    fn on_run_start(&mut self, _labels: &[String]) -> io::Result<()> {
        self.state = ElementState::NotStarted;
        self.stop = false;
        writeln!(self.out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
        writeln!(self.out, "<testsuite name=\"{}\">", clean(&self.suite_name))?;
        self.out.flush()
    }

    fn on_event(&mut self, event: &TestEvent) -> io::Result<()> {
        match event {
            TestEvent::Started { id, description } => self.open(id, description.as_deref())?,
            _ if self.state != ElementState::Open => {
                warn!("ignoring {:?} outside of a running test", event);
            }
            TestEvent::Succeeded => {}
            TestEvent::Failed { kind, trace } => {
                self.stop |= event.is_interrupt();
                self.buffer_failure("failure", kind, trace);
            }
            TestEvent::Errored { kind, trace } => {
                self.stop |= event.is_interrupt();
                self.buffer_failure("error", kind, trace);
            }
            TestEvent::AssertionNote { text } => self.buffer_note(text),
            TestEvent::Stopped { elapsed } => self.close(*elapsed)?,
        }
        Ok(())
    }

    fn on_run_finished(&mut self, summary: &RunSummary) -> io::Result<()> {
        if self.state == ElementState::Open {
            let elapsed = self.started_at.elapsed().as_secs_f64();
            self.close(elapsed)?;
        }
        writeln!(
            self.out,
            "<summary tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\"/>",
            summary.tests,
            summary.failures,
            summary.errors,
            summary.elapsed.as_secs_f64()
        )?;
        writeln!(self.out, "</testsuite>")?;
        self.out.flush()
    }

    fn on_error(&mut self, message: &str) {
        let _ = writeln!(self.out, "<!-- {} -->", clean(message).replace("--", "- -"));
    }

    fn stop_requested(&self) -> bool {
        self.stop
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::INTERRUPT_KIND;
    use std::time::Duration;

    fn output(reporter: XmlReporter<Vec<u8>>) -> String {
        String::from_utf8(reporter.into_inner()).unwrap()
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[31mRed text\x1b[0m"), "Red text");
        assert_eq!(strip_ansi_codes("plain text"), "plain text");
        assert_eq!(strip_ansi_codes("\x1b[1;31;40mColored\x1b[0m normal"), "Colored normal");
        assert_eq!(strip_ansi_codes("text\0with\0nulls"), "textwithnulls");
    }

    #[test]
    fn test_start_tag_is_streamed_before_stop() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter
            .on_event(&TestEvent::started("app.tests.T.test_a", Some("Adds <b>")))
            .unwrap();
        assert_eq!(reporter.state(), ElementState::Open);
        let written = output(reporter);
        assert_eq!(
            written,
            "<testcase classname=\"app.tests.T\" name=\"test_a\" desc=\"Adds &lt;b&gt;\""
        );
    }

    #[test]
    fn test_duplicate_notes_and_single_failure() {
        let mut reporter = XmlReporter::new(Vec::new());
        let events = [
            TestEvent::started("app.tests.T.test_a", None),
            TestEvent::note("checked \"x\""),
            TestEvent::note("checked \"x\""),
            TestEvent::failed("AssertionError", "line 1\nline <2>"),
            TestEvent::stopped(Duration::from_millis(1500)),
        ];
        for event in &events {
            reporter.on_event(event).unwrap();
        }
        assert_eq!(reporter.state(), ElementState::Closed);
        let written = output(reporter);
        assert_eq!(written.matches("<assert>").count(), 1);
        assert_eq!(written.matches("<failure ").count(), 1);
        assert!(written.contains(" time=\"1.500\">"));
        assert!(written.contains("<failure type=\"AssertionError\">line 1\nline &lt;2&gt;</failure>"));
        assert!(written.contains("<assert>checked &quot;x&quot;</assert>"));
        assert!(written.ends_with("</testcase>\n"));
    }

    #[test]
    fn test_only_latest_failure_is_kept() {
        let mut reporter = XmlReporter::new(Vec::new());
        for event in [
            TestEvent::started("a.b", None),
            TestEvent::failed("AssertionError", "first"),
            TestEvent::errored("ValueError", "second"),
            TestEvent::stopped(Duration::ZERO),
        ] {
            reporter.on_event(&event).unwrap();
        }
        let written = output(reporter);
        assert!(!written.contains("first"));
        assert!(written.contains("<error type=\"ValueError\">second</error>"));
    }

    #[test]
    fn test_notes_are_truncated_and_buffers_reset() {
        let long = "n".repeat(200);
        let mut reporter = XmlReporter::new(Vec::new());
        for event in [
            TestEvent::started("a.first", None),
            TestEvent::note(long.clone()),
            TestEvent::failed("AssertionError", "boom"),
            TestEvent::stopped(Duration::ZERO),
            TestEvent::started("a.second", None),
            TestEvent::Succeeded,
            TestEvent::stopped(Duration::ZERO),
        ] {
            reporter.on_event(&event).unwrap();
        }
        let written = output(reporter);
        let first = written.lines().next().unwrap();
        assert!(first.contains(&format!("<assert>{}</assert>", "n".repeat(NOTE_LIMIT))));
        let second = written.lines().nth(1).unwrap();
        assert_eq!(
            second,
            "<testcase classname=\"a\" name=\"second\" time=\"0.000\"></testcase>"
        );
    }

    #[test]
    fn test_negative_elapsed_is_clamped() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter.on_event(&TestEvent::started("a.b", None)).unwrap();
        reporter.on_event(&TestEvent::Stopped { elapsed: -3.0 }).unwrap();
        assert!(output(reporter).contains(" time=\"0.000\">"));
    }

    #[test]
    fn test_interrupt_requests_stop() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter.on_event(&TestEvent::started("a.b", None)).unwrap();
        assert!(!reporter.stop_requested());
        reporter
            .on_event(&TestEvent::errored(INTERRUPT_KIND, "^C"))
            .unwrap();
        reporter.on_event(&TestEvent::stopped(Duration::ZERO)).unwrap();
        assert!(reporter.stop_requested());
    }

    #[test]
    fn test_events_outside_a_test_are_ignored() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter.on_event(&TestEvent::note("stray")).unwrap();
        reporter.on_event(&TestEvent::stopped(Duration::ZERO)).unwrap();
        assert_eq!(reporter.state(), ElementState::NotStarted);
        assert!(output(reporter).is_empty());
    }

    #[test]
    fn test_id_without_dots_uses_unknown_classname() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter.on_event(&TestEvent::started("doctest", None)).unwrap();
        assert!(output(reporter).contains("classname=\"unknown\" name=\"doctest\""));
    }

    #[test]
    fn test_run_finished_closes_open_element() {
        let mut reporter = XmlReporter::new(Vec::new());
        reporter.on_run_start(&[]).unwrap();
        reporter.on_event(&TestEvent::started("a.b", None)).unwrap();
        let mut summary = RunSummary::default();
        summary.tests = 1;
        reporter.on_run_finished(&summary).unwrap();
        let written = output(reporter);
        assert!(written.starts_with("<?xml"));
        assert!(written.contains("</testcase>\n<summary tests=\"1\""));
        assert!(written.ends_with("</testsuite>\n"));
    }
}
