//! Test lifecycle events and the per-run tally built from them.
//!
//! Events are produced by the suite runner one at a time, in order, and
//! consumed immediately by the reporters. The serde form is the NDJSON wire
//! format spoken by the suite agent (one object per line, tagged by `event`).

use crate::discovery::ModuleDescriptor;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error kind reported when the user interrupts a run.
pub const INTERRUPT_KIND: &str = "KeyboardInterrupt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TestEvent {
    /// A test began executing
    Started {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Succeeded,
    /// An assertion inside the test failed
    Failed { kind: String, trace: String },
    /// The test raised something other than an assertion failure
    Errored { kind: String, trace: String },
    /// Out-of-band diagnostic emitted while the test runs
    #[serde(rename = "note")]
    AssertionNote { text: String },
    /// The test finished; `elapsed` is wall-clock seconds
    Stopped { elapsed: f64 },
}

impl TestEvent {
    pub fn started(id: impl Into<String>, description: Option<&str>) -> Self {
        Self::Started {
            id: id.into(),
            description: description.map(str::to_string),
        }
    }

    pub fn failed(kind: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            trace: trace.into(),
        }
    }

    pub fn errored(kind: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Errored {
            kind: kind.into(),
            trace: trace.into(),
        }
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::AssertionNote { text: text.into() }
    }

    pub fn stopped(elapsed: Duration) -> Self {
        Self::Stopped {
            elapsed: elapsed.as_secs_f64(),
        }
    }

    /// True for an error raised by a user interrupt.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Errored { kind, .. } | Self::Failed { kind, .. } if kind == INTERRUPT_KIND)
    }
}

/// Final state of a single test, decided when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Errored,
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub tests: usize,
    pub failures: usize,
    pub errors: usize,
    pub elapsed: Duration,
    /// Modules the agent reported as loaded during the run
    pub loaded: Vec<ModuleDescriptor>,
    pending: Option<Outcome>,
}

impl RunSummary {
    /// Fold one event into the tally. The outcome of a test is the last
    /// failure or error seen before it stops.
    pub fn record(&mut self, event: &TestEvent) {
        match event {
            TestEvent::Started { .. } => {
                self.tests += 1;
                self.pending = Some(Outcome::Passed);
            }
            TestEvent::Failed { .. } => self.pending = Some(Outcome::Failed),
            TestEvent::Errored { .. } => self.pending = Some(Outcome::Errored),
            TestEvent::Stopped { .. } => match self.pending.take() {
                Some(Outcome::Failed) => self.failures += 1,
                Some(Outcome::Errored) => self.errors += 1,
                _ => {}
            },
            TestEvent::Succeeded | TestEvent::AssertionNote { .. } => {}
        }
    }

    /// Failures plus errors: the value that becomes the exit status.
    pub fn failure_count(&self) -> usize {
        self.failures + self.errors
    }

    pub fn passed(&self) -> usize {
        self.tests.saturating_sub(self.failure_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_round_trips_through_tag() {
        let line = r#"{"event":"started","id":"billing.tests.CoreTest.test_total","description":"Totals add up"}"#;
        let event: TestEvent = serde_json::from_str(line).unwrap();
        assert_eq!(
            event,
            TestEvent::started("billing.tests.CoreTest.test_total", Some("Totals add up"))
        );

        let json = serde_json::to_string(&TestEvent::note("x")).unwrap();
        assert_eq!(json, r#"{"event":"note","text":"x"}"#);
    }

    #[test]
    fn test_started_without_description() {
        let event: TestEvent = serde_json::from_str(r#"{"event":"started","id":"a.b"}"#).unwrap();
        assert_eq!(event, TestEvent::started("a.b", None));
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("description"));
    }

    #[test]
    fn test_interrupt_detection() {
        assert!(TestEvent::errored(INTERRUPT_KIND, "").is_interrupt());
        assert!(!TestEvent::errored("ValueError", "").is_interrupt());
        assert!(!TestEvent::Succeeded.is_interrupt());
    }

    #[test]
    fn test_summary_counts_last_outcome_per_test() {
        let mut summary = RunSummary::default();
        let events = [
            TestEvent::started("a", None),
            TestEvent::Succeeded,
            TestEvent::stopped(Duration::from_millis(3)),
            TestEvent::started("b", None),
            TestEvent::failed("AssertionError", "boom"),
            TestEvent::errored("ValueError", "tear down"),
            TestEvent::stopped(Duration::from_millis(3)),
            TestEvent::started("c", None),
            TestEvent::failed("AssertionError", "boom"),
            TestEvent::stopped(Duration::from_millis(3)),
        ];
        for event in &events {
            summary.record(event);
        }
        assert_eq!(summary.tests, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.failure_count(), 2);
        assert_eq!(summary.passed(), 1);
    }
}
