//! Streaming XML Reporter Integration Tests
//!
//! Writes reports to real files and reads them back with a conforming
//! XML parser.

use quick_xml::events::Event;
use quick_xml::Reader;
use runtester::config::RunOptions;
use runtester::errors::HarnessError;
use runtester::events::{RunSummary, TestEvent, INTERRUPT_KIND};
use runtester::reporter::Reporter;
use runtester::suite::{EventPump, ProcessSuiteRunner, SuiteRequest, SuiteRunner};
use runtester::xmlreport::{XmlReporter, NOTE_LIMIT};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// One parsed `<testcase>`.
#[derive(Debug, Default)]
struct Case {
    attrs: HashMap<String, String>,
    failures: Vec<(String, String)>,
    asserts: Vec<String>,
}

/// Parse a report, failing the test on any well-formedness error.
fn parse(path: &Path) -> Vec<Case> {
    let contents = fs::read_to_string(path).unwrap();
    let mut reader = Reader::from_str(&contents);
    reader.trim_text(true);

    let mut cases = Vec::new();
    let mut current: Option<Case> = None;
    let mut open_child: Option<String> = None;
    let mut child_type = String::new();

    loop {
        match reader.read_event().unwrap() {
            Event::Start(e) if e.name().as_ref() == b"testcase" => {
                let mut case = Case::default();
                for attr in e.attributes() {
                    let attr = attr.unwrap();
                    let key = String::from_utf8(attr.key.as_ref().to_vec()).unwrap();
                    case.attrs.insert(key, attr.unescape_value().unwrap().into_owned());
                }
                current = Some(case);
            }
            Event::Start(e) => {
                let name = String::from_utf8(e.name().as_ref().to_vec()).unwrap();
                child_type = e
                    .try_get_attribute("type")
                    .unwrap()
                    .map(|a| a.unescape_value().unwrap().into_owned())
                    .unwrap_or_default();
                open_child = Some(name);
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap().into_owned();
                if let (Some(case), Some(child)) = (current.as_mut(), open_child.as_deref()) {
                    match child {
                        "assert" => case.asserts.push(text),
                        "failure" | "error" => case.failures.push((child_type.clone(), text)),
                        _ => {}
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"testcase" => {
                cases.extend(current.take());
            }
            Event::End(_) => open_child = None,
            Event::Eof => break,
            _ => {}
        }
    }
    cases
}

fn run(path: &Path, events: &[TestEvent]) -> RunSummary {
    let mut reporter = XmlReporter::create(path).unwrap();
    let mut summary = RunSummary::default();
    reporter.on_run_start(&[]).unwrap();
    for event in events {
        summary.record(event);
        reporter.on_event(event).unwrap();
    }
    reporter.on_run_finished(&summary).unwrap();
    summary
}

#[test]
fn test_report_file_is_well_formed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("temp/xml/test_output.xml");
    let summary = run(
        &path,
        &[
            TestEvent::started("billing.tests.TotalTest.test_sum", Some("Sums <all> \"items\"")),
            TestEvent::Succeeded,
            TestEvent::stopped(Duration::from_millis(20)),
            TestEvent::started("billing.tests.TotalTest.test_tax", None),
            TestEvent::failed("AssertionError", "Traceback:\n  1 < 2 and \"x\" > 'y'"),
            TestEvent::stopped(Duration::from_millis(30)),
        ],
    );
    assert_eq!(summary.failure_count(), 1);

    let cases = parse(&path);
    assert_eq!(cases.len(), 2);

    let first = &cases[0];
    assert_eq!(first.attrs["classname"], "billing.tests.TotalTest");
    assert_eq!(first.attrs["name"], "test_sum");
    assert_eq!(first.attrs["desc"], "Sums <all> \"items\"");
    assert!(first.failures.is_empty());

    let second = &cases[1];
    assert!(!second.attrs.contains_key("desc"));
    assert_eq!(second.failures.len(), 1);
    assert_eq!(second.failures[0].0, "AssertionError");
    assert!(second.failures[0].1.contains("1 < 2 and \"x\" > 'y'"));
}

#[test]
fn test_time_attribute_is_present_and_non_negative() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.xml");
    run(
        &path,
        &[
            TestEvent::started("a.T.test_one", None),
            TestEvent::stopped(Duration::from_millis(1250)),
            TestEvent::started("a.T.test_two", None),
            TestEvent::Stopped { elapsed: -1.0 },
        ],
    );

    let times: Vec<f64> = parse(&path)
        .iter()
        .map(|case| case.attrs["time"].parse().unwrap())
        .collect();
    assert_eq!(times, vec![1.25, 0.0]);
}

#[test]
fn test_notes_deduplicated_and_truncated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.xml");
    let long = format!("checked {}", "x".repeat(300));
    run(
        &path,
        &[
            TestEvent::started("a.T.test_notes", None),
            TestEvent::note("balance == 10"),
            TestEvent::note(long.clone()),
            TestEvent::note("balance == 10"),
            TestEvent::note(long),
            TestEvent::failed("AssertionError", "first"),
            TestEvent::failed("AssertionError", "second"),
            TestEvent::stopped(Duration::ZERO),
        ],
    );

    let cases = parse(&path);
    let case = &cases[0];
    assert_eq!(case.asserts.len(), 2);
    assert_eq!(case.asserts[0], "balance == 10");
    assert_eq!(case.asserts[1].chars().count(), NOTE_LIMIT);
    assert_eq!(case.failures, vec![("AssertionError".to_string(), "second".to_string())]);
}

#[test]
fn test_unfinished_test_is_closed_at_run_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.xml");
    run(
        &path,
        &[
            TestEvent::started("a.T.test_done", None),
            TestEvent::stopped(Duration::ZERO),
            TestEvent::started("a.T.test_cut_short", None),
        ],
    );

    let cases = parse(&path);
    assert_eq!(cases.len(), 2);
    assert_eq!(cases[1].attrs["name"], "test_cut_short");
}

#[test]
fn test_interrupt_asks_runner_to_stop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.xml");
    let mut reporter = XmlReporter::create(&path).unwrap();
    reporter.on_run_start(&[]).unwrap();
    reporter.on_event(&TestEvent::started("a.T.test_slow", None)).unwrap();
    reporter.on_event(&TestEvent::failed(INTERRUPT_KIND, "^C")).unwrap();
    reporter.on_event(&TestEvent::stopped(Duration::ZERO)).unwrap();
    assert!(reporter.stop_requested());
    reporter.on_run_finished(&RunSummary::default()).unwrap();

    let cases = parse(&path);
    assert_eq!(cases[0].failures[0].0, INTERRUPT_KIND);
}

fn request() -> SuiteRequest {
    SuiteRequest::new(&["billing".to_string()], &RunOptions::default())
}

/// The document must end with its root element closed.
fn assert_closed(path: &Path) {
    let contents = fs::read_to_string(path).unwrap();
    assert!(contents.trim_end().ends_with("</testsuite>"), "unclosed report:\n{}", contents);
}

#[test]
fn test_aborted_run_still_closes_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("temp/xml/test_output.xml");
    let req = request();
    {
        let mut reporter = XmlReporter::create(&path).unwrap();
        let mut pump = EventPump::start(&mut reporter, &req).unwrap();
        pump.push(&TestEvent::started("billing.tests.T.test_ok", None)).unwrap();
        pump.push(&TestEvent::stopped(Duration::ZERO)).unwrap();
        pump.push(&TestEvent::started("billing.tests.T.test_cut_short", None)).unwrap();
        let summary = pump.abort("SyntaxError while loading billing/broken.py -- see log").unwrap();
        assert_eq!(summary.tests, 2);
    }

    assert_closed(&path);
    let cases = parse(&path);
    assert_eq!(cases.len(), 2);
    assert_eq!(cases[1].attrs["name"], "test_cut_short");
}

#[cfg(unix)]
#[test]
fn test_agent_load_error_leaves_well_formed_report() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.xml");
    let script = concat!(
        "printf '%s\\n' ",
        r#"'{"event":"started","id":"billing.tests.T.test_ok"}' "#,
        r#"'{"event":"stopped","elapsed":0.0}' "#,
        r#"'{"event":"load_error","kind":"SyntaxError","filename":"billing/broken.py","frames":[]}'"#,
    );
    let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string(), "agent".to_string()];
    let mut runner = ProcessSuiteRunner::new(argv, dir.path()).unwrap();
    {
        let mut reporter = XmlReporter::create(&path).unwrap();
        let err = runner.run(&request(), &mut reporter).unwrap_err();
        assert!(matches!(err, HarnessError::Import(_)), "got {:?}", err);
    }

    assert_closed(&path);
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("<!-- "));
    assert_eq!(parse(&path).len(), 1);
}
