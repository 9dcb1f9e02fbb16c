//! Run-Strategy Dispatcher Integration Tests
//!
//! Runs the dispatcher end to end against an in-memory suite and a recording
//! coverage engine, with a real component tree on disk for the resolver.

mod common;

use runtester::config::{CoverageMode, ProjectConfig, RunOptions};
use runtester::coverage::CoverageEngine;
use runtester::discovery::ModuleDescriptor;
use runtester::dispatch::{
    Dispatcher, RunContext, StrategyOptions, StrategyRegistry, TestStrategy, CALLGRAPH_PATH, XML_COVERAGE_PATH,
    XML_RESULTS_PATH,
};
use runtester::errors::{HarnessError, Result};
use runtester::events::{RunSummary, TestEvent};
use runtester::reporter::{JsonReporter, Reporter};
use runtester::resolver::CoverageResolver;
use runtester::suite::{EventPump, SuiteRequest, SuiteRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Fakes
// =============================================================================

/// Plays a fixed list of events and remembers every request.
#[derive(Default)]
struct FakeSuite {
    events: Vec<TestEvent>,
    loaded: Vec<ModuleDescriptor>,
    fail_with: Option<String>,
    requests: Vec<SuiteRequest>,
}

impl FakeSuite {
    fn with_results(passed: usize, failed: usize) -> Self {
        let mut events = Vec::new();
        for i in 0..passed {
            events.push(TestEvent::started(format!("billing.tests.T.test_ok_{i}"), None));
            events.push(TestEvent::Succeeded);
            events.push(TestEvent::stopped(Duration::from_millis(5)));
        }
        for i in 0..failed {
            events.push(TestEvent::started(format!("billing.tests.T.test_bad_{i}"), None));
            events.push(TestEvent::failed("AssertionError", "1 != 2"));
            events.push(TestEvent::stopped(Duration::from_millis(5)));
        }
        Self {
            events,
            ..Self::default()
        }
    }

    fn crashing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }
}

impl SuiteRunner for FakeSuite {
    fn run(&mut self, request: &SuiteRequest, reporter: &mut dyn Reporter) -> Result<RunSummary> {
        self.requests.push(request.clone());
        if let Some(message) = &self.fail_with {
            return Err(HarnessError::Suite(message.clone()));
        }
        let mut pump = EventPump::start(reporter, request)?;
        for event in &self.events {
            pump.push(event)?;
        }
        pump.record_loaded(self.loaded.clone());
        pump.finish()
    }
}

/// Records calls in order.
#[derive(Default)]
struct FakeCoverage {
    calls: Vec<String>,
    branch: bool,
    contexts: bool,
    reported: Vec<ModuleDescriptor>,
}

impl CoverageEngine for FakeCoverage {
    fn set_branch(&mut self, enabled: bool) {
        self.branch = enabled;
    }

    fn set_contexts(&mut self, enabled: bool) {
        self.contexts = enabled;
    }

    fn erase(&mut self) -> Result<()> {
        self.calls.push("erase".to_string());
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.calls.push("start".to_string());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.calls.push("stop".to_string());
        Ok(())
    }

    fn report(&mut self, targets: &[ModuleDescriptor], _show_missing: bool) -> Result<()> {
        self.calls.push("report".to_string());
        self.reported = targets.to_vec();
        Ok(())
    }

    fn html_report(&mut self, directory: &Path) -> Result<()> {
        self.calls.push(format!("html {}", directory.display()));
        Ok(())
    }

    fn xml_report(&mut self, _targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        self.calls.push(format!("xml {}", output.display()));
        Ok(())
    }

    fn context_report(&mut self, _targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        self.calls.push(format!("contexts {}", output.display()));
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// billing with a legacy subtree, as laid out on disk.
fn billing_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "billing/__init__.py", "");
    write(dir.path(), "billing/core.py", "def total(xs):\n    return sum(xs)\n");
    write(dir.path(), "billing/legacy_math.py", "def old_total(xs):\n    return sum(xs)\n");
    write(dir.path(), "billing/legacy_math/__init__.py", "");
    write(dir.path(), "billing/legacy_math/helpers.py", "ZERO = 0\n");
    dir
}

fn billing_config() -> ProjectConfig {
    ProjectConfig {
        installed_components: vec!["billing".to_string()],
        coverage_exclude: vec!["billing.legacy*".to_string()],
        ..ProjectConfig::default()
    }
}

fn options(coverage_mode: CoverageMode) -> RunOptions {
    RunOptions {
        coverage_mode,
        ..RunOptions::default()
    }
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Everything a dispatch needs, owned by the test.
struct Harness {
    dir: TempDir,
    suite: FakeSuite,
    coverage: FakeCoverage,
    resolver: CoverageResolver,
    output: JsonReporter<Vec<u8>>,
}

impl Harness {
    fn new(suite: FakeSuite) -> Self {
        let dir = billing_project();
        let resolver = CoverageResolver::new(dir.path(), &billing_config());
        Self {
            dir,
            suite,
            coverage: FakeCoverage::default(),
            resolver,
            output: JsonReporter::new(Vec::new()),
        }
    }

    fn ctx(&mut self) -> RunContext<'_> {
        RunContext {
            suite: &mut self.suite,
            coverage: &mut self.coverage,
            reporter: &mut self.output,
            resolver: &self.resolver,
            workdir: self.dir.path().to_path_buf(),
            html_report_dir: PathBuf::from("temp/coverage"),
        }
    }

    fn dispatch(&mut self, configured: &str, labels: &[String], options: &RunOptions) -> Result<usize> {
        Dispatcher::new(self.ctx(), configured).dispatch(labels, options)
    }

    fn names_reported(&self) -> Vec<String> {
        self.coverage.reported.iter().map(|m| m.name.clone()).collect()
    }
}

// =============================================================================
// Plain and database strategies
// =============================================================================

#[test]
fn test_plain_run_returns_failure_count() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(3, 2));
    let count = harness
        .dispatch("plain", &labels(&["billing"]), &RunOptions::default())
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(harness.suite.requests.len(), 1);
    assert!(harness.suite.requests[0].database);
    assert!(harness.coverage.calls.is_empty());
}

#[test]
fn test_nodb_forces_database_off() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    let opts = RunOptions {
        database_required: false,
        ..RunOptions::default()
    };
    let count = harness.dispatch("plain", &labels(&["billing"]), &opts).unwrap();

    assert_eq!(count, 0);
    assert!(!harness.suite.requests[0].database);
}

#[test]
fn test_configured_nodb_strategy_by_name() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch("nodb", &labels(&["billing"]), &RunOptions::default())
        .unwrap();
    assert!(!harness.suite.requests[0].database);
}

#[test]
fn test_unknown_configured_strategy() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    let err = harness
        .dispatch("does-not-exist", &labels(&["billing"]), &RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, HarnessError::UnknownStrategy(name) if name == "does-not-exist"));
    assert!(harness.suite.requests.is_empty());
}

// =============================================================================
// Coverage strategies
// =============================================================================

#[test]
fn test_coverage_wraps_suite_and_reports_targets() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(2, 0));
    let count = harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Basic))
        .unwrap();

    assert_eq!(count, 0);
    assert_eq!(harness.coverage.calls, vec!["erase", "start", "stop", "report"]);
    assert!(!harness.coverage.branch);
    assert_eq!(harness.names_reported(), vec!["billing.core"]);
}

#[test]
fn test_branch_coverage_turns_branches_on() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Branch))
        .unwrap();
    assert!(harness.coverage.branch);
}

#[test]
fn test_reports_are_written_even_when_tests_fail() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(0, 4));
    let count = harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Basic))
        .unwrap();

    assert_eq!(count, 4);
    assert!(harness.coverage.calls.contains(&"report".to_string()));
}

#[test]
fn test_coverage_is_stopped_when_suite_errors() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::crashing("agent exited"));
    let err = harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Basic))
        .unwrap_err();

    assert!(matches!(err, HarnessError::Suite(_)));
    assert_eq!(harness.coverage.calls, vec!["erase", "start", "stop"]);
}

#[test]
fn test_loaded_modules_join_coverage_targets() {
    common::init_tracing();
    let mut suite = FakeSuite::with_results(1, 0);
    suite.loaded = vec![
        ModuleDescriptor::new("billing.generated", PathBuf::from("/build/billing/generated.py")),
        ModuleDescriptor::new("shipping.rates", PathBuf::from("/src/shipping/rates.py")),
    ];
    let mut harness = Harness::new(suite);
    harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Basic))
        .unwrap();

    assert_eq!(harness.names_reported(), vec!["billing.core", "billing.generated"]);
}

#[test]
fn test_xml_coverage_writes_document_path() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Xml))
        .unwrap();

    let expected = format!("xml {}", harness.dir.path().join(XML_COVERAGE_PATH).display());
    assert_eq!(harness.coverage.calls.last(), Some(&expected));
}

#[test]
fn test_nodb_xml_coverage_combines_both() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    let opts = RunOptions {
        coverage_mode: CoverageMode::Xml,
        database_required: false,
        ..RunOptions::default()
    };
    harness.dispatch("plain", &labels(&["billing"]), &opts).unwrap();

    assert!(!harness.suite.requests[0].database);
    assert!(harness.coverage.calls.last().unwrap().starts_with("xml "));
}

#[test]
fn test_call_graph_records_contexts() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::CallGraph))
        .unwrap();

    assert!(harness.coverage.contexts);
    let expected = format!("contexts {}", harness.dir.path().join(CALLGRAPH_PATH).display());
    assert_eq!(harness.coverage.calls.last(), Some(&expected));
}

#[test]
fn test_html_report_goes_to_configured_directory() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch("plain", &labels(&["billing"]), &options(CoverageMode::Html))
        .unwrap();

    let expected = format!("html {}", harness.dir.path().join("temp/coverage").display());
    assert_eq!(harness.coverage.calls.last(), Some(&expected));
}

#[test]
fn test_sub_selector_labels_skip_report() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    harness
        .dispatch(
            "plain",
            &labels(&["billing.BillingTest.test_total"]),
            &options(CoverageMode::Basic),
        )
        .unwrap();
    assert_eq!(harness.coverage.calls, vec!["erase", "start", "stop"]);
}

// =============================================================================
// XML test report
// =============================================================================

#[test]
fn test_xml_flag_streams_results_file() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 1));
    let opts = RunOptions {
        xml_report: true,
        ..RunOptions::default()
    };
    let count = harness.dispatch("plain", &labels(&["billing"]), &opts).unwrap();
    assert_eq!(count, 1);

    let written = fs::read_to_string(harness.dir.path().join(XML_RESULTS_PATH)).unwrap();
    assert!(written.contains("<testsuite name=\"billing\">"));
    assert_eq!(written.matches("<testcase ").count(), 2);
    assert_eq!(written.matches("<failure ").count(), 1);

    // The console reporter saw the same run
    let console = String::from_utf8(harness.output.into_inner()).unwrap();
    assert_eq!(console.matches("\"event\":\"started\"").count(), 2);
}

// =============================================================================
// Calling conventions
// =============================================================================

/// Only speaks the positional convention.
struct PositionalOnly;

impl TestStrategy for PositionalOnly {
    fn name(&self) -> &str {
        "legacy"
    }

    fn run_positional(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        verbosity: u8,
        interactive: bool,
        extra: &[String],
    ) -> Option<Result<usize>> {
        let options = StrategyOptions::positional(verbosity, interactive);
        Some(ctx.run_suite(labels, &options, extra))
    }
}

/// Speaks neither convention.
struct Mute;

impl TestStrategy for Mute {
    fn name(&self) -> &str {
        "mute"
    }
}

/// Rich form fails; the positional form must never run.
struct FailsRich;

impl TestStrategy for FailsRich {
    fn name(&self) -> &str {
        "fails-rich"
    }

    fn run_with_options(
        &self,
        _ctx: &mut RunContext<'_>,
        _labels: &[String],
        _options: &StrategyOptions,
        _extra: &[String],
    ) -> Option<Result<usize>> {
        Some(Err(HarnessError::Suite("rich form failed".to_string())))
    }

    fn run_positional(
        &self,
        _ctx: &mut RunContext<'_>,
        _labels: &[String],
        _verbosity: u8,
        _interactive: bool,
        _extra: &[String],
    ) -> Option<Result<usize>> {
        panic!("positional form must not be tried after the rich form ran");
    }
}

fn custom_registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::empty();
    registry.register(Box::new(PositionalOnly));
    registry.register(Box::new(Mute));
    registry.register(Box::new(FailsRich));
    registry
}

#[test]
fn test_positional_convention_fallback() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 1));
    let opts = RunOptions {
        verbosity: 2,
        interactive: false,
        fail_fast: true,
        ..RunOptions::default()
    };
    let extra = labels(&["billing.tests.Extra.test_more"]);
    let count = Dispatcher::new(harness.ctx(), "legacy")
        .with_registry(custom_registry())
        .dispatch_with_extra(&labels(&["billing"]), &opts, &extra)
        .unwrap();

    assert_eq!(count, 1);
    let request = &harness.suite.requests[0];
    assert_eq!(request.verbosity, 2);
    assert!(!request.interactive);
    // fail-fast cannot travel through the positional form
    assert!(!request.fail_fast);
    assert_eq!(request.extra_tests, extra);
}

#[test]
fn test_strategy_without_any_convention() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    let err = Dispatcher::new(harness.ctx(), "mute")
        .with_registry(custom_registry())
        .dispatch(&labels(&["billing"]), &RunOptions::default())
        .unwrap_err();

    assert!(matches!(err, HarnessError::UnsupportedConvention(name) if name == "mute"));
    assert!(harness.suite.requests.is_empty());
}

#[test]
fn test_rich_form_error_is_not_retried() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(1, 0));
    let err = Dispatcher::new(harness.ctx(), "fails-rich")
        .with_registry(custom_registry())
        .dispatch(&labels(&["billing"]), &RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, HarnessError::Suite(message) if message == "rich form failed"));
}

#[test]
fn test_flags_select_builtins_regardless_of_registry() {
    common::init_tracing();
    let mut harness = Harness::new(FakeSuite::with_results(2, 0));
    let mut dispatcher = Dispatcher::new(harness.ctx(), "plain");
    dispatcher.registry_mut().register(Box::new(Mute));
    assert!(dispatcher.registry_mut().names().contains(&"mute"));

    // Flags still select built-ins regardless of the registry
    let count = dispatcher
        .dispatch(&labels(&["billing"]), &options(CoverageMode::Basic))
        .unwrap();
    assert_eq!(count, 0);
}
