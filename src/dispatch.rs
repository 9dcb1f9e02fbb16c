//! Run-Strategy Dispatcher
//!
//! Turns run flags into one concrete strategy and runs it. Flags are not
//! mutually exclusive; the first match in this order wins:
//!
//! 1. no database + XML coverage
//! 2. no database + any other coverage
//! 3. no database
//! 4. XML coverage
//! 5. basic or branch coverage
//! 6. call-graph coverage
//! 7. HTML coverage report
//! 8. figleaf-style HTML coverage
//! 9. streaming XML test report
//! 10. the configured default strategy, by name
//!
//! Strategies registered by name are capability objects with two optional
//! calling conventions. The rich form is tried first; the positional form is
//! tried exactly once when the rich form is not supported.

use crate::config::{CoverageMode, RunOptions};
use crate::coverage::CoverageEngine;
use crate::errors::{HarnessError, Result};
use crate::events::RunSummary;
use crate::reporter::{MultiReporter, Reporter};
use crate::resolver::CoverageResolver;
use crate::suite::{SuiteRequest, SuiteRunner};
use crate::xmlreport::XmlReporter;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub const XML_RESULTS_PATH: &str = "temp/xml/test_output.xml";
pub const XML_COVERAGE_PATH: &str = "temp/xml/coverage_output.xml";
pub const CALLGRAPH_PATH: &str = "temp/callgraph/callgraph.json";
pub const FIGLEAF_DIR: &str = "temp/figleaf";

/// The strategy selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyKind {
    NoDatabaseXmlCoverage,
    NoDatabaseCoverage,
    NoDatabase,
    XmlCoverage,
    Coverage,
    CallGraph,
    CoverageReport,
    Figleaf,
    XmlReport,
    Configured(String),
}

impl StrategyKind {
    pub fn select(options: &RunOptions, configured: &str) -> Self {
        let mode = options.coverage_mode;
        if !options.database_required {
            return match mode {
                CoverageMode::Xml => Self::NoDatabaseXmlCoverage,
                CoverageMode::Off => Self::NoDatabase,
                _ => Self::NoDatabaseCoverage,
            };
        }
        match mode {
            CoverageMode::Xml => Self::XmlCoverage,
            CoverageMode::Basic | CoverageMode::Branch => Self::Coverage,
            CoverageMode::CallGraph => Self::CallGraph,
            CoverageMode::Html => Self::CoverageReport,
            CoverageMode::Off if options.figleaf => Self::Figleaf,
            CoverageMode::Off if options.xml_report => Self::XmlReport,
            CoverageMode::Off => Self::Configured(configured.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NoDatabaseXmlCoverage => "nodb-xml-coverage",
            Self::NoDatabaseCoverage => "nodb-coverage",
            Self::NoDatabase => "nodb",
            Self::XmlCoverage => "xml-coverage",
            Self::Coverage => "coverage",
            Self::CallGraph => "call-graph",
            Self::CoverageReport => "coverage-report",
            Self::Figleaf => "figleaf",
            Self::XmlReport => "xml",
            Self::Configured(name) => name,
        }
    }

    /// The built-in strategy for a flag-selected kind.
    fn builtin(&self, mode: CoverageMode) -> Option<Box<dyn TestStrategy>> {
        let strategy: Box<dyn TestStrategy> = match self {
            Self::NoDatabaseXmlCoverage => Box::new(Covered::without_database(Flavor::Xml)),
            Self::NoDatabaseCoverage => Box::new(Covered::without_database(Flavor::from_mode(mode))),
            Self::NoDatabase => Box::new(NoDatabase),
            Self::XmlCoverage => Box::new(Covered::new(Flavor::Xml)),
            Self::Coverage => Box::new(Covered::new(Flavor::from_mode(mode))),
            Self::CallGraph => Box::new(Covered::new(Flavor::CallGraph)),
            Self::CoverageReport => Box::new(Covered::new(Flavor::Html)),
            Self::Figleaf => Box::new(Covered::new(Flavor::Figleaf)),
            Self::XmlReport => Box::new(XmlReport),
            Self::Configured(_) => return None,
        };
        Some(strategy)
    }
}

/// Options as a strategy sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyOptions {
    pub verbosity: u8,
    pub interactive: bool,
    pub fail_fast: bool,
    pub database: bool,
}

impl StrategyOptions {
    /// What the positional convention implies for everything it cannot pass.
    pub fn positional(verbosity: u8, interactive: bool) -> Self {
        Self {
            verbosity,
            interactive,
            fail_fast: false,
            database: true,
        }
    }
}

impl From<&RunOptions> for StrategyOptions {
    fn from(options: &RunOptions) -> Self {
        Self {
            verbosity: options.verbosity,
            interactive: options.interactive,
            fail_fast: options.fail_fast,
            database: options.database_required,
        }
    }
}

/// Everything a strategy runs against.
pub struct RunContext<'a> {
    pub suite: &'a mut dyn SuiteRunner,
    pub coverage: &'a mut dyn CoverageEngine,
    pub reporter: &'a mut dyn Reporter,
    pub resolver: &'a CoverageResolver,
    /// Artifacts are written relative to this directory
    pub workdir: PathBuf,
    pub html_report_dir: PathBuf,
}

impl RunContext<'_> {
    pub fn artifact(&self, relative: &str) -> PathBuf {
        self.workdir.join(relative)
    }

    /// Run the suite and return its failure count.
    pub fn run_suite(&mut self, labels: &[String], options: &StrategyOptions, extra: &[String]) -> Result<usize> {
        Ok(self.run_suite_summary(labels, options, extra)?.failure_count())
    }

    pub fn run_suite_summary(
        &mut self,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Result<RunSummary> {
        let request = self.request(labels, options, extra);
        self.suite.run(&request, &mut *self.reporter)
    }

    fn request(&self, labels: &[String], options: &StrategyOptions, extra: &[String]) -> SuiteRequest {
        SuiteRequest {
            labels: labels.to_vec(),
            verbosity: options.verbosity,
            interactive: options.interactive,
            fail_fast: options.fail_fast,
            database: options.database,
            extra_tests: extra.to_vec(),
        }
    }
}

/// A pluggable run strategy. Implement at least one calling convention;
/// an unimplemented convention returns `None`.
pub trait TestStrategy: Send {
    fn name(&self) -> &str;

    fn run_with_options(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Option<Result<usize>> {
        let _ = (ctx, labels, options, extra);
        None
    }

    fn run_positional(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        verbosity: u8,
        interactive: bool,
        extra: &[String],
    ) -> Option<Result<usize>> {
        let _ = (ctx, labels, verbosity, interactive, extra);
        None
    }
}

/// Call a strategy, preferring the rich convention.
pub fn invoke(
    strategy: &dyn TestStrategy,
    ctx: &mut RunContext<'_>,
    labels: &[String],
    options: &StrategyOptions,
    extra: &[String],
) -> Result<usize> {
    if let Some(outcome) = strategy.run_with_options(ctx, labels, options, extra) {
        return outcome;
    }
    debug!("strategy {} has no options form, using positional form", strategy.name());
    strategy
        .run_positional(ctx, labels, options.verbosity, options.interactive, extra)
        .unwrap_or_else(|| Err(HarnessError::UnsupportedConvention(strategy.name().to_string())))
}

/// Named strategies available as the configured default.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Box<dyn TestStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// `plain`, `nodb`, `coverage` and `xml`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(Plain));
        registry.register(Box::new(NoDatabase));
        registry.register(Box::new(Covered::new(Flavor::Basic)));
        registry.register(Box::new(XmlReport));
        registry
    }

    /// Add a strategy under its own name, replacing any previous one.
    pub fn register(&mut self, strategy: Box<dyn TestStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<&dyn TestStrategy> {
        self.strategies.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

pub struct Dispatcher<'a> {
    ctx: RunContext<'a>,
    registry: StrategyRegistry,
    configured: String,
}

impl<'a> Dispatcher<'a> {
    /// `configured` names the strategy used when no flag selects one.
    pub fn new(ctx: RunContext<'a>, configured: impl Into<String>) -> Self {
        Self {
            ctx,
            registry: StrategyRegistry::with_builtins(),
            configured: configured.into(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    pub fn select(&self, options: &RunOptions) -> StrategyKind {
        StrategyKind::select(options, &self.configured)
    }

    /// Run the selected strategy. Returns the failure count.
    pub fn dispatch(&mut self, labels: &[String], options: &RunOptions) -> Result<usize> {
        self.dispatch_with_extra(labels, options, &[])
    }

    /// As `dispatch`, with additional pre-built tests added to the suite.
    pub fn dispatch_with_extra(&mut self, labels: &[String], options: &RunOptions, extra: &[String]) -> Result<usize> {
        let kind = self.select(options);
        info!("running with strategy {}", kind.name());

        let strategy_options = StrategyOptions::from(options);
        let owned;
        let strategy: &dyn TestStrategy = match &kind {
            StrategyKind::Configured(name) => self
                .registry
                .get(name)
                .ok_or_else(|| HarnessError::UnknownStrategy(name.clone()))?,
            other => match other.builtin(options.coverage_mode) {
                Some(builtin) => {
                    owned = builtin;
                    owned.as_ref()
                }
                None => return Err(HarnessError::UnknownStrategy(other.name().to_string())),
            },
        };

        invoke(strategy, &mut self.ctx, labels, &strategy_options, extra)
    }
}

// =============================================================================
// Built-in strategies
// =============================================================================

/// Runs the suite as asked.
pub struct Plain;

impl TestStrategy for Plain {
    fn name(&self) -> &str {
        "plain"
    }

    fn run_with_options(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Option<Result<usize>> {
        Some(ctx.run_suite(labels, options, extra))
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

/// Runs the suite without creating a test database.
pub struct NoDatabase;

impl TestStrategy for NoDatabase {
    fn name(&self) -> &str {
        "nodb"
    }

    fn run_with_options(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Option<Result<usize>> {
        let options = StrategyOptions {
            database: false,
            ..*options
        };
        Some(ctx.run_suite(labels, &options, extra))
    }
}

/// Which coverage artifacts a covered run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Basic,
    Branch,
    Html,
    Xml,
    CallGraph,
    Figleaf,
}

impl Flavor {
    fn from_mode(mode: CoverageMode) -> Self {
        match mode {
            CoverageMode::Branch => Self::Branch,
            CoverageMode::Html => Self::Html,
            CoverageMode::Xml => Self::Xml,
            CoverageMode::CallGraph => Self::CallGraph,
            CoverageMode::Off | CoverageMode::Basic => Self::Basic,
        }
    }
}

/// Runs the suite between coverage start and stop, then reports on the
/// resolved target modules.
pub struct Covered {
    flavor: Flavor,
    force_no_database: bool,
}

impl Covered {
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            force_no_database: false,
        }
    }

    pub fn without_database(flavor: Flavor) -> Self {
        Self {
            flavor,
            force_no_database: true,
        }
    }

    fn run(&self, ctx: &mut RunContext<'_>, labels: &[String], options: &StrategyOptions, extra: &[String]) -> Result<usize> {
        let mut options = *options;
        if self.force_no_database {
            options.database = false;
        }

        ctx.coverage.erase()?;
        ctx.coverage.set_branch(self.flavor == Flavor::Branch);
        ctx.coverage.set_contexts(self.flavor == Flavor::CallGraph);
        ctx.coverage.start()?;
        let outcome = ctx.run_suite_summary(labels, &options, extra);
        let stopped = ctx.coverage.stop();
        let summary = outcome?;
        stopped?;
        let count = summary.failure_count();

        // Reports are written whether or not tests failed
        let targets = ctx.resolver.resolve(labels, &summary.loaded)?;
        if targets.is_empty() {
            info!("no coverage targets for {:?}", labels);
            return Ok(count);
        }
        ctx.coverage.report(&targets, true)?;

        match self.flavor {
            Flavor::Basic | Flavor::Branch => {}
            Flavor::Html => {
                let dir = ctx.workdir.join(&ctx.html_report_dir);
                ctx.coverage.html_report(&dir)?;
            }
            Flavor::Xml => {
                let path = ctx.artifact(XML_COVERAGE_PATH);
                ctx.coverage.xml_report(&targets, &path)?;
            }
            Flavor::CallGraph => {
                let path = ctx.artifact(CALLGRAPH_PATH);
                ctx.coverage.context_report(&targets, &path)?;
            }
            Flavor::Figleaf => {
                let dir = ctx.artifact(FIGLEAF_DIR);
                ctx.coverage.html_report(&dir)?;
            }
        }
        Ok(count)
    }
}

impl TestStrategy for Covered {
    fn name(&self) -> &str {
        match (self.force_no_database, self.flavor) {
            (false, Flavor::Basic) => "coverage",
            (false, Flavor::Branch) => "branch-coverage",
            (false, Flavor::Html) => "coverage-report",
            (false, Flavor::Xml) => "xml-coverage",
            (false, Flavor::CallGraph) => "call-graph",
            (false, Flavor::Figleaf) => "figleaf",
            (true, Flavor::Xml) => "nodb-xml-coverage",
            (true, _) => "nodb-coverage",
        }
    }

    fn run_with_options(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Option<Result<usize>> {
        Some(self.run(ctx, labels, options, extra))
    }
}

/// Streams results to the XML test report alongside the console reporter.
pub struct XmlReport;

impl XmlReport {
    fn run(&self, ctx: &mut RunContext<'_>, labels: &[String], options: &StrategyOptions, extra: &[String]) -> Result<usize> {
        let path = ctx.artifact(XML_RESULTS_PATH);
        let mut xml = XmlReporter::create(&path)?;
        if !labels.is_empty() {
            xml = xml.with_suite_name(labels.join(","));
        }
        let request = ctx.request(labels, options, extra);
        let summary = {
            let mut both = MultiReporter::new(vec![&mut *ctx.reporter as &mut dyn Reporter, &mut xml as &mut dyn Reporter]);
            ctx.suite.run(&request, &mut both)?
        };
        info!("XML test report written to {}", path.display());
        Ok(summary.failure_count())
    }
}

impl TestStrategy for XmlReport {
    fn name(&self) -> &str {
        "xml"
    }

    fn run_with_options(
        &self,
        ctx: &mut RunContext<'_>,
        labels: &[String],
        options: &StrategyOptions,
        extra: &[String],
    ) -> Option<Result<usize>> {
        Some(self.run(ctx, labels, options, extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(coverage_mode: CoverageMode, nodb: bool) -> RunOptions {
        RunOptions {
            coverage_mode,
            database_required: !nodb,
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_selection_precedence() {
        use CoverageMode::*;
        assert_eq!(StrategyKind::select(&options(Xml, true), "plain"), StrategyKind::NoDatabaseXmlCoverage);
        assert_eq!(StrategyKind::select(&options(Branch, true), "plain"), StrategyKind::NoDatabaseCoverage);
        assert_eq!(StrategyKind::select(&options(Off, true), "plain"), StrategyKind::NoDatabase);
        assert_eq!(StrategyKind::select(&options(Xml, false), "plain"), StrategyKind::XmlCoverage);
        assert_eq!(StrategyKind::select(&options(Basic, false), "plain"), StrategyKind::Coverage);
        assert_eq!(StrategyKind::select(&options(CallGraph, false), "plain"), StrategyKind::CallGraph);
        assert_eq!(StrategyKind::select(&options(Html, false), "plain"), StrategyKind::CoverageReport);
        assert_eq!(
            StrategyKind::select(&options(Off, false), "custom"),
            StrategyKind::Configured("custom".to_string())
        );
    }

    #[test]
    fn test_report_flags_lose_to_coverage_and_nodb() {
        let mut opts = options(CoverageMode::Off, false);
        opts.figleaf = true;
        opts.xml_report = true;
        assert_eq!(StrategyKind::select(&opts, "plain"), StrategyKind::Figleaf);
        opts.figleaf = false;
        assert_eq!(StrategyKind::select(&opts, "plain"), StrategyKind::XmlReport);
        opts.coverage_mode = CoverageMode::Basic;
        assert_eq!(StrategyKind::select(&opts, "plain"), StrategyKind::Coverage);
        opts.database_required = false;
        assert_eq!(StrategyKind::select(&opts, "plain"), StrategyKind::NoDatabaseCoverage);
    }

    #[test]
    fn test_every_flag_kind_has_a_builtin() {
        let kinds = [
            StrategyKind::NoDatabaseXmlCoverage,
            StrategyKind::NoDatabaseCoverage,
            StrategyKind::NoDatabase,
            StrategyKind::XmlCoverage,
            StrategyKind::Coverage,
            StrategyKind::CallGraph,
            StrategyKind::CoverageReport,
            StrategyKind::Figleaf,
            StrategyKind::XmlReport,
        ];
        for kind in kinds {
            let builtin = kind.builtin(CoverageMode::Basic).unwrap();
            assert_eq!(builtin.name(), kind.name());
        }
        assert!(StrategyKind::Configured("plain".to_string()).builtin(CoverageMode::Off).is_none());
    }

    #[test]
    fn test_registry_builtins() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["coverage", "nodb", "plain", "xml"]);
        assert!(registry.get("figleaf").is_none());
    }

    #[test]
    fn test_positional_defaults() {
        let options = StrategyOptions::positional(2, false);
        assert!(options.database);
        assert!(!options.fail_fast);
    }
}
