//! Configuration Loader
//! - CLI argument parsing with clap (`test` and `watch` subcommands)
//! - `[tool.runtester]` section of pyproject.toml
//! - `RunOptions`, built once per invocation from the raw flags

use crate::errors::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for console results
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable CLI output (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
}

/// Which coverage instrumentation wraps the run
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CoverageMode {
    #[default]
    Off,
    /// Statement coverage, console report
    Basic,
    /// Branch coverage, console report
    Branch,
    /// Console report plus an HTML tree
    Html,
    /// Console report plus a single XML coverage document
    Xml,
    /// Per-test coverage contexts
    CallGraph,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// runtester - continuous Python test runner
#[derive(Parser, Debug)]
#[command(name = "runtester", version, about = "Continuous Python test runner")]
pub struct Cli {
    /// Log level (also: RUNTESTER_LOG env var)
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Project root containing pyproject.toml and the components
    #[arg(long, default_value = ".", global = true)]
    pub project_root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the suite once; exit status is the failure count
    Test(RunArgs),
    /// Run the suite and re-run it in a fresh process on every save
    Watch(RunArgs),
}

impl Commands {
    pub fn args(&self) -> &RunArgs {
        match self {
            Commands::Test(args) | Commands::Watch(args) => args,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Components to test (default: all installed components)
    pub labels: Vec<String>,

    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub verbosity: u8,

    /// Never prompt for confirmation
    #[arg(long)]
    pub noinput: bool,

    /// Stop after the first failing test
    #[arg(long)]
    pub failfast: bool,

    /// Run without creating a test database
    #[arg(long)]
    pub nodb: bool,

    /// Coverage mode (also: RUNTESTER_COVERAGE env var)
    #[arg(long, value_enum, default_value_t = CoverageMode::Off, env = "RUNTESTER_COVERAGE")]
    pub coverage: CoverageMode,

    /// Write an HTML coverage tree under temp/figleaf
    #[arg(long)]
    pub figleaf: bool,

    /// Stream results to temp/xml/test_output.xml
    #[arg(long)]
    pub xml: bool,

    /// Only report coverage for modules matching PATTERN (trailing * = prefix)
    #[arg(long = "include", value_name = "PATTERN")]
    pub include: Vec<String>,

    /// Never report coverage for modules matching PATTERN
    #[arg(long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Component to leave out of coverage discovery
    #[arg(long = "skip", value_name = "COMPONENT")]
    pub skip: Vec<String>,

    /// Output format (also: RUNTESTER_FORMAT env var)
    #[arg(long, value_enum, default_value_t = OutputFormat::Human, env = "RUNTESTER_FORMAT")]
    pub format: OutputFormat,
}

/// Normalised run flags. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub verbosity: u8,
    pub interactive: bool,
    pub fail_fast: bool,
    pub coverage_mode: CoverageMode,
    pub database_required: bool,
    pub figleaf: bool,
    pub xml_report: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbosity: 1,
            interactive: true,
            fail_fast: false,
            coverage_mode: CoverageMode::Off,
            database_required: true,
            figleaf: false,
            xml_report: false,
        }
    }
}

impl RunOptions {
    pub fn from_args(args: &RunArgs) -> Self {
        Self {
            verbosity: args.verbosity.min(2),
            interactive: !args.noinput,
            fail_fast: args.failfast,
            coverage_mode: args.coverage,
            database_required: !args.nodb,
            figleaf: args.figleaf,
            xml_report: args.xml,
        }
    }
}

// =============================================================================
// PyProject Configuration
// =============================================================================

#[derive(Deserialize, Default)]
struct PyProject {
    tool: Option<ToolConfig>,
}

#[derive(Deserialize, Default)]
struct ToolConfig {
    runtester: Option<ProjectConfig>,
}

/// `[tool.runtester]` settings. Every key is optional.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Name of the strategy used when no flag selects one
    pub test_runner: String,
    /// Components tested when no labels are given
    pub installed_components: Vec<String>,
    /// Components whose names start with one of these belong to the host
    /// framework and are left out of label-less coverage
    pub framework_prefixes: Vec<String>,
    pub coverage_include: Vec<String>,
    pub coverage_exclude: Vec<String>,
    /// Components never discovered for coverage
    pub skip_components: Vec<String>,
    pub html_report_dir: PathBuf,
    /// argv of the suite agent
    pub suite_command: Option<Vec<String>>,
    pub coverage_command: Option<String>,
    /// Exported before any run
    pub env: HashMap<String, String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            test_runner: "plain".to_string(),
            installed_components: Vec::new(),
            framework_prefixes: vec!["django".to_string()],
            coverage_include: Vec::new(),
            coverage_exclude: Vec::new(),
            skip_components: Vec::new(),
            html_report_dir: PathBuf::from("temp/coverage"),
            suite_command: None,
            coverage_command: None,
            env: HashMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Parse the contents of a pyproject.toml.
    pub fn parse(contents: &str) -> Result<Self> {
        let pyproject: PyProject = toml::from_str(contents)?;
        Ok(pyproject
            .tool
            .and_then(|tool| tool.runtester)
            .unwrap_or_default())
    }

    /// Load `<root>/pyproject.toml`. A missing or broken file yields defaults.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join("pyproject.toml");
        if !config_path.exists() {
            return Self::default();
        }

        let contents = match fs::read_to_string(&config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to read {}: {}", config_path.display(), e);
                return Self::default();
            }
        };

        match Self::parse(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to parse {}: {}", config_path.display(), e);
                Self::default()
            }
        }
    }

    /// CLI pattern lists extend the ones from the file.
    pub fn with_cli_patterns(mut self, args: &RunArgs) -> Self {
        self.coverage_include.extend(args.include.iter().cloned());
        self.coverage_exclude.extend(args.exclude.iter().cloned());
        self.skip_components.extend(args.skip.iter().cloned());
        self
    }

    /// Export `[tool.runtester.env]` into the current process so the suite
    /// agent inherits it.
    pub fn apply_env(&self) {
        for (key, value) in &self.env {
            std::env::set_var(key, value);
            debug!("set env: {}={}", key, value);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
