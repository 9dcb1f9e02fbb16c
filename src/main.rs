use anyhow::{Context, Result};
use clap::Parser;
use runtester::config::{Cli, Commands, OutputFormat, ProjectConfig, RunArgs, RunOptions};
use runtester::coverage::CoverageCli;
use runtester::dispatch::{Dispatcher, RunContext};
use runtester::lifecycle::RunLock;
use runtester::logging::init_logging;
use runtester::reload::{guarded_run, is_supervised_child, run_watched, supervise, ReloadCoordinator};
use runtester::reporter::{HumanReporter, JsonReporter, Reporter};
use runtester::resolver::CoverageResolver;
use runtester::signals::{install_signal_handlers, Shutdown};
use runtester::snapshot::SourceTree;
use runtester::suite::ProcessSuiteRunner;
use runtester::watch::ChangeDetector;
use std::path::{Path, PathBuf};
use tracing::debug;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let root = cli
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {} not found", cli.project_root.display()))?;
    std::env::set_current_dir(&root)
        .with_context(|| format!("cannot enter project root {}", root.display()))?;

    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown).context("installing signal handlers")?;

    if matches!(cli.command, Commands::Watch(_)) && !is_supervised_child() {
        debug!("starting supervisor");
        std::process::exit(supervise(&shutdown)?);
    }

    let args = cli.command.args().clone();
    let config = load_config(&root, &args);
    let code = match cli.command {
        Commands::Test(_) => {
            let lock = RunLock::in_dir(&root);
            let count = guarded_run(&lock, || run_once(&root, &config, &args, &shutdown))?;
            count.min(255) as i32
        }
        Commands::Watch(_) => {
            let coordinator = ReloadCoordinator::new(
                ChangeDetector::new(SourceTree::new(&root)),
                RunLock::in_dir(&root),
            );
            let run_root: PathBuf = root.clone();
            let run_shutdown = shutdown.clone();
            let outcome = run_watched(coordinator, &shutdown, move || {
                run_once(&run_root, &config, &args, &run_shutdown)
            })?;
            outcome.exit_code()
        }
    };

    std::process::exit(code);
}

fn load_config(root: &Path, args: &RunArgs) -> ProjectConfig {
    let config = ProjectConfig::load(root).with_cli_patterns(args);
    config.apply_env();
    config
}

/// One run of the selected strategy. Returns the failure count.
fn run_once(
    root: &Path,
    config: &ProjectConfig,
    args: &RunArgs,
    shutdown: &Shutdown,
) -> runtester::errors::Result<usize> {
    let options = RunOptions::from_args(args);
    let mut suite = ProcessSuiteRunner::from_config(config, root)?.with_shutdown(shutdown.clone());
    let mut coverage = CoverageCli::from_config(config, root);
    let resolver = CoverageResolver::new(root, config);
    let mut reporter: Box<dyn Reporter> = match args.format {
        OutputFormat::Human => Box::new(HumanReporter::stderr(options.verbosity)),
        OutputFormat::Json => Box::new(JsonReporter::stdout()),
    };

    let ctx = RunContext {
        suite: &mut suite,
        coverage: &mut coverage,
        reporter: reporter.as_mut(),
        resolver: &resolver,
        workdir: root.to_path_buf(),
        html_report_dir: config.html_report_dir.clone(),
    };
    let mut dispatcher = Dispatcher::new(ctx, config.test_runner.clone());
    dispatcher.dispatch(&args.labels, &options)
}
