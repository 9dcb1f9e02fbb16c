//! Coverage engine: start/stop/erase/report primitives around coverage.py.
//!
//! Measurement happens inside the suite agent. `start` writes an rc file and
//! exports `COVERAGE_PROCESS_START`, which the agent's startup hook turns into
//! a running collector; `stop` withdraws the variable and combines the
//! parallel data files.

use crate::config::ProjectConfig;
use crate::discovery::ModuleDescriptor;
use crate::environment::coverage_executable;
use crate::errors::{HarnessError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

pub const PROCESS_START_ENV: &str = "COVERAGE_PROCESS_START";

/// The coverage-engine collaborator.
pub trait CoverageEngine: Send {
    /// Branch coverage on or off. Takes effect at the next `start`.
    fn set_branch(&mut self, enabled: bool);

    /// Record which test executed each line. Takes effect at the next `start`.
    fn set_contexts(&mut self, enabled: bool);

    fn erase(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Console report restricted to `targets`.
    fn report(&mut self, targets: &[ModuleDescriptor], show_missing: bool) -> Result<()>;

    fn html_report(&mut self, directory: &Path) -> Result<()> {
        let _ = directory;
        Err(HarnessError::Coverage("HTML reports are not supported".to_string()))
    }

    fn xml_report(&mut self, targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        let _ = (targets, output);
        Err(HarnessError::Coverage("XML reports are not supported".to_string()))
    }

    /// Per-test contexts for the call-graph report.
    fn context_report(&mut self, targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        let _ = (targets, output);
        Err(HarnessError::Coverage("context reports are not supported".to_string()))
    }
}

/// Drives the `coverage` command line tool.
#[derive(Debug, Clone)]
pub struct CoverageCli {
    program: PathBuf,
    workdir: PathBuf,
    rcfile: PathBuf,
    branch: bool,
    contexts: bool,
}

impl CoverageCli {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            program: program.into(),
            rcfile: workdir.join("temp").join("runtester.coveragerc"),
            workdir,
            branch: false,
            contexts: false,
        }
    }

    pub fn from_config(config: &ProjectConfig, project_root: &Path) -> Self {
        let program = config
            .coverage_command
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| coverage_executable(project_root));
        Self::new(program, project_root)
    }

    pub fn rcfile(&self) -> &Path {
        &self.rcfile
    }

    /// Contents of the rc file the collector is started with.
    pub fn rc_contents(&self) -> String {
        let mut rc = String::from("[run]\n");
        rc.push_str(&format!("branch = {}\n", if self.branch { "True" } else { "False" }));
        rc.push_str("parallel = True\n");
        rc.push_str(&format!("data_file = {}\n", self.workdir.join(".coverage").display()));
        if self.contexts {
            rc.push_str("dynamic_context = test_function\n");
        }
        rc
    }

    fn include_arg(targets: &[ModuleDescriptor]) -> String {
        let paths: Vec<String> = targets
            .iter()
            .map(|m| m.path.to_string_lossy().into_owned())
            .collect();
        format!("--include={}", paths.join(","))
    }

    pub fn report_args(&self, targets: &[ModuleDescriptor], show_missing: bool) -> Vec<String> {
        let mut args = vec!["report".to_string()];
        if show_missing {
            args.push("-m".to_string());
        }
        args.push(Self::include_arg(targets));
        args
    }

    pub fn xml_args(&self, targets: &[ModuleDescriptor], output: &Path) -> Vec<String> {
        vec![
            "xml".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            Self::include_arg(targets),
        ]
    }

    pub fn context_args(&self, targets: &[ModuleDescriptor], output: &Path) -> Vec<String> {
        vec![
            "json".to_string(),
            "--show-contexts".to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            Self::include_arg(targets),
        ]
    }

    fn invoke(&self, args: &[String]) -> Result<()> {
        debug!("coverage {}", args.join(" "));
        // Tool output goes to stderr so stdout stays machine readable
        let status = Command::new(&self.program)
            .args(args)
            .arg(format!("--rcfile={}", self.rcfile.display()))
            .current_dir(&self.workdir)
            .stdout(Stdio::from(io::stderr()))
            .status()
            .map_err(|e| {
                HarnessError::Coverage(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        if !status.success() {
            return Err(HarnessError::Coverage(format!(
                "`coverage {}` exited with {}",
                args.first().map(String::as_str).unwrap_or_default(),
                status
            )));
        }
        Ok(())
    }

    fn write_rcfile(&self) -> Result<()> {
        if let Some(parent) = self.rcfile.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.rcfile, self.rc_contents())?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

impl CoverageEngine for CoverageCli {
    fn set_branch(&mut self, enabled: bool) {
        self.branch = enabled;
    }

    fn set_contexts(&mut self, enabled: bool) {
        self.contexts = enabled;
    }

    fn erase(&mut self) -> Result<()> {
        self.write_rcfile()?;
        self.invoke(&["erase".to_string()])
    }

    fn start(&mut self) -> Result<()> {
        self.write_rcfile()?;
        std::env::set_var(PROCESS_START_ENV, &self.rcfile);
        debug!("coverage collection armed via {}", self.rcfile.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        std::env::remove_var(PROCESS_START_ENV);
        if let Err(e) = self.invoke(&["combine".to_string()]) {
            // Nothing to combine when no test process produced data
            warn!("{}", e);
        }
        Ok(())
    }

    fn report(&mut self, targets: &[ModuleDescriptor], show_missing: bool) -> Result<()> {
        let args = self.report_args(targets, show_missing);
        self.invoke(&args)
    }

    fn html_report(&mut self, directory: &Path) -> Result<()> {
        fs::create_dir_all(directory)?;
        self.invoke(&[
            "html".to_string(),
            "-d".to_string(),
            directory.to_string_lossy().into_owned(),
        ])
    }

    fn xml_report(&mut self, targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        ensure_parent(output)?;
        let args = self.xml_args(targets, output);
        self.invoke(&args)
    }

    fn context_report(&mut self, targets: &[ModuleDescriptor], output: &Path) -> Result<()> {
        ensure_parent(output)?;
        let args = self.context_args(targets, output);
        self.invoke(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<ModuleDescriptor> {
        vec![
            ModuleDescriptor::new("billing.core", "/srv/app/billing/core.py"),
            ModuleDescriptor::new("billing.tax", "/srv/app/billing/tax.py"),
        ]
    }

    #[test]
    fn test_rc_contents_follow_switches() {
        let mut cli = CoverageCli::new("coverage", "/srv/app");
        assert!(cli.rc_contents().contains("branch = False"));
        assert!(!cli.rc_contents().contains("dynamic_context"));

        cli.set_branch(true);
        cli.set_contexts(true);
        let rc = cli.rc_contents();
        assert!(rc.contains("branch = True"));
        assert!(rc.contains("dynamic_context = test_function"));
        assert!(rc.contains("data_file = /srv/app/.coverage"));
    }

    #[test]
    fn test_report_args_restrict_to_targets() {
        let cli = CoverageCli::new("coverage", "/srv/app");
        assert_eq!(
            cli.report_args(&targets(), true),
            vec![
                "report",
                "-m",
                "--include=/srv/app/billing/core.py,/srv/app/billing/tax.py"
            ]
        );
        assert_eq!(cli.report_args(&targets(), false)[1], "--include=/srv/app/billing/core.py,/srv/app/billing/tax.py");
    }

    #[test]
    fn test_xml_and_context_args() {
        let cli = CoverageCli::new("coverage", "/srv/app");
        let xml = cli.xml_args(&targets(), Path::new("temp/xml/coverage_output.xml"));
        assert_eq!(&xml[..3], ["xml", "-o", "temp/xml/coverage_output.xml"]);
        let ctx = cli.context_args(&targets(), Path::new("temp/callgraph/callgraph.json"));
        assert_eq!(ctx[1], "--show-contexts");
    }

    #[test]
    fn test_missing_tool_is_coverage_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cli = CoverageCli::new(dir.path().join("no-such-coverage"), dir.path());
        assert!(matches!(cli.erase(), Err(HarnessError::Coverage(_))));
        assert!(cli.rcfile().exists());
    }
}
