//! Environment detection: which interpreter and which coverage tool to run.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Find the project's virtual environment.
///
/// Search order:
/// 1. $VIRTUAL_ENV environment variable (set by activated venvs)
/// 2. .venv directory in the project root
/// 3. venv directory in the project root
pub fn find_venv(project_root: &Path) -> Option<PathBuf> {
    find_venv_from(std::env::var_os("VIRTUAL_ENV").map(PathBuf::from), project_root)
}

fn find_venv_from(virtual_env: Option<PathBuf>, project_root: &Path) -> Option<PathBuf> {
    let candidates = virtual_env
        .into_iter()
        .chain([project_root.join(".venv"), project_root.join("venv")]);

    for venv in candidates {
        if venv.join("bin").join("python").exists() {
            debug!("using virtualenv {}", venv.display());
            return Some(venv);
        }
    }
    None
}

/// Interpreter used to launch the suite agent.
pub fn python_executable(project_root: &Path) -> PathBuf {
    find_venv(project_root)
        .map(|venv| venv.join("bin").join("python"))
        .unwrap_or_else(|| PathBuf::from("python3"))
}

/// The coverage.py command line tool.
pub fn coverage_executable(project_root: &Path) -> PathBuf {
    find_venv(project_root)
        .map(|venv| venv.join("bin").join("coverage"))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("coverage"))
}
