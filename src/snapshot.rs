//! Module Registry Snapshot: the set of source files that make up the code
//! under test right now.
//!
//! The change detector asks for a fresh snapshot on every poll, so a module
//! that appears between two polls is picked up (and baselined) on the next one.

use ignore::WalkBuilder;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Enumerates the source files of every currently importable module.
pub trait ModuleSnapshot: Send {
    fn source_files(&self) -> Vec<PathBuf>;
}

impl ModuleSnapshot for Vec<PathBuf> {
    fn source_files(&self) -> Vec<PathBuf> {
        self.clone()
    }
}

/// Snapshot of every Python module below a project root.
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModuleSnapshot for SourceTree {
    fn source_files(&self) -> Vec<PathBuf> {
        let root = self.root.clone();
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(true)
            .filter_entry(move |entry| !is_ignored_path(&root, entry.path()))
            .build();

        walker
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| is_python_source(path) && path.is_file())
            .collect()
    }
}

/// Compiled files are watched through the source they came from.
pub fn normalize_source_path(path: &Path) -> PathBuf {
    match path.extension().and_then(OsStr::to_str) {
        Some("pyc") | Some("pyo") => path.with_extension("py"),
        _ => path.to_path_buf(),
    }
}

pub fn is_python_source(path: &Path) -> bool {
    path.extension() == Some(OsStr::new("py"))
}

/// Directory names never walked into.
const IGNORED_DIRS: &[&str] = &[
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".git",
    ".venv",
    "venv",
    "env",
    "node_modules",
];

/// Check if a path below `root` should be ignored.
///
/// Only the components under `root` count, so a project that itself lives
/// inside an `env/` directory is still walked.
pub fn is_ignored_path(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_str().is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}
