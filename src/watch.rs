//! Change Detector: polls source file timestamps between test runs.
//!
//! ## Re-baseline on change
//!
//! A single save often touches several files at once. When any timestamp
//! differs from the recorded one, every recorded timestamp is dropped and the
//! next poll re-baselines the whole snapshot, instead of reporting the
//! sibling edits one poll at a time.
//!
//! ## Failed imports
//!
//! A module that failed to load never shows up in the snapshot. Its file is
//! retained here so that fixing it is still observed as a change.

use crate::errors::ImportFailure;
use crate::snapshot::{normalize_source_path, ModuleSnapshot};
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info};

/// Anything the reload coordinator can poll for changes.
pub trait ChangeSource: Send {
    /// True exactly once per observed change.
    fn has_changed(&mut self) -> bool;

    /// Keep watching a file whose module failed to load.
    fn retain_failed_import(&mut self, path: PathBuf);
}

/// A file being watched, as seen by the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub last_observed: Duration,
    pub is_from_failed_import: bool,
}

/// Modification stamp of a file.
#[cfg(not(windows))]
fn file_stamp(meta: &Metadata) -> Option<Duration> {
    meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()
}

/// Windows mtimes are unreliable across copies; offset them by creation time.
#[cfg(windows)]
fn file_stamp(meta: &Metadata) -> Option<Duration> {
    let modified = meta.modified().ok()?;
    let created = meta.created().unwrap_or(UNIX_EPOCH);
    Some(
        modified
            .duration_since(created)
            .unwrap_or_else(|_| modified.duration_since(UNIX_EPOCH).unwrap_or_default()),
    )
}

/// Polling change detector over a module snapshot.
pub struct ChangeDetector<S: ModuleSnapshot> {
    snapshot: S,
    stamps: HashMap<PathBuf, Duration>,
    /// Files retained after a failed import, in the order they failed
    failed_imports: Vec<PathBuf>,
}

impl<S: ModuleSnapshot> ChangeDetector<S> {
    pub fn new(snapshot: S) -> Self {
        Self {
            snapshot,
            stamps: HashMap::new(),
            failed_imports: Vec::new(),
        }
    }

    /// Record the file responsible for an import-class failure.
    pub fn record_import_failure(&mut self, failure: &ImportFailure) {
        if let Some(path) = failure.responsible_file() {
            self.retain(path.to_path_buf());
        }
    }

    pub fn is_retained(&self, path: &Path) -> bool {
        self.failed_imports.iter().any(|p| p == path)
    }

    pub fn recorded_stamp(&self, path: &Path) -> Option<Duration> {
        self.stamps.get(path).copied()
    }

    pub fn recorded_len(&self) -> usize {
        self.stamps.len()
    }

    /// Every file with a recorded timestamp.
    pub fn watched(&self) -> Vec<WatchedFile> {
        let mut files: Vec<WatchedFile> = self
            .stamps
            .iter()
            .map(|(path, stamp)| WatchedFile {
                path: path.clone(),
                last_observed: *stamp,
                is_from_failed_import: self.is_retained(path),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    fn retain(&mut self, path: PathBuf) {
        let path = normalize_source_path(&path);
        if !self.is_retained(&path) {
            debug!("retaining failed import {}", path.display());
            self.failed_imports.push(path);
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .snapshot
            .source_files()
            .iter()
            .map(|p| normalize_source_path(p))
            .collect();
        files.extend(self.failed_imports.iter().cloned());
        files
    }

    /// Poll once. See the module docs for the re-baseline rule.
    pub fn poll(&mut self) -> bool {
        for path in self.candidates() {
            // Missing files (zipped packages, deleted modules) are skipped
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Some(stamp) = file_stamp(&meta) else {
                continue;
            };

            match self.stamps.get(&path) {
                None => {
                    self.stamps.insert(path, stamp);
                }
                Some(recorded) if *recorded != stamp => {
                    info!("change detected in {}", path.display());
                    self.stamps.clear();
                    self.failed_imports.retain(|p| p != &path);
                    return true;
                }
                Some(_) => {}
            }
        }
        false
    }
}

impl<S: ModuleSnapshot> ChangeSource for ChangeDetector<S> {
    fn has_changed(&mut self) -> bool {
        self.poll()
    }

    fn retain_failed_import(&mut self, path: PathBuf) {
        self.retain(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ImportErrorKind;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        fs::write(&a, "a = 1\n").unwrap();
        fs::write(&b, "b = 1\n").unwrap();
        touch(&a, 1_000);
        touch(&b, 1_000);
        (dir, a, b)
    }

    #[test]
    fn test_first_poll_only_baselines() {
        let (_dir, a, b) = fixture();
        let mut detector = ChangeDetector::new(vec![a.clone(), b.clone()]);
        assert!(!detector.has_changed());
        assert_eq!(detector.recorded_len(), 2);
        assert!(!detector.has_changed());
        assert_eq!(detector.recorded_len(), 2);
    }

    #[test]
    fn test_change_reported_once_then_rebaselined() {
        let (_dir, a, b) = fixture();
        let mut detector = ChangeDetector::new(vec![a.clone(), b.clone()]);
        detector.has_changed();

        touch(&a, 2_000);
        assert!(detector.has_changed());
        assert_eq!(detector.recorded_len(), 0);

        // Next poll re-baselines, no second report
        assert!(!detector.has_changed());
        assert_eq!(detector.recorded_stamp(&a), Some(Duration::from_secs(2_000)));
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let (dir, a, _b) = fixture();
        let ghost = dir.path().join("ghost.py");
        let mut detector = ChangeDetector::new(vec![a, ghost.clone()]);
        assert!(!detector.has_changed());
        assert_eq!(detector.recorded_len(), 1);
        assert!(detector.recorded_stamp(&ghost).is_none());
    }

    #[test]
    fn test_failed_import_is_watched_until_it_changes() {
        let (dir, a, _b) = fixture();
        let broken = dir.path().join("broken.py");
        fs::write(&broken, "def oops(:\n").unwrap();
        touch(&broken, 1_000);

        let mut detector = ChangeDetector::new(vec![a]);
        detector.record_import_failure(&ImportFailure {
            kind: ImportErrorKind::Syntax,
            filename: Some(broken.clone()),
            frames: vec![],
        });
        assert!(detector.is_retained(&broken));
        assert!(!detector.has_changed());
        assert!(detector.recorded_stamp(&broken).is_some());

        touch(&broken, 3_000);
        assert!(detector.has_changed());
        assert!(!detector.is_retained(&broken));
    }

    #[test]
    fn test_unrelated_change_keeps_retention() {
        let (dir, a, _b) = fixture();
        let broken = dir.path().join("broken.py");
        fs::write(&broken, "x = (\n").unwrap();

        let mut detector = ChangeDetector::new(vec![a.clone()]);
        detector.retain_failed_import(broken.clone());
        detector.has_changed();

        touch(&a, 5_000);
        assert!(detector.has_changed());
        assert!(detector.is_retained(&broken));
        assert!(detector.recorded_stamp(&broken).is_none());
    }

    #[test]
    fn test_compiled_path_is_retained_as_source() {
        let mut detector = ChangeDetector::new(Vec::<PathBuf>::new());
        detector.retain_failed_import(PathBuf::from("app/models.pyc"));
        assert!(detector.is_retained(Path::new("app/models.py")));
        assert!(!detector.is_retained(Path::new("app/models.pyc")));
    }

    #[test]
    fn test_watched_view_flags_failed_imports() {
        let (dir, a, _b) = fixture();
        let broken = dir.path().join("broken.py");
        fs::write(&broken, "x = (\n").unwrap();
        let mut detector = ChangeDetector::new(vec![a.clone()]);
        detector.retain_failed_import(broken.clone());
        detector.has_changed();

        let watched = detector.watched();
        assert_eq!(watched.len(), 2);
        let entry = watched.iter().find(|w| w.path == broken).unwrap();
        assert!(entry.is_from_failed_import);
        let entry = watched.iter().find(|w| w.path == a).unwrap();
        assert!(!entry.is_from_failed_import);
    }
}
