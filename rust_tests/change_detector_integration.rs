//! Change Detector Integration Tests
//!
//! Drives `ChangeDetector` over a real `SourceTree` on disk. Timestamps are
//! set explicitly instead of sleeping.

use runtester::errors::{ImportErrorKind, ImportFailure};
use runtester::snapshot::SourceTree;
use runtester::watch::{ChangeDetector, ChangeSource};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    set_mtime(&path, 1_000);
    path
}

/// billing/{__init__,core,tax}.py
fn project() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join(".git")).unwrap();
    write(dir.path(), "billing/__init__.py", "");
    let core = write(dir.path(), "billing/core.py", "def total(xs):\n    return sum(xs)\n");
    let tax = write(dir.path(), "billing/tax.py", "RATE = 0.2\n");
    (dir, core, tax)
}

#[test]
fn test_untouched_tree_never_reports_change() {
    let (dir, core, _tax) = project();
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path()));

    assert!(!detector.has_changed());
    let baseline = detector.watched();
    assert_eq!(baseline.len(), 3);

    for _ in 0..3 {
        assert!(!detector.has_changed());
    }
    assert_eq!(detector.watched(), baseline);
    assert_eq!(detector.recorded_stamp(&core), Some(Duration::from_secs(1_000)));
}

#[test]
fn test_single_edit_reported_exactly_once() {
    let (dir, core, tax) = project();
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path()));
    detector.has_changed();

    set_mtime(&tax, 2_000);
    assert!(detector.has_changed());
    assert_eq!(detector.recorded_len(), 0, "change must force a full re-baseline");

    assert!(!detector.has_changed());
    assert_eq!(detector.recorded_len(), 3);
    assert_eq!(detector.recorded_stamp(&tax), Some(Duration::from_secs(2_000)));
    assert_eq!(detector.recorded_stamp(&core), Some(Duration::from_secs(1_000)));
}

#[test]
fn test_edits_to_several_files_in_one_save_count_once() {
    let (dir, core, tax) = project();
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path()));
    detector.has_changed();

    set_mtime(&core, 3_000);
    set_mtime(&tax, 3_000);
    assert!(detector.has_changed());
    assert!(!detector.has_changed());
}

#[test]
fn test_new_module_is_baselined_not_reported() {
    let (dir, _core, _tax) = project();
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path()));
    detector.has_changed();

    let added = write(dir.path(), "billing/refunds.py", "x = 1\n");
    assert!(!detector.has_changed());
    assert!(detector.recorded_stamp(&added).is_some());
}

#[test]
fn test_deleted_module_is_not_a_change() {
    let (dir, _core, tax) = project();
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path()));
    detector.has_changed();

    fs::remove_file(&tax).unwrap();
    assert!(!detector.has_changed());
}

#[test]
fn test_fixing_a_broken_module_is_observed() {
    let (dir, _core, _tax) = project();
    // Outside the snapshot: the module never loaded
    let broken = write(dir.path(), "scripts/broken.py", "def load(:\n");
    let mut detector = ChangeDetector::new(SourceTree::new(dir.path().join("billing")));

    detector.record_import_failure(&ImportFailure {
        kind: ImportErrorKind::Name,
        filename: None,
        frames: vec![dir.path().join("manage.py"), broken.clone()],
    });
    assert!(detector.is_retained(&broken));
    assert!(!detector.has_changed());

    set_mtime(&broken, 5_000);
    assert!(detector.has_changed());
    assert!(!detector.is_retained(&broken));
}
