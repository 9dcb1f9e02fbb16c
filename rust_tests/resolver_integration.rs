//! Integration tests for the coverage module resolver
//!
//! Builds component trees on disk and resolves the coverage target set the
//! way a covered run does.

use runtester::config::ProjectConfig;
use runtester::discovery::{discover_component, Discovered, ModuleDescriptor};
use runtester::resolver::CoverageResolver;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn names(modules: &[ModuleDescriptor]) -> Vec<&str> {
    modules.iter().map(|m| m.name.as_str()).collect()
}

fn labels(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// billing/{core, legacy_math, legacy_math/helpers}
fn billing(root: &Path) {
    write(root, "billing/__init__.py", "");
    write(root, "billing/core.py", "def total(xs):\n    return sum(xs)\n");
    write(root, "billing/legacy_math.py", "def old_total(xs):\n    return sum(xs)\n");
    write(root, "billing/legacy_math/__init__.py", "");
    write(root, "billing/legacy_math/helpers.py", "ZERO = 0\n");
}

#[test]
fn test_legacy_subtree_is_excluded() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    let config = ProjectConfig {
        coverage_exclude: labels(&["billing.legacy*"]),
        ..ProjectConfig::default()
    };

    let resolver = CoverageResolver::new(dir.path(), &config);
    let discovered = resolver.discover(&labels(&["billing"]), &[]).unwrap();
    assert_eq!(discovered.len(), 3);

    let targets = resolver.resolve(&labels(&["billing"]), &[]).unwrap();
    assert_eq!(names(&targets), vec!["billing.core"]);
    assert_eq!(targets[0].path, dir.path().join("billing/core.py"));
}

#[test]
fn test_include_pattern_overrides_exclude_on_disk() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    let config = ProjectConfig {
        coverage_include: labels(&["billing.legacy_math.helpers"]),
        coverage_exclude: labels(&["billing.legacy*"]),
        ..ProjectConfig::default()
    };

    let targets = CoverageResolver::new(dir.path(), &config)
        .resolve(&labels(&["billing"]), &[])
        .unwrap();
    // Includes are non-empty, so unmatched modules fall to exclude
    assert_eq!(names(&targets), vec!["billing.legacy_math.helpers"]);
}

#[test]
fn test_no_labels_covers_installed_components_only() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    write(dir.path(), "shipping/__init__.py", "");
    write(dir.path(), "shipping/rates.py", "BASE = 5\n");
    write(dir.path(), "vendor/payments/__init__.py", "");
    write(dir.path(), "vendor/payments/gateway.py", "URL = ''\n");
    write(dir.path(), "django/contrib/auth/models.py", "class User: pass\n");
    write(dir.path(), "scratch/notes.py", "x = 1\n");

    let config = ProjectConfig {
        installed_components: labels(&["django.contrib.auth", "shipping", "vendor.payments"]),
        skip_components: labels(&["vendor"]),
        ..ProjectConfig::default()
    };
    let targets = CoverageResolver::new(dir.path(), &config).resolve(&[], &[]).unwrap();
    assert_eq!(names(&targets), vec!["shipping.rates"]);
}

#[test]
fn test_unloadable_module_is_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    write(dir.path(), "billing/broken.py", "def total(:\n");

    let found = discover_component("billing", &dir.path().join("billing"));
    assert!(found.iter().any(|d| matches!(
        d,
        Discovered::SkippedUnimportable { path, .. } if path.ends_with("broken.py")
    )));

    let targets = CoverageResolver::new(dir.path(), &ProjectConfig::default())
        .resolve(&labels(&["billing"]), &[])
        .unwrap();
    assert!(!names(&targets).contains(&"billing.broken"));
    assert!(names(&targets).contains(&"billing.core"));
}

#[test]
fn test_loaded_modules_are_merged() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    let loaded = vec![
        // Generated at runtime, never on disk below the component
        ModuleDescriptor::new("billing.generated", dir.path().join("build/generated.py")),
        ModuleDescriptor::new("billingextra.thing", dir.path().join("billingextra/thing.py")),
        ModuleDescriptor::new("billing.core", dir.path().join("billing/core.py")),
    ];

    let targets = CoverageResolver::new(dir.path(), &ProjectConfig::default())
        .resolve(&labels(&["billing"]), &loaded)
        .unwrap();
    let names = names(&targets);
    assert!(names.contains(&"billing.generated"));
    assert!(!names.contains(&"billingextra.thing"));
    assert_eq!(names.iter().filter(|n| **n == "billing.core").count(), 1);
}

#[test]
fn test_project_below_env_directory_is_covered() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("env/shop");
    billing(&root);

    let targets = CoverageResolver::new(&root, &ProjectConfig::default())
        .resolve(&labels(&["billing"]), &[])
        .unwrap();
    assert_eq!(names(&targets), vec!["billing.core", "billing.legacy_math", "billing.legacy_math.helpers"]);
}

#[test]
fn test_cache_directories_are_not_discovered() {
    let dir = TempDir::new().unwrap();
    billing(dir.path());
    write(dir.path(), "billing/__pycache__/core.py", "x = 1\n");

    let targets = CoverageResolver::new(dir.path(), &ProjectConfig::default())
        .resolve(&labels(&["billing"]), &[])
        .unwrap();
    assert_eq!(targets.iter().filter(|m| m.name.ends_with(".core")).count(), 1);
}
