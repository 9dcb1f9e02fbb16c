//! Component discovery: every module of a component found on disk, whether
//! or not the tests that ran ever imported it.
//!
//! A module counts as importable when its source parses. Files that do not
//! parse are reported as `SkippedUnimportable` rather than failing discovery.

use crate::snapshot::{is_ignored_path, is_python_source};
use rayon::prelude::*;
use rustpython_parser::{ast, Parse};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A module by dotted name and source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// True if this module lives inside `component`.
    pub fn belongs_to(&self, component: &str) -> bool {
        self.name == component
            || (self.name.starts_with(component) && self.name[component.len()..].starts_with('.'))
    }
}

/// Outcome of looking at one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    Found(ModuleDescriptor),
    SkippedUnimportable { path: PathBuf, reason: String },
}

/// A label naming one test case or method rather than a whole component.
pub fn has_sub_selector(label: &str) -> bool {
    label.contains('.')
}

/// The directory of a dotted component name below the project root.
pub fn locate_component(project_root: &Path, name: &str) -> Option<PathBuf> {
    let dir = name
        .split('.')
        .fold(project_root.to_path_buf(), |dir, part| dir.join(part));
    dir.is_dir().then_some(dir)
}

/// Dotted module name of `file` inside `component`. Package `__init__`
/// files are containers and have none.
pub fn module_name(component: &str, component_dir: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(component_dir).ok()?;
    let stem = relative.file_stem()?.to_str()?.to_lowercase();
    if stem == "__init__" {
        return None;
    }

    let mut parts = vec![component.to_string()];
    if let Some(parent) = relative.parent() {
        for part in parent.components() {
            if let Component::Normal(p) = part {
                parts.push(p.to_str()?.to_string());
            }
        }
    }
    parts.push(stem);
    Some(parts.join("."))
}

/// Check that a source file would load. Returns the reason when it would not.
pub fn check_importable(path: &Path) -> Result<(), String> {
    let source = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let path_str = path.to_string_lossy();
    ast::Suite::parse(&source, &path_str)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn classify(component: &str, component_dir: &Path, path: &Path) -> Option<Discovered> {
    let name = module_name(component, component_dir, path)?;
    Some(match check_importable(path) {
        Ok(()) => Discovered::Found(ModuleDescriptor::new(name, path)),
        Err(reason) => {
            debug!("skipping unimportable {}: {}", path.display(), reason);
            Discovered::SkippedUnimportable {
                path: path.to_path_buf(),
                reason,
            }
        }
    })
}

/// Walk a component directory and classify every source file in it.
pub fn discover_component(component: &str, component_dir: &Path) -> Vec<Discovered> {
    let mut files: Vec<PathBuf> = WalkDir::new(component_dir)
        .into_iter()
        .filter_entry(|entry| !is_ignored_path(component_dir, entry.path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_python_source(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();

    files
        .par_iter()
        .filter_map(|path| classify(component, component_dir, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_module_names() {
        let dir = Path::new("/srv/app/billing");
        assert_eq!(
            module_name("billing", dir, &dir.join("core.py")).as_deref(),
            Some("billing.core")
        );
        assert_eq!(
            module_name("billing", dir, &dir.join("legacy_math/Helpers.py")).as_deref(),
            Some("billing.legacy_math.helpers")
        );
        assert_eq!(module_name("billing", dir, &dir.join("__init__.py")), None);
        assert_eq!(module_name("billing", dir, Path::new("/elsewhere/x.py")), None);
    }

    #[test]
    fn test_sub_selector() {
        assert!(has_sub_selector("billing.CoreTest"));
        assert!(!has_sub_selector("billing"));
    }

    #[test]
    fn test_belongs_to() {
        let module = ModuleDescriptor::new("billing.core", "billing/core.py");
        assert!(module.belongs_to("billing"));
        assert!(!module.belongs_to("bill"));
        assert!(!module.belongs_to("billing.co"));
    }

    #[test]
    fn test_locate_dotted_component() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("shop/billing")).unwrap();
        assert_eq!(
            locate_component(temp.path(), "shop.billing"),
            Some(temp.path().join("shop/billing"))
        );
        assert_eq!(locate_component(temp.path(), "missing"), None);
    }

    #[test]
    fn test_discover_skips_unparsable_and_caches() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("billing");
        write(&dir, "__init__.py", "");
        write(&dir, "core.py", "def total(xs):\n    return sum(xs)\n");
        write(&dir, "broken.py", "def total(:\n");
        write(&dir, "__pycache__/core.py", "x = 1\n");
        write(&dir, "notes.txt", "not python");

        let found = discover_component("billing", &dir);
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[1],
            Discovered::Found(ModuleDescriptor::new("billing.core", dir.join("core.py")))
        );
        assert!(matches!(
            &found[0],
            Discovered::SkippedUnimportable { path, .. } if path.ends_with("broken.py")
        ));
    }

    #[test]
    fn test_component_inside_env_directory_is_walked() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("env/.git-work/billing");
        write(&dir, "core.py", "def total(xs):\n    return sum(xs)\n");
        write(&dir, "venv/lib/site.py", "x = 1\n");

        let found = discover_component("billing", &dir);
        assert_eq!(
            found,
            vec![Discovered::Found(ModuleDescriptor::new("billing.core", dir.join("core.py")))]
        );
    }
}
