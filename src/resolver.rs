//! Coverage Module Resolver
//!
//! Decides which modules a coverage report covers, in two phases:
//!
//! 1. **Discovery**: every module of each target component, on disk or
//!    already loaded.
//! 2. **Filtering**: include/exclude patterns per module. Excludes are
//!    evaluated first and includes second, so an explicit include match wins
//!    over an explicit exclude match. A module matched by neither list gets
//!    the default verdict:
//!
//! | includes | excludes | default |
//! |---|---|---|
//! | non-empty | any | exclude |
//! | empty | any | include |

use crate::config::ProjectConfig;
use crate::discovery::{discover_component, has_sub_selector, locate_component, Discovered, ModuleDescriptor};
use crate::errors::{HarnessError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Marker that turns a pattern into a prefix match.
pub const WILDCARD: char = '*';

/// A module-name pattern: exact, or prefix when it ends in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeExcludePattern {
    Exact(String),
    Prefix(String),
}

impl IncludeExcludePattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(WILDCARD) {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, module: &str) -> bool {
        match self {
            Self::Exact(name) => module == name,
            Self::Prefix(prefix) => module.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Include,
    Exclude,
}

/// The include and exclude lists together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    include: Vec<IncludeExcludePattern>,
    exclude: Vec<IncludeExcludePattern>,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        Self {
            include: include.iter().map(|p| IncludeExcludePattern::parse(p.as_ref())).collect(),
            exclude: exclude.iter().map(|p| IncludeExcludePattern::parse(p.as_ref())).collect(),
        }
    }

    /// Verdict from explicit matches only.
    pub fn explicit_verdict(&self, module: &str) -> Option<Verdict> {
        let mut verdict = None;
        for pattern in &self.exclude {
            if pattern.matches(module) {
                verdict = Some(Verdict::Exclude);
            }
        }
        // Checked after excludes, so an include match overrides
        for pattern in &self.include {
            if pattern.matches(module) {
                verdict = Some(Verdict::Include);
            }
        }
        verdict
    }

    /// Verdict for a module no pattern matched.
    pub fn default_verdict(&self) -> Verdict {
        if self.include.is_empty() {
            Verdict::Include
        } else {
            Verdict::Exclude
        }
    }

    pub fn verdict(&self, module: &str) -> Verdict {
        self.explicit_verdict(module)
            .unwrap_or_else(|| self.default_verdict())
    }

    pub fn selects(&self, module: &str) -> bool {
        self.verdict(module) == Verdict::Include
    }
}

/// Resolves the coverage target set for a run.
#[derive(Debug, Clone)]
pub struct CoverageResolver {
    project_root: PathBuf,
    installed_components: Vec<String>,
    framework_prefixes: Vec<String>,
    skip_components: Vec<String>,
    patterns: PatternSet,
}

impl CoverageResolver {
    pub fn new(project_root: &Path, config: &ProjectConfig) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            installed_components: config.installed_components.clone(),
            framework_prefixes: config.framework_prefixes.clone(),
            skip_components: config.skip_components.clone(),
            patterns: PatternSet::new(config.coverage_include.as_slice(), config.coverage_exclude.as_slice()),
        }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    fn is_framework(&self, component: &str) -> bool {
        self.framework_prefixes
            .iter()
            .any(|prefix| component.starts_with(prefix.as_str()))
    }

    fn is_skipped(&self, component: &str) -> bool {
        let first = component.split('.').next().unwrap_or(component);
        self.skip_components
            .iter()
            .any(|skip| skip == first || skip == component)
    }

    /// Components whose modules are discovered for these labels.
    ///
    /// No labels means every installed component outside the host
    /// framework. A label with a sub-selector discovers nothing.
    pub fn target_components(&self, labels: &[String]) -> Vec<String> {
        let candidates: Vec<String> = if labels.is_empty() {
            self.installed_components
                .iter()
                .filter(|c| !self.is_framework(c))
                .cloned()
                .collect()
        } else {
            labels
                .iter()
                .filter(|label| {
                    let narrowed = has_sub_selector(label);
                    if narrowed {
                        debug!("label {} selects single tests, no coverage discovery", label);
                    }
                    !narrowed
                })
                .cloned()
                .collect()
        };

        candidates
            .into_iter()
            .filter(|c| !self.is_skipped(c))
            .collect()
    }

    /// Discovered modules of all target components, before filtering.
    pub fn discover(&self, labels: &[String], loaded: &[ModuleDescriptor]) -> Result<BTreeSet<ModuleDescriptor>> {
        let mut modules = BTreeSet::new();

        for component in self.target_components(labels) {
            match locate_component(&self.project_root, &component) {
                Some(dir) => {
                    for found in discover_component(&component, &dir) {
                        if let Discovered::Found(module) = found {
                            modules.insert(module);
                        }
                    }
                }
                // Explicit labels must exist, installed components may live elsewhere
                None if !labels.is_empty() => {
                    return Err(HarnessError::UnknownComponent(component));
                }
                None => warn!("installed component {} not found below project root", component),
            }

            modules.extend(loaded.iter().filter(|m| m.belongs_to(&component)).cloned());
        }

        Ok(modules)
    }

    /// The coverage target set: discovered modules the patterns select.
    pub fn resolve(&self, labels: &[String], loaded: &[ModuleDescriptor]) -> Result<Vec<ModuleDescriptor>> {
        let targets: Vec<ModuleDescriptor> = self
            .discover(labels, loaded)?
            .into_iter()
            .filter(|module| self.patterns.selects(&module.name))
            .collect();
        debug!("{} coverage target(s)", targets.len());
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_pattern_parse() {
        assert_eq!(
            IncludeExcludePattern::parse("app.*"),
            IncludeExcludePattern::Prefix("app.".to_string())
        );
        assert_eq!(
            IncludeExcludePattern::parse("app.util"),
            IncludeExcludePattern::Exact("app.util".to_string())
        );
        assert!(IncludeExcludePattern::parse("billing.legacy*").matches("billing.legacy_math.helpers"));
        assert!(!IncludeExcludePattern::parse("app.util").matches("app.utils"));
    }

    #[test]
    fn test_default_table() {
        // includes and excludes both non-empty
        assert_eq!(PatternSet::new(&["a.*"], &["b.*"]).verdict("other.thing"), Verdict::Exclude);
        // only excludes
        assert_eq!(PatternSet::new(&NONE, &["b.*"]).verdict("other.thing"), Verdict::Include);
        // only includes
        assert_eq!(PatternSet::new(&["app.*"], &NONE).verdict("other.thing"), Verdict::Exclude);
        // neither
        assert_eq!(PatternSet::new(&NONE, &NONE).verdict("other.thing"), Verdict::Include);
    }

    #[test]
    fn test_include_overrides_exclude() {
        let patterns = PatternSet::new(&["app.*"], &["app.util"]);
        assert_eq!(patterns.explicit_verdict("app.util"), Some(Verdict::Include));
        assert!(patterns.selects("app.util"));
    }

    #[test]
    fn test_explicit_exclude_beats_default_include() {
        let patterns = PatternSet::new(&NONE, &["billing.legacy*"]);
        assert!(!patterns.selects("billing.legacy_math"));
        assert!(patterns.selects("billing.core"));
    }

    fn resolver(config: ProjectConfig) -> CoverageResolver {
        CoverageResolver::new(Path::new("/nonexistent"), &config)
    }

    #[test]
    fn test_target_components_without_labels_skip_framework() {
        let config = ProjectConfig {
            installed_components: vec![
                "django.contrib.auth".to_string(),
                "billing".to_string(),
                "vendor.payments".to_string(),
            ],
            skip_components: vec!["vendor".to_string()],
            ..ProjectConfig::default()
        };
        assert_eq!(resolver(config).target_components(&[]), vec!["billing"]);
    }

    #[test]
    fn test_sub_selector_label_disables_discovery() {
        let r = resolver(ProjectConfig::default());
        let labels = vec!["billing.CoreTest".to_string(), "shipping".to_string()];
        assert_eq!(r.target_components(&labels), vec!["shipping"]);
    }

    #[test]
    fn test_unknown_label_is_an_error() {
        let r = resolver(ProjectConfig::default());
        let err = r.resolve(&["billing".to_string()], &[]).unwrap_err();
        assert!(matches!(err, HarnessError::UnknownComponent(ref c) if c == "billing"));
    }

    #[test]
    fn test_missing_installed_component_is_skipped() {
        let config = ProjectConfig {
            installed_components: vec!["billing".to_string()],
            ..ProjectConfig::default()
        };
        assert!(resolver(config).resolve(&[], &[]).unwrap().is_empty());
    }
}
