//! Crate-wide error type and the import-failure payload shared by the
//! suite runner and the change detector.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Import(ImportFailure),

    #[error("Unknown test strategy: {0}")]
    UnknownStrategy(String),

    #[error("Strategy {0} supports neither calling convention")]
    UnsupportedConvention(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Coverage engine error: {0}")]
    Coverage(String),

    #[error("Suite execution error: {0}")]
    Suite(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// The error classes that leave a source file watched even though the module
/// it defines never finished loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportErrorKind {
    Import,
    Syntax,
    Name,
    Type,
    Indentation,
}

impl ImportErrorKind {
    /// Map an interpreter exception name onto the failed-import class.
    /// Anything outside the class yields `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ImportError" | "ModuleNotFoundError" => Some(Self::Import),
            "SyntaxError" => Some(Self::Syntax),
            "NameError" => Some(Self::Name),
            "TypeError" => Some(Self::Type),
            "IndentationError" | "TabError" => Some(Self::Indentation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "ImportError",
            Self::Syntax => "SyntaxError",
            Self::Name => "NameError",
            Self::Type => "TypeError",
            Self::Indentation => "IndentationError",
        }
    }
}

/// A module failed to load while a run was starting up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub kind: ImportErrorKind,
    /// Explicit filename carried by the error (syntax errors have one).
    pub filename: Option<PathBuf>,
    /// Source files of the traceback frames, outermost first.
    pub frames: Vec<PathBuf>,
}

impl ImportFailure {
    /// The file to keep watching: the explicit filename when present,
    /// otherwise the deepest frame.
    pub fn responsible_file(&self) -> Option<&Path> {
        self.filename
            .as_deref()
            .or_else(|| self.frames.last().map(PathBuf::as_path))
    }
}

impl fmt::Display for ImportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.responsible_file() {
            Some(path) => write!(f, "{} while loading {}", self.kind.as_str(), path.display()),
            None => write!(f, "{} while loading test modules", self.kind.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name_covers_import_class() {
        assert_eq!(ImportErrorKind::from_name("SyntaxError"), Some(ImportErrorKind::Syntax));
        assert_eq!(ImportErrorKind::from_name("ModuleNotFoundError"), Some(ImportErrorKind::Import));
        assert_eq!(ImportErrorKind::from_name("IndentationError"), Some(ImportErrorKind::Indentation));
        assert_eq!(ImportErrorKind::from_name("ValueError"), None);
        assert_eq!(ImportErrorKind::from_name("KeyboardInterrupt"), None);
    }

    #[test]
    fn test_responsible_file_prefers_explicit_filename() {
        let failure = ImportFailure {
            kind: ImportErrorKind::Syntax,
            filename: Some(PathBuf::from("app/broken.py")),
            frames: vec![PathBuf::from("manage.py"), PathBuf::from("app/loader.py")],
        };
        assert_eq!(failure.responsible_file(), Some(Path::new("app/broken.py")));
    }

    #[test]
    fn test_responsible_file_falls_back_to_deepest_frame() {
        let failure = ImportFailure {
            kind: ImportErrorKind::Name,
            filename: None,
            frames: vec![PathBuf::from("manage.py"), PathBuf::from("app/models.py")],
        };
        assert_eq!(failure.responsible_file(), Some(Path::new("app/models.py")));
        assert!(failure.to_string().contains("NameError"));
    }

    #[test]
    fn test_no_frames_no_file() {
        let failure = ImportFailure {
            kind: ImportErrorKind::Import,
            filename: None,
            frames: vec![],
        };
        assert!(failure.responsible_file().is_none());
    }
}
