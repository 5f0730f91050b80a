//! Error types for the build engine.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Every failure the engine can surface.
///
/// Graph errors are fatal to the scan that hit them, cache errors heal where
/// they can (stale or corrupt records are deleted and recomputed), plugin
/// errors always close partially opened handles before propagating, and
/// compile errors are fatal to their task only.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A quoted include was not found next to the source or in any search directory.
    #[error("{}:{line}: cannot find include \"{include}\"", .file.display())]
    IncludeNotFound {
        file: PathBuf,
        line: usize,
        include: String,
    },

    /// A quoted include matched more than one candidate in the same directory.
    #[error("{}:{line}: include \"{include}\" is ambiguous:{}", .file.display(), list_paths(.candidates))]
    AmbiguousInclude {
        file: PathBuf,
        line: usize,
        include: String,
        candidates: Vec<PathBuf>,
    },

    /// A file was reached again while it was still being scanned.
    #[error("include cycle detected:{}", list_paths(.chain))]
    CycleDetected { chain: Vec<PathBuf> },

    /// A cache record did not split into exactly three segments.
    #[error("corrupt dependency cache record {} ({segments} segments)", .path.display())]
    CacheFormatInvalid { path: PathBuf, segments: usize },

    /// A cache record could not be written.
    #[error("cannot write dependency cache record {}: {reason}", .path.display())]
    CacheWriteFailed { path: PathBuf, reason: String },

    /// No buildable source exists for a plugin path.
    #[error("no source file found for plugin {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// The driver subprocess failed to (re)build a shared library.
    #[error("failed to build shared library {}:\n{stderr}", .library.display())]
    LibraryBuildFailed { library: PathBuf, stderr: String },

    /// The platform loader refused a shared library.
    #[error("failed to load shared library {}: {reason}", .library.display())]
    LibraryLoadFailed { library: PathBuf, reason: String },

    /// A required entry symbol is missing from a shared library.
    #[error("shared library {} does not export `{symbol}`", .library.display())]
    SymbolResolutionFailed { library: PathBuf, symbol: String },

    /// A plugin instance was not created by this loader or was already destroyed.
    #[error("plugin instance is not managed by this loader")]
    UnmanagedInstance,

    /// A dependency token has no library segment.
    #[error("dependency \"{token}\" does not name a library")]
    UnnamedDependency { token: String },

    /// A dependency provider failed to report or perform its installation.
    #[error("failed to install dependency \"{token}\": {reason}")]
    DependencyInstallFailed { token: String, reason: String },

    /// Headers that do not start with `#pragma once`.
    #[error("headers missing `#pragma once`:{}", list_paths(.offenders))]
    HeaderHygieneViolation { offenders: Vec<PathBuf> },

    /// The compiler exited with a non-zero status.
    #[error("compilation of {} failed (exit code {code}):\n{stderr}", .source_path.display())]
    CompileFailed {
        source_path: PathBuf,
        code: i32,
        stderr: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

fn list_paths(paths: &[PathBuf]) -> String {
    let mut out = String::new();
    for path in paths {
        let _ = write!(out, "\n  {}", path.display());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_not_found_carries_location() {
        let err = BuildError::IncludeNotFound {
            file: PathBuf::from("src/a.cpp"),
            line: 3,
            include: "b.hpp".to_string(),
        };
        assert_eq!(err.to_string(), "src/a.cpp:3: cannot find include \"b.hpp\"");
    }

    #[test]
    fn cycle_lists_every_file() {
        let err = BuildError::CycleDetected {
            chain: vec![PathBuf::from("a.hpp"), PathBuf::from("b.hpp"), PathBuf::from("a.hpp")],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("include cycle detected:"));
        assert_eq!(msg.matches("a.hpp").count(), 2);
        assert!(msg.contains("b.hpp"));
    }

    #[test]
    fn compile_failure_keeps_stderr() {
        let err = BuildError::CompileFailed {
            source_path: PathBuf::from("main.cpp"),
            code: 1,
            stderr: "main.cpp:1: error: expected ';'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("expected ';'"));
    }
}
