//! On-disk dependency graph cache.
//!
//! Each scanned file gets one record under
//! `<build>/<mode>/deps/<mirrored path>.dep`. A record holds the file's
//! transitive includes, implementation companions, and dependency tokens:
//!
//! ```text
//! /src/b.hpp\n/src/c.hpp\n<<incc:implementations>>/src/b.cpp\n<<incc:dependencies>>fmtlib/fmt:10.2.1\n
//! ```
//!
//! Every element is newline-terminated, so an empty set (`""`) and a set
//! holding one empty string (`"\n"`) encode differently.
//!
//! A record is trusted only while its own mtime is at least the newest mtime
//! of the source and every file it covers. Anything else deletes it.

use super::utils::{mtime_ms, write_atomic};
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const RECORD_EXTENSION: &str = "dep";
const IMPLEMENTATIONS_MARKER: &str = "<<incc:implementations>>";
const DEPENDENCIES_MARKER: &str = "<<incc:dependencies>>";

/// Transitive scan result for one file. All three sets keep first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraphEntry {
    pub includes: Vec<PathBuf>,
    pub implementations: Vec<PathBuf>,
    pub dependencies: Vec<String>,
}

impl DependencyGraphEntry {
    pub fn add_include(&mut self, path: PathBuf) -> bool {
        push_unique(&mut self.includes, path)
    }

    pub fn add_implementation(&mut self, path: PathBuf) -> bool {
        push_unique(&mut self.implementations, path)
    }

    pub fn add_dependency(&mut self, token: String) -> bool {
        push_unique(&mut self.dependencies, token)
    }

    /// Appends everything from `other` that is not already present.
    pub fn merge(&mut self, other: &DependencyGraphEntry) {
        for path in &other.includes {
            self.add_include(path.clone());
        }
        for path in &other.implementations {
            self.add_implementation(path.clone());
        }
        for token in &other.dependencies {
            self.add_dependency(token.clone());
        }
    }

    /// Newest mtime among `source` and every covered file, `None` if any is missing.
    pub fn newest_mtime(&self, source: &Path) -> Option<u64> {
        std::iter::once(source)
            .chain(self.includes.iter().map(PathBuf::as_path))
            .chain(self.implementations.iter().map(PathBuf::as_path))
            .try_fold(0u64, |newest, path| Some(newest.max(mtime_ms(path)?)))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for path in &self.includes {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        out.push_str(IMPLEMENTATIONS_MARKER);
        for path in &self.implementations {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        out.push_str(DEPENDENCIES_MARKER);
        for token in &self.dependencies {
            out.push_str(token);
            out.push('\n');
        }
        out
    }

    /// Parses a record; `record` only labels the error.
    pub fn decode(text: &str, record: &Path) -> Result<Self> {
        let invalid = |segments| BuildError::CacheFormatInvalid {
            path: record.to_path_buf(),
            segments,
        };

        let outer: Vec<&str> = text.split(IMPLEMENTATIONS_MARKER).collect();
        if outer.len() != 2 {
            return Err(invalid(outer.len()));
        }
        let inner: Vec<&str> = outer[1].split(DEPENDENCIES_MARKER).collect();
        if inner.len() != 2 {
            return Err(invalid(inner.len() + 1));
        }

        let lines = |segment: &str| -> Vec<String> {
            segment.split_terminator('\n').map(str::to_string).collect()
        };

        Ok(Self {
            includes: lines(outer[0]).into_iter().map(PathBuf::from).collect(),
            implementations: lines(inner[0]).into_iter().map(PathBuf::from).collect(),
            dependencies: lines(inner[1]),
        })
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) -> bool {
    if list.contains(&item) {
        false
    } else {
        list.push(item);
        true
    }
}

/// Reads and writes dependency records for one build configuration.
pub struct BuildCache<'a> {
    config: &'a BuildConfig,
}

impl<'a> BuildCache<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self { config }
    }

    pub fn record_path(&self, source: &Path) -> PathBuf {
        let mut record = self.config.cache_root().join(self.config.mirror(source));
        let name = record
            .file_name()
            .map(|n| format!("{}.{}", n.to_string_lossy(), RECORD_EXTENSION))
            .unwrap_or_else(|| format!("root.{}", RECORD_EXTENSION));
        record.set_file_name(name);
        record
    }

    /// Returns the cached entry for `source` if it is still fresh.
    ///
    /// A stale record is deleted before returning `None`. A corrupt one is
    /// reported as [`BuildError::CacheFormatInvalid`] and left for the caller.
    pub fn load(&self, source: &Path) -> Result<Option<DependencyGraphEntry>> {
        let record = self.record_path(source);
        let Some(entry) = self.read(&record)? else {
            return Ok(None);
        };

        let fresh = match (mtime_ms(&record), entry.newest_mtime(source)) {
            (Some(record_time), Some(newest)) => record_time >= newest,
            _ => false,
        };

        if fresh {
            Ok(Some(entry))
        } else {
            self.remove(&record)?;
            Ok(None)
        }
    }

    /// Returns whatever record exists for `source`, fresh or not.
    pub fn load_unchecked(&self, source: &Path) -> Result<Option<DependencyGraphEntry>> {
        self.read(&self.record_path(source))
    }

    pub fn store(&self, source: &Path, entry: &DependencyGraphEntry) -> Result<()> {
        let record = self.record_path(source);
        let write_failed = |reason: String| BuildError::CacheWriteFailed {
            path: record.clone(),
            reason,
        };

        if let Some(dir) = record.parent() {
            if dir.is_file() {
                return Err(write_failed(format!("{} is a file", dir.display())));
            }
            fs::create_dir_all(dir).map_err(|e| write_failed(e.to_string()))?;
        }
        write_atomic(&record, &entry.encode()).map_err(|e| write_failed(e.to_string()))
    }

    /// Deletes the record for `source`, if any.
    pub fn invalidate(&self, source: &Path) -> Result<()> {
        self.remove(&self.record_path(source))
    }

    fn read(&self, record: &Path) -> Result<Option<DependencyGraphEntry>> {
        match fs::read_to_string(record) {
            Ok(text) => DependencyGraphEntry::decode(&text, record).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::io(record, e)),
        }
    }

    fn remove(&self, record: &Path) -> Result<()> {
        match fs::remove_file(record) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(record, e)),
        }
    }
}
