//! Dependency graph walker.
//!
//! Computes the transitive closure of a source file's quoted includes,
//! the implementation companions of every reached header, and the dependency
//! tokens declared along the way. Only `#include "..."` is followed;
//! angle-bracket includes are left to the compiler.
//!
//! Fresh cache records short-circuit the walk; every newly scanned file gets
//! a record. Headers reached during the walk are offered to the PCH
//! coordinator, whose batch is flushed before `resolve` returns.

use super::cache::{BuildCache, DependencyGraphEntry};
use super::invoker::Invoker;
use super::pch::PchCoordinator;
use super::utils::{HEADER_EXTENSIONS, companion_source, is_header, merge_flags, mtime_ms, normalize};
use crate::config::BuildConfig;
use crate::deps::{Contribution, DependencyResolver};
use crate::error::{BuildError, Result};
use colored::*;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*#\s*include\s*"([^"]+)""#).expect("valid include pattern"));

static DEPENDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*//\s*@depends\s+(.+?)\s*$").expect("valid depends pattern"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    /// Files read and parsed.
    pub scanned: usize,
    /// Files answered from a fresh cache record.
    pub cache_hits: usize,
    /// Cycles tolerated with `tolerant_cycles`.
    pub cycles: usize,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: DependencyGraphEntry,
    /// Newest mtime of the source and its includes; `None` if one is missing.
    pub newest: Option<u64>,
}

pub struct Walker<'a> {
    config: &'a BuildConfig,
    cache: &'a BuildCache<'a>,
    resolver: Option<&'a DependencyResolver<'a>>,
    invoker: &'a Invoker<'a>,
    stack: Vec<PathBuf>,
    search_dirs: Vec<PathBuf>,
    contribution: Contribution,
    seen_tokens: HashSet<String>,
    seen_headers: HashSet<PathBuf>,
    reported_cycles: HashSet<PathBuf>,
    pch: PchCoordinator<'a>,
    stats: WalkStats,
}

impl<'a> Walker<'a> {
    pub fn new(
        config: &'a BuildConfig,
        cache: &'a BuildCache<'a>,
        resolver: Option<&'a DependencyResolver<'a>>,
        invoker: &'a Invoker<'a>,
    ) -> Self {
        Self {
            config,
            cache,
            resolver,
            invoker,
            stack: Vec::new(),
            search_dirs: config.include_dirs.clone(),
            contribution: Contribution::default(),
            seen_tokens: HashSet::new(),
            seen_headers: HashSet::new(),
            reported_cycles: HashSet::new(),
            pch: PchCoordinator::new(config),
            stats: WalkStats::default(),
        }
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    /// Walks `source` and returns its transitive entry.
    ///
    /// Queued precompiled headers are compiled even when the walk fails; a
    /// walk error takes precedence over a PCH error.
    pub fn resolve(&mut self, source: &Path) -> Result<Resolved> {
        let source = normalize(source);
        let walked = self.visit(&source);
        let flushed = self.pch.flush(self.invoker, self.config.pch_threads);

        let entry = walked?;
        flushed?;

        let newest = std::iter::once(source.as_path())
            .chain(entry.includes.iter().map(PathBuf::as_path))
            .try_fold(0u64, |newest, path| Some(newest.max(mtime_ms(path)?)));
        Ok(Resolved { entry, newest })
    }

    fn visit(&mut self, path: &Path) -> Result<DependencyGraphEntry> {
        if let Some(at) = self.stack.iter().position(|p| p == path) {
            return self.on_cycle(at, path);
        }

        match self.cache.load(path) {
            Ok(Some(entry)) => {
                self.stats.cache_hits += 1;
                for token in &entry.dependencies {
                    self.absorb_token(token)?;
                }
                for header in &entry.includes {
                    self.note_header(header)?;
                }
                return Ok(entry);
            }
            Ok(None) => {}
            Err(BuildError::CacheFormatInvalid { path: record, .. }) => {
                eprintln!(
                    "{} Discarding corrupt cache record {}",
                    "!".yellow(),
                    record.display()
                );
                self.cache.invalidate(path)?;
            }
            Err(e) => return Err(e),
        }

        self.stack.push(path.to_path_buf());
        let scanned = self.scan(path);
        self.stack.pop();

        let entry = scanned?;
        self.cache.store(path, &entry)?;
        Ok(entry)
    }

    fn scan(&mut self, path: &Path) -> Result<DependencyGraphEntry> {
        let text = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        self.stats.scanned += 1;

        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let mut entry = DependencyGraphEntry::default();

        for (index, line) in text.lines().enumerate() {
            if let Some(caps) = DEPENDS_RE.captures(line) {
                for token in caps[1].split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    entry.add_dependency(token.to_string());
                    self.absorb_token(token)?;
                }
                continue;
            }

            let Some(caps) = INCLUDE_RE.captures(line) else {
                continue;
            };
            let header = self.locate(path, &dir, &caps[1], index + 1)?;
            let child = self.visit(&header)?;

            self.note_header(&header)?;
            entry.add_include(header.clone());
            if let Some(companion) = companion_source(&header) {
                entry.add_implementation(companion);
            }
            entry.merge(&child);
        }

        Ok(entry)
    }

    // --- Helper: Quoted include lookup (own directory first, then search dirs) ---
    fn locate(&self, file: &Path, dir: &Path, include: &str, line: usize) -> Result<PathBuf> {
        let dirs = std::iter::once(dir).chain(self.search_dirs.iter().map(PathBuf::as_path));
        for candidate_dir in dirs {
            let mut found = candidates_in(candidate_dir, include);
            match found.len() {
                0 => continue,
                1 => return Ok(normalize(&found.remove(0))),
                _ => {
                    return Err(BuildError::AmbiguousInclude {
                        file: file.to_path_buf(),
                        line,
                        include: include.to_string(),
                        candidates: found.iter().map(|p| normalize(p)).collect(),
                    });
                }
            }
        }
        Err(BuildError::IncludeNotFound {
            file: file.to_path_buf(),
            line,
            include: include.to_string(),
        })
    }

    fn on_cycle(&mut self, at: usize, path: &Path) -> Result<DependencyGraphEntry> {
        let mut chain = self.stack[at..].to_vec();
        chain.push(path.to_path_buf());

        if !self.config.tolerant_cycles {
            return Err(BuildError::CycleDetected { chain });
        }

        self.stats.cycles += 1;
        if self.reported_cycles.insert(path.to_path_buf()) {
            let names: Vec<String> = chain.iter().map(|p| p.display().to_string()).collect();
            eprintln!(
                "{} Include cycle, using last known record: {}",
                "!".yellow(),
                names.join(" -> ")
            );
        }
        Ok(self.cache.load_unchecked(path).ok().flatten().unwrap_or_default())
    }

    fn absorb_token(&mut self, token: &str) -> Result<()> {
        if !self.seen_tokens.insert(token.to_string()) {
            return Ok(());
        }
        let Some(resolver) = self.resolver else {
            return Ok(());
        };
        let contribution = resolver.resolve(token)?;
        for inc in &contribution.incs {
            if !self.search_dirs.contains(inc) {
                self.search_dirs.push(inc.clone());
            }
        }
        self.contribution.extend(&contribution);
        Ok(())
    }

    fn note_header(&mut self, header: &Path) -> Result<()> {
        if !self.config.pch || !is_header(header) || !self.seen_headers.insert(header.to_path_buf()) {
            return Ok(());
        }
        let mut flags = self.config.compile_flags();
        merge_flags(&mut flags, &self.contribution.flags);
        let mut include_dirs = self.config.include_dirs.clone();
        include_dirs.extend(self.contribution.incs.iter().cloned());
        self.pch.consider(header, &flags, &include_dirs)?;
        Ok(())
    }
}

/// Files in `dir` an include can refer to. An include without an extension
/// also matches a header with any known header extension.
fn candidates_in(dir: &Path, include: &str) -> Vec<PathBuf> {
    let exact = dir.join(include);
    let mut found = Vec::new();
    if exact.is_file() {
        found.push(exact.clone());
    }
    if Path::new(include).extension().is_none() {
        for ext in HEADER_EXTENSIONS {
            let candidate = exact.with_extension(ext);
            if candidate.is_file() {
                found.push(candidate);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::utils::test_support::{set_mtime_secs, write_file};
    use crate::exec::test_support::RecordingRunner;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        config: BuildConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let mut config = BuildConfig::new(dir.path());
            config.pch = false;
            Self { dir, config }
        }

        fn file(&self, name: &str, contents: &str) -> PathBuf {
            let path = write_file(self.dir.path(), name, contents);
            set_mtime_secs(&path, -1000);
            path
        }

        /// Backdates every cache record so later edits are strictly newer.
        fn age_records(&self) {
            for entry in walkdir::WalkDir::new(self.config.cache_root())
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                set_mtime_secs(entry.path(), -800);
            }
        }

        fn walk(&self, source: &Path) -> (Result<Resolved>, WalkStats) {
            let cache = BuildCache::new(&self.config);
            let invoker = Invoker::new(&self.config, Arc::new(RecordingRunner::default()));
            let mut walker = Walker::new(&self.config, &cache, None, &invoker);
            let result = walker.resolve(source);
            (result, walker.stats())
        }
    }

    /// a.cpp -> b.hpp -> c.hpp, with b.cpp next to b.hpp.
    fn chain() -> (Fixture, PathBuf, PathBuf, PathBuf, PathBuf) {
        let fx = Fixture::new();
        let a = fx.file("a.cpp", "#include \"b.hpp\"\n#include <vector>\nint main() {}\n");
        let b = fx.file("b.hpp", "#pragma once\n#include \"c.hpp\"\n");
        let b_cpp = fx.file("b.cpp", "#include \"b.hpp\"\n");
        let c = fx.file("c.hpp", "#pragma once\n");
        (fx, a, b, b_cpp, c)
    }

    #[test]
    fn test_transitive_includes_and_companions() {
        let (fx, a, b, b_cpp, c) = chain();
        let (resolved, stats) = fx.walk(&a);
        let resolved = resolved.unwrap();

        assert_eq!(resolved.entry.includes, vec![b, c]);
        assert_eq!(resolved.entry.implementations, vec![b_cpp]);
        assert!(resolved.entry.dependencies.is_empty());
        assert_eq!(stats.scanned, 3);
        assert!(resolved.newest.is_some());
    }

    #[test]
    fn test_second_walk_is_served_from_cache() {
        let (fx, a, ..) = chain();
        let (first, _) = fx.walk(&a);
        let (second, stats) = fx.walk(&a);

        assert_eq!(first.unwrap().entry, second.unwrap().entry);
        assert_eq!(stats.scanned, 0);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn test_touching_a_leaf_rescans_the_chain() {
        let (fx, a, _, _, c) = chain();
        fx.walk(&a).0.unwrap();
        fx.age_records();

        set_mtime_secs(&c, -500);
        let (resolved, stats) = fx.walk(&a);
        assert!(resolved.unwrap().entry.includes.contains(&c));
        // a, b and c itself: c's own record is older than c now.
        assert_eq!(stats.scanned, 3);

        let (_, stats) = fx.walk(&a);
        assert_eq!(stats.scanned, 0);
    }

    #[test]
    fn test_unchanged_sibling_record_is_reused() {
        let fx = Fixture::new();
        let a = fx.file("a.cpp", "#include \"b.hpp\"\n#include \"d.hpp\"\n");
        let b = fx.file("b.hpp", "#pragma once\n");
        fx.file("d.hpp", "#pragma once\n");
        fx.walk(&a).0.unwrap();
        fx.age_records();

        set_mtime_secs(&b, -500);
        let (_, stats) = fx.walk(&a);
        // a and b rescanned, d answered from its record.
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn test_missing_include_reports_location() {
        let fx = Fixture::new();
        let a = fx.file("a.cpp", "int x;\n\n#include \"nowhere.hpp\"\n");
        match fx.walk(&a).0.unwrap_err() {
            BuildError::IncludeNotFound { file, line, include } => {
                assert_eq!(file, a);
                assert_eq!(line, 3);
                assert_eq!(include, "nowhere.hpp");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_search_dirs_and_ambiguity() {
        let mut fx = Fixture::new();
        let inc = fx.dir.path().join("include");
        fx.config.include_dirs = vec![normalize(&inc)];
        let a = fx.file("src/a.cpp", "#include \"util\"\n");
        let util = fx.file("include/util.hpp", "#pragma once\n");

        let resolved = fx.walk(&a).0.unwrap();
        assert_eq!(resolved.entry.includes, vec![util]);

        fx.file("include/util.h", "#pragma once\n");
        std::fs::remove_dir_all(fx.config.cache_root()).unwrap();
        assert!(matches!(
            fx.walk(&a).0.unwrap_err(),
            BuildError::AmbiguousInclude { .. }
        ));
    }

    #[test]
    fn test_own_directory_wins_over_search_dirs() {
        let mut fx = Fixture::new();
        fx.config.include_dirs = vec![normalize(&fx.dir.path().join("include"))];
        let a = fx.file("src/a.cpp", "#include \"util.hpp\"\n");
        let local = fx.file("src/util.hpp", "#pragma once\n");
        fx.file("include/util.hpp", "#pragma once\n");

        assert_eq!(fx.walk(&a).0.unwrap().entry.includes, vec![local]);
    }

    #[test]
    fn test_cycle_is_reported_with_chain() {
        let fx = Fixture::new();
        let a = fx.file("a.cpp", "#include \"x.hpp\"\n");
        let x = fx.file("x.hpp", "#include \"y.hpp\"\n");
        let y = fx.file("y.hpp", "#include \"x.hpp\"\n");

        match fx.walk(&a).0.unwrap_err() {
            BuildError::CycleDetected { chain } => assert_eq!(chain, vec![x.clone(), y, x]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tolerated_cycle_still_resolves() {
        let mut fx = Fixture::new();
        fx.config.tolerant_cycles = true;
        let a = fx.file("a.cpp", "#include \"x.hpp\"\n");
        let x = fx.file("x.hpp", "#include \"y.hpp\"\n");
        let y = fx.file("y.hpp", "#include \"x.hpp\"\n");

        let (resolved, stats) = fx.walk(&a);
        let includes = resolved.unwrap().entry.includes;
        assert!(includes.contains(&x) && includes.contains(&y));
        assert_eq!(stats.cycles, 1);
    }

    #[test]
    fn test_dependency_tokens_are_collected() {
        let fx = Fixture::new();
        let a = fx.file(
            "a.cpp",
            "// @depends fmtlib/fmt:10.2.1, zlib\n#include \"b.hpp\"\n",
        );
        fx.file("b.hpp", "#pragma once\n  //@depends nlohmann/json\n");

        let entry = fx.walk(&a).0.unwrap().entry;
        assert_eq!(
            entry.dependencies,
            vec!["fmtlib/fmt:10.2.1", "zlib", "nlohmann/json"]
        );
    }

    #[test]
    fn test_corrupt_record_heals() {
        let (fx, a, ..) = chain();
        fx.walk(&a).0.unwrap();

        let cache = BuildCache::new(&fx.config);
        let record = cache.record_path(&a);
        std::fs::write(&record, "garbage without markers\n").unwrap();

        let (resolved, stats) = fx.walk(&a);
        assert_eq!(resolved.unwrap().entry.includes.len(), 2);
        assert_eq!(stats.scanned, 1);
        assert!(cache.load(&a).unwrap().is_some());
    }

    #[test]
    fn test_headers_are_offered_for_precompilation() {
        let (mut fx, a, b, _, c) = chain();
        fx.config.pch = true;
        let cache = BuildCache::new(&fx.config);
        let runner = Arc::new(RecordingRunner::default());
        let invoker = Invoker::new(&fx.config, runner.clone());

        let mut walker = Walker::new(&fx.config, &cache, None, &invoker);
        walker.resolve(&a).unwrap();
        assert_eq!(runner.outputs_ending_with(".gch"), 2);

        let pch = PchCoordinator::new(&fx.config);
        assert!(!pch.entry_for(&b).needs_rebuild);
        assert!(!pch.entry_for(&c).needs_rebuild);

        // Cached walk, fresh objects: nothing to precompile.
        runner.clear();
        let mut walker = Walker::new(&fx.config, &cache, None, &invoker);
        walker.resolve(&a).unwrap();
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_pch_batch_flushes_even_when_walk_fails() {
        let (mut fx, ..) = chain();
        fx.config.pch = true;
        let broken = fx.file("broken.cpp", "#include \"b.hpp\"\n#include \"missing.hpp\"\n");
        let cache = BuildCache::new(&fx.config);
        let runner = Arc::new(RecordingRunner::default());
        let invoker = Invoker::new(&fx.config, runner.clone());

        let mut walker = Walker::new(&fx.config, &cache, None, &invoker);
        assert!(matches!(
            walker.resolve(&broken),
            Err(BuildError::IncludeNotFound { .. })
        ));
        assert_eq!(runner.outputs_ending_with(".gch"), 2);
    }
}
