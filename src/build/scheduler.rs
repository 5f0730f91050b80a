//! Parallel build scheduling.
//!
//! Each top-level source is one job: walk its dependency graph, build the
//! implementation companions it reaches (for link targets), resolve its
//! dependency tokens, and compile it if anything it depends on is newer than
//! its output. Jobs are pulled from a shared queue by a fixed set of workers.
//! A failed job does not stop the others; the first error is returned with
//! whatever the rest of the build produced.

use super::cache::BuildCache;
use super::invoker::{CompileTask, Invoker};
use super::utils::{is_header, merge_flags, mtime_ms, write_atomic};
use super::walker::Walker;
use crate::config::{BuildConfig, TargetKind};
use crate::deps::{Contribution, DependencyResolver};
use crate::error::{BuildError, Result};
use crate::exec::{CommandRunner, display_command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// One `compile_commands.json` entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompileCommand {
    pub directory: String,
    pub command: String,
    pub file: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Every output the build is responsible for, companions included.
    pub outputs: Vec<PathBuf>,
    /// Outputs actually (re)compiled in this run.
    pub rebuilt: Vec<PathBuf>,
    pub commands: Vec<CompileCommand>,
    /// Dependency tokens declared anywhere in the built units.
    pub dependencies: Vec<String>,
    /// Implementation companions reached by the walks of the built units.
    pub implementations: Vec<PathBuf>,
}

impl BuildReport {
    fn absorb(&mut self, other: BuildReport) {
        for output in other.outputs {
            if !self.outputs.contains(&output) {
                self.outputs.push(output);
            }
        }
        for output in other.rebuilt {
            if !self.rebuilt.contains(&output) {
                self.rebuilt.push(output);
            }
        }
        for token in other.dependencies {
            if !self.dependencies.contains(&token) {
                self.dependencies.push(token);
            }
        }
        for implementation in other.implementations {
            if !self.implementations.contains(&implementation) {
                self.implementations.push(implementation);
            }
        }
        for command in other.commands {
            if !self.commands.iter().any(|c| c.file == command.file && c.command == command.command) {
                self.commands.push(command);
            }
        }
    }

    /// Writes `compile_commands.json` for editors and language servers.
    pub fn write_compile_commands(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.commands)
            .map_err(|e| BuildError::io(path, std::io::Error::other(e)))?;
        if let Some(parent) = path.parent() {
            super::utils::ensure_dir(parent)?;
        }
        write_atomic(path, &json).map_err(|e| BuildError::io(path, e))
    }
}

/// A failed build and the outputs it still produced.
#[derive(Debug, thiserror::Error)]
#[error("build failed")]
pub struct BuildFailure {
    pub partial: BuildReport,
    #[source]
    pub error: BuildError,
}

#[derive(Default)]
struct Shared {
    report: BuildReport,
    errors: Vec<BuildError>,
}

pub struct Scheduler<'a> {
    config: &'a BuildConfig,
    cache: BuildCache<'a>,
    invoker: Invoker<'a>,
    resolver: Option<DependencyResolver<'a>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a BuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            cache: BuildCache::new(config),
            invoker: Invoker::new(config, runner),
            resolver: None,
        }
    }

    /// Enables `// @depends` resolution through provider plugins.
    pub fn with_resolver(mut self, resolver: DependencyResolver<'a>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builds every source as `kind` with `workers` parallel jobs (0 means the
    /// configured worker count).
    pub fn build(&self, sources: &[PathBuf], kind: TargetKind, workers: usize) -> Result<BuildReport, BuildFailure> {
        let workers = if workers == 0 { self.config.workers() } else { workers };
        self.run(sources, kind, workers, true)
    }

    fn run(&self, sources: &[PathBuf], kind: TargetKind, workers: usize, top: bool) -> Result<BuildReport, BuildFailure> {
        let queue = Mutex::new(sources.iter().cloned().collect::<VecDeque<_>>());
        let shared = Mutex::new(Shared::default());
        let progress = if top { self.progress(sources.len()) } else { ProgressBar::hidden() };

        let work = || {
            loop {
                let Some(source) = lock(&queue).pop_front() else {
                    break;
                };
                progress.set_message(display_name(&source));
                let outcome = self.build_unit(&source, kind);
                let mut shared = lock(&shared);
                match outcome {
                    Ok(report) => shared.report.absorb(report),
                    Err(failure) => {
                        shared.report.absorb(failure.partial);
                        shared.errors.push(failure.error);
                    }
                }
                progress.inc(1);
            }
        };

        let workers = workers.clamp(1, sources.len().max(1));
        if workers == 1 {
            work();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&work);
                }
            });
        }
        progress.finish_and_clear();

        let Shared { report, mut errors } = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(BuildFailure {
                partial: report,
                error: errors.remove(0),
            })
        }
    }

    fn build_unit(&self, source: &Path, kind: TargetKind) -> Result<BuildReport, BuildFailure> {
        let mut report = BuildReport::default();
        let fail = |report: BuildReport, error: BuildError| BuildFailure { partial: report, error };

        let mut walker = Walker::new(self.config, &self.cache, self.resolver.as_ref(), &self.invoker);
        let resolved = walker.resolve(source).map_err(|e| fail(BuildReport::default(), e))?;
        if self.config.verbose {
            let stats = walker.stats();
            println!(
                "   {} {} ({} scanned, {} cached)",
                "🔍".blue(),
                source.display(),
                stats.scanned,
                stats.cache_hits
            );
        }

        for implementation in &resolved.entry.implementations {
            if implementation != source && !report.implementations.contains(implementation) {
                report.implementations.push(implementation.clone());
            }
        }

        // 1. Implementation companions, linked into executables and shared libraries.
        // Companions are walked too, so their own companions join the link until none are new.
        let mut linked: Vec<PathBuf> = Vec::new();
        let mut companions_rebuilt = false;
        if kind.links() {
            let mut pending = report.implementations.clone();
            while !pending.is_empty() {
                linked.extend(pending.iter().cloned());
                let companions = self
                    .run(&pending, kind.companion_kind(), 1, false)
                    .map_err(|failure| {
                        let mut partial = report.clone();
                        partial.absorb(failure.partial);
                        fail(partial, failure.error)
                    })?;
                companions_rebuilt |= !companions.rebuilt.is_empty();
                pending = companions
                    .implementations
                    .iter()
                    .filter(|imp| imp.as_path() != source && !linked.contains(*imp))
                    .cloned()
                    .collect();
                report.absorb(companions);
            }
        }
        let objects: Vec<PathBuf> = linked
            .iter()
            .map(|imp| self.config.output_path(imp, kind.companion_kind()))
            .collect();

        // 2. Dependency contributions, including those of linked companions
        for token in &resolved.entry.dependencies {
            if !report.dependencies.contains(token) {
                report.dependencies.push(token.clone());
            }
        }
        let contribution = match &self.resolver {
            Some(resolver) => resolver
                .resolve_all(&report.dependencies)
                .map_err(|e| fail(report.clone(), e))?,
            None => Contribution::default(),
        };

        // 3. Compile when the output is missing or older than anything it covers
        let output = self.config.output_path(source, kind);
        let pch = self.pch_for(&resolved.entry.includes);
        let task = self.task(source, &output, kind, objects, &contribution, pch);
        report.commands.push(CompileCommand {
            directory: self.config.base.to_string_lossy().to_string(),
            command: display_command(&self.invoker.command(&task)),
            file: source.to_string_lossy().to_string(),
        });

        let stale = || {
            companions_rebuilt
                || match mtime_ms(&output) {
                    None => true,
                    Some(built) => {
                        resolved.newest.is_none_or(|newest| newest > built)
                            || task.objects.iter().any(|o| mtime_ms(o).is_none_or(|m| m > built))
                    }
                }
        };
        match self.invoker.compile_if_stale(&task, stale) {
            Ok(true) => report.rebuilt.push(output.clone()),
            Ok(false) => {
                if self.config.verbose {
                    println!("   {} {} is up to date", "⚡".green(), output.display());
                }
            }
            Err(e) => return Err(fail(report, e)),
        }
        report.outputs.push(output);
        Ok(report)
    }

    /// The precompiled form of the unit's first include, if one was prepared.
    fn pch_for(&self, includes: &[PathBuf]) -> Option<PathBuf> {
        if !self.config.pch {
            return None;
        }
        let header = includes.iter().find(|inc| is_header(inc))?;
        let include = self.config.pch_include_path(header);
        include.is_file().then_some(include)
    }

    fn task(
        &self,
        source: &Path,
        output: &Path,
        kind: TargetKind,
        objects: Vec<PathBuf>,
        contribution: &Contribution,
        pch: Option<PathBuf>,
    ) -> CompileTask {
        let mut flags = self.config.compile_flags();
        merge_flags(&mut flags, &contribution.flags);
        if let Some(include) = pch {
            flags.push("-include".to_string());
            flags.push(include.to_string_lossy().to_string());
        }
        let mut include_dirs = self.config.include_dirs.clone();
        for inc in &contribution.incs {
            if !include_dirs.contains(inc) {
                include_dirs.push(inc.clone());
            }
        }
        let mut libs = Vec::new();
        if kind.links() {
            for lib in self.config.libs.iter().chain(&contribution.libs) {
                if !libs.contains(lib) {
                    libs.push(lib.clone());
                }
            }
        }

        CompileTask {
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            kind,
            compiler: self.config.compiler_for(source),
            flags,
            include_dirs,
            objects,
            libs,
            strict: self.config.strict,
            verbose: self.config.verbose,
        }
    }

    fn progress(&self, len: usize) -> ProgressBar {
        if !console::user_attended_stderr() || len == 0 {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let pb = ProgressBar::new(len as u64);
        pb.set_style(style);
        pb
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
