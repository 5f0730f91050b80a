//! Precompiled header coordination.
//!
//! While a translation unit is walked, every header it reaches is offered to
//! the coordinator. Headers whose precompiled object is missing or older than
//! the header (or its wrapper) get a wrapper translation unit and a queued
//! compile. The queue is drained in one bounded-parallel batch when the walk
//! of that unit finishes.
//!
//! Units pick a PCH up with `-include <pch dir>/<header>`: the compiler uses
//! `<header>.gch` from that directory when it is valid for the unit's flags,
//! and otherwise reads the forwarding header stored under the same name.

use super::invoker::{CompileTask, Invoker};
use super::utils::{ensure_dir, mtime_ms, write_atomic};
use crate::config::{BuildConfig, TargetKind};
use crate::error::{BuildError, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PchEntry {
    pub header: PathBuf,
    pub wrapper: PathBuf,
    /// Forwarding header that units `-include`.
    pub include: PathBuf,
    pub object: PathBuf,
    pub needs_rebuild: bool,
}

pub struct PchCoordinator<'a> {
    config: &'a BuildConfig,
    queued: Vec<CompileTask>,
}

impl<'a> PchCoordinator<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self {
            config,
            queued: Vec::new(),
        }
    }

    /// Paths and staleness for `header`.
    pub fn entry_for(&self, header: &Path) -> PchEntry {
        let object = self.config.output_path(header, TargetKind::PrecompiledHeader);
        let wrapper = self.config.pch_wrapper_path(header);
        let include = self.config.pch_include_path(header);

        let needs_rebuild = match mtime_ms(&object) {
            None => true,
            Some(built) => {
                mtime_ms(header).is_none_or(|h| h > built)
                    || mtime_ms(&wrapper).is_some_and(|w| w > built)
            }
        };

        PchEntry {
            header: header.to_path_buf(),
            wrapper,
            include,
            object,
            needs_rebuild,
        }
    }

    /// Queues a compile for `header` if its precompiled object is stale.
    ///
    /// The wrapper is (re)written only when missing or older than the header.
    pub fn consider(&mut self, header: &Path, flags: &[String], include_dirs: &[PathBuf]) -> Result<PchEntry> {
        let entry = self.entry_for(header);
        let forward = format!("#include \"{}\"\n", header.display());

        if let Some(parent) = entry.object.parent() {
            ensure_dir(parent)?;
        }
        if !entry.include.is_file() {
            write_atomic(&entry.include, &forward).map_err(|e| BuildError::io(&entry.include, e))?;
        }
        if !entry.needs_rebuild {
            return Ok(entry);
        }

        let wrapper_stale = match (mtime_ms(&entry.wrapper), mtime_ms(header)) {
            (Some(w), Some(h)) => h > w,
            _ => true,
        };
        if wrapper_stale {
            write_atomic(&entry.wrapper, &forward).map_err(|e| BuildError::io(&entry.wrapper, e))?;
        }

        self.queued.push(CompileTask {
            source: entry.wrapper.clone(),
            output: entry.object.clone(),
            kind: TargetKind::PrecompiledHeader,
            compiler: self.config.compiler_for(header),
            flags: flags.to_vec(),
            include_dirs: include_dirs.to_vec(),
            objects: Vec::new(),
            libs: Vec::new(),
            strict: false,
            verbose: self.config.verbose,
        });
        Ok(entry)
    }

    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    /// Compiles everything queued, at most `threads` at a time, and empties the queue.
    /// Every queued compile runs unless another unit produced the same PCH in
    /// the meantime; the first failure is returned.
    pub fn flush(&mut self, invoker: &Invoker<'_>, threads: usize) -> Result<()> {
        let tasks = std::mem::take(&mut self.queued);
        run_batch(&tasks, invoker, threads)
    }
}

pub fn run_batch(tasks: &[CompileTask], invoker: &Invoker<'_>, threads: usize) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }

    let results: Vec<Result<()>> = match rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
    {
        Ok(pool) => pool.install(|| tasks.par_iter().map(|task| compile_pch(invoker, task)).collect()),
        Err(_) => tasks.iter().map(|task| compile_pch(invoker, task)).collect(),
    };
    results.into_iter().collect()
}

fn compile_pch(invoker: &Invoker<'_>, task: &CompileTask) -> Result<()> {
    let stale = || match mtime_ms(&task.output) {
        None => true,
        Some(built) => mtime_ms(&task.source).is_none_or(|wrapper| wrapper > built),
    };
    invoker.compile_if_stale(task, stale)?;
    Ok(())
}
