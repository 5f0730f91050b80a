//! The incremental build engine.
//!
//! - [`walker`] - include/dependency graph extraction with cycle detection
//! - [`cache`] - mtime-validated on-disk graph records
//! - [`pch`] - precompiled header staleness and batching
//! - [`scheduler`] - parallel per-unit builds with companion objects
//! - [`invoker`] - compiler command lines and header hygiene

pub mod cache;
mod clean;
mod feedback;
pub mod invoker;
pub mod pch;
pub mod scheduler;
pub mod utils;
pub mod walker;

pub use cache::{BuildCache, DependencyGraphEntry};
pub use clean::clean;
pub use feedback::FeedbackAnalyzer;
pub use invoker::{CompileTask, Invoker};
pub use pch::{PchCoordinator, PchEntry};
pub use scheduler::{BuildFailure, BuildReport, CompileCommand, Scheduler};
pub use walker::{Resolved, WalkStats, Walker};

use crate::config::{BuildConfig, TargetKind};
use crate::deps::DependencyResolver;
use crate::exec::{CommandRunner, SystemRunner};
use crate::plugin::PluginLoader;
use anyhow::Result;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

// --- CORE: Build a set of units with real processes and provider plugins ---
pub fn build_project(config: &BuildConfig, sources: &[PathBuf], kind: TargetKind) -> Result<BuildReport> {
    let start_time = Instant::now();
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let loader = PluginLoader::new(config, runner.clone());
    let resolver = DependencyResolver::new(&config.dependencies_root, &loader);
    let scheduler = Scheduler::new(config, runner).with_resolver(resolver);

    println!(
        "{} Building {} unit(s) [{}]",
        "⚙".blue(),
        sources.len(),
        config.mode_suffix().bold()
    );

    let result = scheduler.build(sources, kind, config.jobs);

    let report = match &result {
        Ok(report) => report,
        Err(failure) => &failure.partial,
    };
    if !report.commands.is_empty() {
        let path = config.mode_root().join("compile_commands.json");
        if let Err(e) = report.write_compile_commands(&path) {
            println!("{} Could not write compile_commands.json: {}", "!".yellow(), e);
        }
    }

    match result {
        Ok(report) => {
            if report.rebuilt.is_empty() {
                println!("{} Up to date", "⚡".green());
            } else {
                println!(
                    "{} Build finished in {:.2?} ({} rebuilt)",
                    "✓".green(),
                    start_time.elapsed(),
                    report.rebuilt.len()
                );
            }
            Ok(report)
        }
        Err(failure) => {
            if !failure.partial.outputs.is_empty() {
                println!(
                    "{} {} output(s) were still built",
                    "!".yellow(),
                    failure.partial.outputs.len()
                );
            }
            Err(failure.into())
        }
    }
}
