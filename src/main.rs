//! # incc CLI Entry Point
//!
//! Parses arguments with clap, layers them over `incc.toml`, and hands the
//! collected sources to the build engine. The same binary is re-invoked with
//! `--shared` to rebuild dependency provider plugins.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use colored::*;
use std::path::{Path, PathBuf};
use std::process::Command;

use incc::build::{self, utils};
use incc::config::{self, BuildConfig, TargetKind};

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn SetConsoleOutputCP(wCodePageID: u32) -> i32;
    fn SetConsoleCP(wCodePageID: u32) -> i32;
}

#[cfg(windows)]
fn enable_windows_utf8_console() {
    unsafe {
        SetConsoleOutputCP(65001);
        SetConsoleCP(65001);
    }
}

#[cfg(not(windows))]
fn enable_windows_utf8_console() {}

#[derive(Parser)]
#[command(name = "incc")]
#[command(about = "Incremental, dependency-aware C/C++ compiler driver", version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
struct Cli {
    /// Source files or directories to build
    inputs: Vec<PathBuf>,

    /// Descend into input directories
    #[arg(short, long)]
    recursive: bool,

    /// Flag bundles to apply (e.g. debug,asan)
    #[arg(short, long, value_delimiter = ',')]
    mode: Vec<String>,

    /// Extra include directory
    #[arg(short = 'I', long = "include")]
    include: Vec<PathBuf>,

    /// Extra library to link
    #[arg(short = 'l', long = "lib")]
    lib: Vec<String>,

    /// Build folder (default: <base>/.incc/build)
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Project root that outputs and cache records mirror
    #[arg(long, default_value = ".")]
    base: PathBuf,

    /// Run the executable after a successful build
    #[arg(long)]
    run: bool,

    /// Build shared libraries instead of executables
    #[arg(long)]
    shared: bool,

    /// Print every compiler invocation
    #[arg(short, long)]
    verbose: bool,

    /// Remove the mode's build directory first
    #[arg(long)]
    clean: bool,

    /// Disable precompiled headers
    #[arg(long)]
    no_pch: bool,

    /// Parallel jobs (0 = all cores)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Require every header to start with #pragma once
    #[arg(long)]
    strict: bool,

    /// Report include cycles instead of failing
    #[arg(long)]
    tolerant_cycles: bool,

    /// Print shell completions and exit
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,

    /// Arguments passed to the program with --run
    #[arg(last = true)]
    run_args: Vec<String>,
}

fn main() -> Result<()> {
    enable_windows_utf8_console();

    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let config = resolve_config(&cli)?;

    if cli.clean {
        build::clean(&config)?;
        if cli.inputs.is_empty() {
            return Ok(());
        }
    }

    let sources = collect(&cli, &config);
    if sources.is_empty() {
        println!("{} Nothing to do", "!".yellow());
        return Ok(());
    }

    let kind = if cli.shared {
        TargetKind::Shared
    } else {
        TargetKind::Executable
    };
    build::build_project(&config, &sources, kind)?;

    if cli.run {
        if cli.shared {
            println!("{} --run ignored for shared libraries", "!".yellow());
            return Ok(());
        }
        let exe = config.output_path(&sources[0], TargetKind::Executable);
        run_program(&exe, &cli.run_args)?;
    }
    Ok(())
}

// --- Helper: Layer CLI options over incc.toml ---
fn resolve_config(cli: &Cli) -> Result<BuildConfig> {
    let base = std::path::absolute(&cli.base)
        .with_context(|| format!("Invalid base directory {}", cli.base.display()))?;
    let file = config::load_config(&base)?;
    let mut config = BuildConfig::from_file(&file, &base, &cli.mode)?;

    if let Some(dir) = &cli.build_dir {
        config.build_root = utils::normalize(&std::path::absolute(dir)?);
    }
    for dir in &cli.include {
        let dir = utils::normalize(&std::path::absolute(dir)?);
        if !config.include_dirs.contains(&dir) {
            config.include_dirs.push(dir);
        }
    }
    for lib in &cli.lib {
        if !config.libs.contains(lib) {
            config.libs.push(lib.clone());
        }
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    config.pch &= !cli.no_pch;
    config.strict |= cli.strict;
    config.tolerant_cycles |= cli.tolerant_cycles;
    config.verbose |= cli.verbose;
    Ok(config)
}

// --- Helper: Top-level sources, minus excluded trees ---
fn collect(cli: &Cli, config: &BuildConfig) -> Vec<PathBuf> {
    utils::collect_sources(&cli.inputs, cli.recursive)
        .into_iter()
        .filter(|src| !config.exclude.iter().any(|ex| src.starts_with(ex)))
        .collect()
}

fn run_program(exe: &Path, args: &[String]) -> Result<()> {
    println!("{} Running {}...", "▶".cyan(), exe.display());
    let status = Command::new(exe)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run {}", exe.display()))?;

    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
