//! Compiler invocation.
//!
//! Turns a [`CompileTask`] into one compiler command line, runs it, and maps
//! a non-zero exit to [`BuildError::CompileFailed`] with highlighted
//! diagnostics. With `strict`, every compile is preceded (once per session)
//! by a header hygiene sweep: each header under the base must open with
//! `#pragma once`.

use super::feedback::FeedbackAnalyzer;
use super::utils::{ensure_dir, is_header};
use crate::config::{BuildConfig, TargetKind};
use crate::error::{BuildError, Result};
use crate::exec::{CommandRunner, display_command};
use colored::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use walkdir::WalkDir;

/// One compiler invocation.
#[derive(Debug, Clone)]
pub struct CompileTask {
    /// The translation unit, or the wrapper for a precompiled header.
    pub source: PathBuf,
    pub output: PathBuf,
    pub kind: TargetKind,
    pub compiler: String,
    pub flags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    /// Objects linked into executables and shared libraries.
    pub objects: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub strict: bool,
    pub verbose: bool,
}

pub struct Invoker<'a> {
    config: &'a BuildConfig,
    runner: Arc<dyn CommandRunner>,
    hygiene: OnceLock<Vec<PathBuf>>,
    /// One lock per output path, so an output is produced by one compile at a time.
    outputs: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl<'a> Invoker<'a> {
    pub fn new(config: &'a BuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            hygiene: OnceLock::new(),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// The full command line for `task`.
    pub fn command(&self, task: &CompileTask) -> Vec<String> {
        let mut cmd = vec![task.compiler.clone()];
        cmd.extend(task.flags.iter().cloned());
        for dir in &task.include_dirs {
            cmd.push(format!("-I{}", dir.display()));
        }

        let src = task.source.to_string_lossy().to_string();
        let out = task.output.to_string_lossy().to_string();
        match task.kind {
            TargetKind::Object => {
                cmd.extend(["-c".to_string(), src, "-o".to_string(), out]);
            }
            TargetKind::PicObject => {
                cmd.extend(["-fPIC".to_string(), "-c".to_string(), src, "-o".to_string(), out]);
            }
            TargetKind::PrecompiledHeader => {
                let language = if is_c_compiler(&task.compiler) {
                    "c-header"
                } else {
                    "c++-header"
                };
                cmd.extend(["-x".to_string(), language.to_string(), src, "-o".to_string(), out]);
            }
            TargetKind::Executable | TargetKind::Shared => {
                if task.kind == TargetKind::Shared {
                    cmd.push("-shared".to_string());
                    cmd.push("-fPIC".to_string());
                }
                cmd.push(src);
                cmd.extend(task.objects.iter().map(|o| o.to_string_lossy().to_string()));
                cmd.push("-o".to_string());
                cmd.push(out);
                cmd.extend(task.libs.iter().map(|lib| link_arg(lib)));
            }
        }
        cmd
    }

    /// Runs the compiler for `task`.
    pub fn compile(&self, task: &CompileTask) -> Result<()> {
        if task.strict {
            self.check_hygiene()?;
        }
        if let Some(parent) = task.output.parent() {
            ensure_dir(parent)?;
        }

        let command = self.command(task);
        if task.verbose {
            println!("   {} {}", "⚙".blue(), display_command(&command).dimmed());
        }

        let output = self
            .runner
            .execute(&command)
            .map_err(|e| BuildError::CompileFailed {
                source_path: task.source.clone(),
                code: -1,
                stderr: format!("failed to run `{}`: {}", task.compiler, e),
            })?;

        if !output.success() {
            return Err(BuildError::CompileFailed {
                source_path: task.source.clone(),
                code: output.code,
                stderr: highlight(&output.stderr),
            });
        }

        // Print warnings if any
        if !output.stderr.trim().is_empty() {
            println!(
                "{} Warning in {}:\n{}",
                "!".yellow(),
                task.source.display(),
                highlight(&output.stderr)
            );
        }
        Ok(())
    }

    /// Compiles `task` if `stale` says its output needs it, and reports whether it did.
    ///
    /// Callers targeting the same output are serialized: a caller that finds
    /// the output being produced waits for that compile, then asks `stale`
    /// again instead of overwriting a file another unit may be reading.
    pub fn compile_if_stale(&self, task: &CompileTask, stale: impl FnOnce() -> bool) -> Result<bool> {
        let slot = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task.output.clone())
            .or_default()
            .clone();
        let _producing = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if !stale() {
            return Ok(false);
        }
        self.compile(task)?;
        Ok(true)
    }

    /// Fails if any header under the base does not start with `#pragma once`.
    /// The sweep runs once per invoker; later calls reuse its result.
    pub fn check_hygiene(&self) -> Result<()> {
        let offenders = self.hygiene.get_or_init(|| {
            let mut skip = self.config.exclude.clone();
            skip.push(self.config.build_root.clone());
            header_hygiene_offenders(&self.config.base, &skip)
        });
        if offenders.is_empty() {
            Ok(())
        } else {
            Err(BuildError::HeaderHygieneViolation {
                offenders: offenders.clone(),
            })
        }
    }
}

/// Headers under `root` whose first non-blank line is not `#pragma once`.
pub fn header_hygiene_offenders(root: &Path, skip: &[PathBuf]) -> Vec<PathBuf> {
    let mut offenders: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let hidden = e.depth() > 0 && e.file_name().to_string_lossy().starts_with('.');
            !hidden && !skip.iter().any(|s| e.path().starts_with(s))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_header(e.path()))
        .filter(|e| !starts_with_pragma_once(e.path()))
        .map(|e| e.into_path())
        .collect();
    offenders.sort();
    offenders
}

fn starts_with_pragma_once(path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(path) else {
        return false;
    };
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| {
            line.strip_prefix('#')
                .map(|rest| rest.split_whitespace().collect::<Vec<_>>())
                .is_some_and(|words| words.first() == Some(&"pragma") && words.get(1) == Some(&"once"))
        })
}

/// `foo` becomes `-lfoo`; flags and paths pass through.
pub fn link_arg(lib: &str) -> String {
    if lib.starts_with('-') || lib.contains('/') || lib.contains('\\') || lib.contains('.') {
        lib.to_string()
    } else {
        format!("-l{}", lib)
    }
}

fn is_c_compiler(compiler: &str) -> bool {
    let name = Path::new(compiler)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    !name.contains("++") && (name == "cc" || name.ends_with("gcc") || name.ends_with("clang"))
}

// --- Helper: Colorize diagnostics and append a hint ---
fn highlight(stderr: &str) -> String {
    let mut out = stderr
        .lines()
        .map(|line| {
            if line.contains("error") {
                line.red().to_string()
            } else if line.contains("warning") {
                line.yellow().to_string()
            } else if line.contains("note:") {
                line.cyan().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(hint) = FeedbackAnalyzer::analyze(stderr) {
        out.push_str(&format!("\n\n{} {}", "💡 Hint:".bold().cyan(), hint));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::utils::test_support::write_file;
    use crate::exec::test_support::RecordingRunner;
    use tempfile::tempdir;

    fn task(kind: TargetKind) -> CompileTask {
        CompileTask {
            source: PathBuf::from("/p/main.cpp"),
            output: PathBuf::from("/p/out/main"),
            kind,
            compiler: "c++".to_string(),
            flags: vec!["-O2".to_string()],
            include_dirs: vec![PathBuf::from("/p/include")],
            objects: vec![PathBuf::from("/p/out/util.o")],
            libs: vec!["m".to_string(), "-pthread".to_string()],
            strict: false,
            verbose: false,
        }
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_object_command() {
        let config = BuildConfig::new(Path::new("/p"));
        let invoker = Invoker::new(&config, Arc::new(RecordingRunner::default()));
        assert_eq!(
            invoker.command(&task(TargetKind::Object)),
            strings(&["c++", "-O2", "-I/p/include", "-c", "/p/main.cpp", "-o", "/p/out/main"])
        );
        assert!(invoker.command(&task(TargetKind::PicObject)).contains(&"-fPIC".to_string()));
    }

    #[test]
    fn test_link_commands_carry_objects_and_libs() {
        let config = BuildConfig::new(Path::new("/p"));
        let invoker = Invoker::new(&config, Arc::new(RecordingRunner::default()));
        assert_eq!(
            invoker.command(&task(TargetKind::Executable)),
            strings(&[
                "c++", "-O2", "-I/p/include", "/p/main.cpp", "/p/out/util.o", "-o", "/p/out/main",
                "-lm", "-pthread",
            ])
        );
        let shared = invoker.command(&task(TargetKind::Shared));
        assert_eq!(&shared[3..5], &strings(&["-shared", "-fPIC"]));
    }

    #[test]
    fn test_pch_command_picks_header_language() {
        let config = BuildConfig::new(Path::new("/p"));
        let invoker = Invoker::new(&config, Arc::new(RecordingRunner::default()));
        let mut pch = task(TargetKind::PrecompiledHeader);
        let cmd = invoker.command(&pch);
        assert!(cmd.windows(2).any(|w| w == ["-x", "c++-header"]));

        pch.compiler = "/usr/bin/gcc".to_string();
        let cmd = invoker.command(&pch);
        assert!(cmd.windows(2).any(|w| w == ["-x", "c-header"]));
    }

    #[test]
    fn test_link_arg() {
        assert_eq!(link_arg("z"), "-lz");
        assert_eq!(link_arg("-lz"), "-lz");
        assert_eq!(link_arg("/opt/lib/libz.a"), "/opt/lib/libz.a");
    }

    #[test]
    fn test_compile_creates_output_dir_and_reports_failure() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path());
        let runner = Arc::new(RecordingRunner::failing_on("bad.cpp"));
        let invoker = Invoker::new(&config, runner.clone());

        let mut good = task(TargetKind::Object);
        good.source = write_file(dir.path(), "good.cpp", "");
        good.output = dir.path().join("out/nested/good.o");
        invoker.compile(&good).unwrap();
        assert!(good.output.exists());

        let mut bad = good.clone();
        bad.source = write_file(dir.path(), "bad.cpp", "");
        match invoker.compile(&bad).unwrap_err() {
            BuildError::CompileFailed { source_path, code, stderr } => {
                assert_eq!(source_path, bad.source);
                assert_eq!(code, 1);
                assert!(stderr.contains("expected ';'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hygiene_sweep_reports_offenders() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "good.hpp", "\n  #pragma once\nint x;\n");
        write_file(dir.path(), "spaced.h", "# pragma once\n");
        write_file(dir.path(), "sub/bad.hpp", "#ifndef BAD\n#define BAD\n#endif\n");
        write_file(dir.path(), "vendor/skip.hpp", "int y;\n");
        write_file(dir.path(), ".hidden/skip.hpp", "int z;\n");

        let root = dir.path().canonicalize().unwrap();
        let offenders = header_hygiene_offenders(&root, &[root.join("vendor")]);
        assert_eq!(offenders, vec![root.join("sub/bad.hpp")]);
    }

    #[test]
    fn test_strict_compile_stops_before_running_the_compiler() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path());
        write_file(dir.path(), "guarded.hpp", "#ifndef G\n#define G\n#endif\n");
        let runner = Arc::new(RecordingRunner::default());
        let invoker = Invoker::new(&config, runner.clone());

        let mut strict = task(TargetKind::Object);
        strict.source = write_file(dir.path(), "main.cpp", "");
        strict.output = dir.path().join("main.o");
        strict.strict = true;

        assert!(matches!(
            invoker.compile(&strict),
            Err(BuildError::HeaderHygieneViolation { .. })
        ));
        assert!(runner.commands().is_empty());

        strict.strict = false;
        invoker.compile(&strict).unwrap();
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_concurrent_compiles_of_one_output_run_once() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path());
        let runner = Arc::new(RecordingRunner::slow(50));
        let invoker = Invoker::new(&config, runner.clone());

        let mut shared = task(TargetKind::Object);
        shared.source = write_file(dir.path(), "util.cpp", "");
        shared.output = dir.path().join("out/util.o");

        let (invoker, shared) = (&invoker, &shared);
        let compiled: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(move || {
                        invoker
                            .compile_if_stale(shared, || !shared.output.exists())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(compiled.iter().filter(|c| **c).count(), 1);
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_fresh_output_is_not_compiled() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path());
        let runner = Arc::new(RecordingRunner::default());
        let invoker = Invoker::new(&config, runner.clone());

        assert!(!invoker.compile_if_stale(&task(TargetKind::Object), || false).unwrap());
        assert!(runner.commands().is_empty());
    }
}
