//! Build configuration.
//!
//! An optional `incc.toml` in the base directory supplies defaults; the CLI
//! overrides them. Example:
//!
//! ```toml
//! [build]
//! compiler = "clang++"
//! flags = ["-std=c++20", "-Wall"]
//! include_dirs = ["include"]
//! pch_threads = 4
//!
//! [modes.release]
//! flags = ["-O3", "-DNDEBUG"]
//! ```

use crate::build::utils::{merge_flags, normalize};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_FILE: &str = "incc.toml";

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct IncConfig {
    pub build: BuildSection,
    pub modes: BTreeMap<String, ModeConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct BuildSection {
    pub compiler: Option<String>,
    pub build_dir: Option<PathBuf>,
    pub flags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub pch: Option<bool>,
    pub pch_threads: Option<usize>,
    pub jobs: Option<usize>,
    pub strict: Option<bool>,
    pub tolerant_cycles: Option<bool>,
    pub dependencies_root: Option<PathBuf>,
    pub exclude: Vec<PathBuf>,
}

/// A named flag bundle selected with `--mode`.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ModeConfig {
    #[serde(default)]
    pub flags: Vec<String>,
}

/// What a translation unit is compiled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Executable,
    Shared,
    Object,
    /// Position-independent object, linked into a shared library.
    PicObject,
    PrecompiledHeader,
}

impl TargetKind {
    /// Link targets pull in the objects of their implementation companions.
    pub fn links(self) -> bool {
        matches!(self, TargetKind::Executable | TargetKind::Shared)
    }

    /// Object flavour used for the implementation companions of a link target.
    pub fn companion_kind(self) -> TargetKind {
        match self {
            TargetKind::Shared | TargetKind::PicObject => TargetKind::PicObject,
            _ => TargetKind::Object,
        }
    }
}

fn builtin_mode(name: &str) -> Option<Vec<String>> {
    let flags: &[&str] = match name {
        "debug" => &["-g", "-O0"],
        "release" => &["-O2", "-DNDEBUG"],
        "asan" => &["-g", "-fsanitize=address", "-fno-omit-frame-pointer"],
        _ => return None,
    };
    Some(flags.iter().map(|s| s.to_string()).collect())
}

// --- Helper: Load incc.toml (missing file means defaults) ---
pub fn load_config(base: &Path) -> Result<IncConfig> {
    let path = base.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(IncConfig::default());
    }
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&config_str).with_context(|| {
        format!(
            "Failed to parse {} - check for syntax errors (missing quotes, brackets)",
            path.display()
        )
    })
}

/// Fully resolved settings for one build session.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root that build outputs and cache records mirror.
    pub base: PathBuf,
    pub build_root: PathBuf,
    /// Selected modes, sorted and deduplicated.
    pub modes: Vec<String>,
    pub mode_flags: Vec<String>,
    pub flags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub compiler: Option<String>,
    pub pch: bool,
    pub pch_threads: usize,
    /// Worker count; 0 means host parallelism.
    pub jobs: usize,
    pub strict: bool,
    pub tolerant_cycles: bool,
    pub verbose: bool,
    pub dependencies_root: PathBuf,
    pub exclude: Vec<PathBuf>,
}

impl BuildConfig {
    /// Defaults rooted at `base`, with no modes selected.
    pub fn new(base: &Path) -> Self {
        let base = normalize(base);
        let dependencies_root = dirs::home_dir()
            .map(|home| home.join(".incc").join("dependencies"))
            .unwrap_or_else(|| base.join(".incc").join("dependencies"));

        Self {
            build_root: base.join(".incc").join("build"),
            base,
            modes: Vec::new(),
            mode_flags: Vec::new(),
            flags: Vec::new(),
            include_dirs: Vec::new(),
            libs: Vec::new(),
            compiler: None,
            pch: true,
            pch_threads: 4,
            jobs: 0,
            strict: false,
            tolerant_cycles: false,
            verbose: false,
            dependencies_root,
            exclude: Vec::new(),
        }
    }

    /// Applies `incc.toml` on top of the defaults and selects `modes`.
    pub fn from_file(file: &IncConfig, base: &Path, modes: &[String]) -> Result<Self> {
        let mut config = Self::new(base);
        let section = &file.build;
        let base = config.base.clone();
        let resolve = |p: &PathBuf| normalize(&base.join(p));

        if let Some(dir) = &section.build_dir {
            config.build_root = resolve(dir);
        }
        if let Some(dir) = &section.dependencies_root {
            config.dependencies_root = resolve(dir);
        }
        config.include_dirs = section.include_dirs.iter().map(resolve).collect();
        config.exclude = section.exclude.iter().map(resolve).collect();
        config.flags = section.flags.clone();
        config.libs = section.libs.clone();
        config.compiler = section.compiler.clone();
        config.pch = section.pch.unwrap_or(config.pch);
        config.pch_threads = section.pch_threads.unwrap_or(config.pch_threads).max(1);
        config.jobs = section.jobs.unwrap_or(config.jobs);
        config.strict = section.strict.unwrap_or(config.strict);
        config.tolerant_cycles = section.tolerant_cycles.unwrap_or(config.tolerant_cycles);

        config.select_modes(file, modes)?;
        Ok(config)
    }

    fn select_modes(&mut self, file: &IncConfig, modes: &[String]) -> Result<()> {
        let mut names: Vec<String> = modes
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        names.sort();
        names.dedup();

        let mut flags = Vec::new();
        for name in &names {
            let bundle = match file.modes.get(name) {
                Some(mode) => mode.flags.clone(),
                None => builtin_mode(name)
                    .with_context(|| format!("Unknown mode '{}'", name))?,
            };
            merge_flags(&mut flags, &bundle);
        }

        self.modes = names;
        self.mode_flags = flags;
        Ok(())
    }

    /// Directory name distinguishing builds with different modes.
    pub fn mode_suffix(&self) -> String {
        if self.modes.is_empty() {
            "default".to_string()
        } else {
            self.modes.join("-")
        }
    }

    pub fn mode_root(&self) -> PathBuf {
        self.build_root.join(self.mode_suffix())
    }

    pub fn cache_root(&self) -> PathBuf {
        self.mode_root().join("deps")
    }

    pub fn pch_root(&self) -> PathBuf {
        self.mode_root().join("pch")
    }

    /// Maps `path` into a relative path that mirrors the source tree.
    ///
    /// Paths under `base` keep their relative layout; anything else keeps its
    /// absolute layout minus the root.
    pub fn mirror(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.base) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Where the build output for `source` lands.
    pub fn output_path(&self, source: &Path, kind: TargetKind) -> PathBuf {
        let mirrored = self.mode_root().join(self.mirror(source));
        match kind {
            TargetKind::Executable => {
                let out = mirrored.with_extension("");
                if cfg!(target_os = "windows") {
                    out.with_extension("exe")
                } else {
                    out
                }
            }
            TargetKind::Shared => mirrored.with_extension(std::env::consts::DLL_EXTENSION),
            TargetKind::Object => mirrored.with_extension("o"),
            TargetKind::PicObject => mirrored.with_extension("pic.o"),
            TargetKind::PrecompiledHeader => with_suffix(&self.pch_include_path(source), ".gch"),
        }
    }

    /// What units pass to `-include` to pick up the PCH of `header`. The
    /// compiler tries `<this>.gch` first and falls back to the forwarding
    /// header written at this path.
    pub fn pch_include_path(&self, header: &Path) -> PathBuf {
        self.pch_root().join(self.mirror(header))
    }

    /// Generated translation unit that only includes `header`, next to its PCH.
    pub fn pch_wrapper_path(&self, header: &Path) -> PathBuf {
        with_suffix(&self.pch_root().join(self.mirror(header)), ".wrapper")
    }

    /// Base and mode flags, in that order.
    pub fn compile_flags(&self) -> Vec<String> {
        let mut flags = self.flags.clone();
        merge_flags(&mut flags, &self.mode_flags);
        flags
    }

    /// Compiler for a unit: configured compiler, then `CC`/`CXX`, then `cc`/`c++`.
    pub fn compiler_for(&self, source: &Path) -> String {
        if let Some(compiler) = &self.compiler {
            return compiler.clone();
        }
        let is_c = source.extension().is_some_and(|ext| ext == "c");
        let (var, fallback) = if is_c { ("CC", "cc") } else { ("CXX", "c++") };
        std::env::var(var).unwrap_or_else(|_| fallback.to_string())
    }

    pub fn workers(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }
}

/// Appends `suffix` to the file name, keeping any existing extension.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
