use crate::error::{BuildError, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

pub const HEADER_EXTENSIONS: &[&str] = &["h", "hh", "hpp", "hxx"];
pub const SOURCE_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx", "c"];

pub fn is_header(path: &Path) -> bool {
    has_extension(path, HEADER_EXTENSIONS)
}

pub fn is_source(path: &Path) -> bool {
    has_extension(path, SOURCE_EXTENSIONS)
}

fn has_extension(path: &Path, list: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| list.contains(&ext.as_str()))
}

/// Makes `path` absolute and folds `.`/`..` lexically, without touching symlinks.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Modification time in milliseconds since the epoch, `None` if the file is missing.
pub fn mtime_ms(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    Some(millis as u64)
}

/// The buildable companion of a header (`foo.hpp` -> `foo.cpp`), if one exists.
pub fn companion_source(header: &Path) -> Option<PathBuf> {
    if !is_header(header) {
        return None;
    }
    SOURCE_EXTENSIONS
        .iter()
        .map(|ext| header.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

/// Writes through a sibling temporary file so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{}.{}.{:?}.tmp",
        file_name,
        std::process::id(),
        std::thread::current().id()
    ));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| BuildError::io(dir, e))
}

/// Expands the CLI inputs into source files.
///
/// Source files are taken as given; directories are listed (recursively with
/// `recursive`) for buildable sources. Results are sorted for stable order.
pub fn collect_sources(inputs: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    let mut sources = Vec::new();

    for input in inputs {
        if input.is_file() {
            if is_source(input) {
                sources.push(normalize(input));
            }
            continue;
        }
        if !input.is_dir() {
            continue;
        }

        let depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(input)
            .max_depth(depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file() && is_source(path) {
                sources.push(normalize(path));
            }
        }
    }

    sources.sort();
    sources.dedup();
    sources
}

/// Appends the options in `from` that `into` does not already carry.
///
/// An option is a `-`-prefixed token together with the bare tokens after it,
/// so `-include a.h` and `-include b.h` are two distinct options.
pub fn merge_flags(into: &mut Vec<String>, from: &[String]) {
    for option in option_groups(from) {
        let present = option_groups(into).contains(&option);
        if !present {
            into.extend_from_slice(option);
        }
    }
}

fn option_groups(flags: &[String]) -> Vec<&[String]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for end in 1..=flags.len() {
        if end == flags.len() || flags[end].starts_with('-') {
            groups.push(&flags[start..end]);
            start = end;
        }
    }
    groups
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::normalize;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::LazyLock;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Whole-second instant shared by every offset, so files set to the same
    /// offset get identical mtimes.
    static ANCHOR: LazyLock<SystemTime> = LazyLock::new(|| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        UNIX_EPOCH + Duration::from_secs(secs)
    });

    pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = normalize(&dir.join(name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    /// Sets the mtime to the test-run anchor plus `offset` seconds (negative is the past).
    pub fn set_mtime_secs(path: &Path, offset: i64) {
        let delta = Duration::from_secs(offset.unsigned_abs());
        let time = if offset < 0 { *ANCHOR - delta } else { *ANCHOR + delta };
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }
}
