//! Build artifact cleanup.
//!
//! `incc --clean` removes the outputs of the selected mode combination:
//! objects, executables, cache records and precompiled headers all live
//! under `<build root>/<mode>`. Other mode combinations are left alone.

use crate::config::BuildConfig;
use anyhow::{Context, Result};
use colored::*;
use std::fs;

/// Removes the mode directory. Returns whether anything was removed.
pub fn clean(config: &BuildConfig) -> Result<bool> {
    let mode_root = config.mode_root();
    if !mode_root.exists() {
        println!("{} Nothing to clean", "!".yellow());
        return Ok(false);
    }

    fs::remove_dir_all(&mode_root)
        .with_context(|| format!("Failed to remove {}", mode_root.display()))?;
    println!("{} Removed {}", "🗑️".red(), mode_root.display());

    // Drop the build root too once no mode is left in it
    if fs::read_dir(&config.build_root).is_ok_and(|mut entries| entries.next().is_none()) {
        let _ = fs::remove_dir(&config.build_root);
    }

    println!("{} Clean complete.", "✓".green());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_clean_removes_only_the_selected_mode() {
        let dir = tempdir().unwrap();
        let mut config = BuildConfig::new(dir.path());
        config.modes = vec!["release".to_string()];
        fs::create_dir_all(config.mode_root().join("deps")).unwrap();
        let other = config.build_root.join("default");
        fs::create_dir_all(&other).unwrap();

        assert!(clean(&config).unwrap());
        assert!(!config.mode_root().exists());
        assert!(other.exists());
        assert!(!clean(&config).unwrap());
    }

    #[test]
    fn test_clean_prunes_empty_build_root() {
        let dir = tempdir().unwrap();
        let config = BuildConfig::new(dir.path());
        fs::create_dir_all(config.cache_root()).unwrap();

        assert!(clean(&config).unwrap());
        assert!(!config.build_root.exists());
    }
}
