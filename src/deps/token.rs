use crate::error::{BuildError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Version used when a token does not pin one.
pub const DEFAULT_VERSION: &str = "latest";

/// A parsed `creator/library:version` dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyToken {
    pub creator: String,
    pub library: String,
    pub version: String,
}

impl DependencyToken {
    /// Parses a token. The version is split off first, then the creator;
    /// a missing creator defaults to the library name.
    pub fn parse(token: &str) -> Result<Self> {
        let trimmed = token.trim();
        let (name, version) = match trimmed.split_once(':') {
            Some((name, version)) => (name, version.trim()),
            None => (trimmed, ""),
        };
        let (creator, library) = match name.rsplit_once('/') {
            Some((creator, library)) => (creator.trim(), library.trim()),
            None => ("", name.trim()),
        };

        if library.is_empty() {
            return Err(BuildError::UnnamedDependency {
                token: token.to_string(),
            });
        }

        Ok(Self {
            creator: if creator.is_empty() { library } else { creator }.to_string(),
            library: library.to_string(),
            version: if version.is_empty() { DEFAULT_VERSION } else { version }.to_string(),
        })
    }

    /// `<root>/<creator>/<library>/<UpperCamel(library)>Dependency`
    pub fn plugin_path(&self, root: &Path) -> PathBuf {
        root.join(&self.creator)
            .join(&self.library)
            .join(format!("{}Dependency", upper_camel(&self.library)))
    }
}

impl fmt::Display for DependencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.creator, self.library, self.version)
    }
}

fn upper_camel(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_token() {
        let token = DependencyToken::parse("fmtlib/fmt:10.2.1").unwrap();
        assert_eq!(token.creator, "fmtlib");
        assert_eq!(token.library, "fmt");
        assert_eq!(token.version, "10.2.1");
        assert_eq!(token.to_string(), "fmtlib/fmt:10.2.1");
    }

    #[test]
    fn test_creator_defaults_to_library() {
        let token = DependencyToken::parse("zlib").unwrap();
        assert_eq!(token.creator, "zlib");
        assert_eq!(token.version, DEFAULT_VERSION);

        let token = DependencyToken::parse(" zlib:1.3 ").unwrap();
        assert_eq!(token.creator, "zlib");
        assert_eq!(token.version, "1.3");
    }

    #[test]
    fn test_empty_version_falls_back_to_default() {
        let token = DependencyToken::parse("nlohmann/json:").unwrap();
        assert_eq!(token.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_missing_library_is_unnamed() {
        for bad in ["", "  ", "fmtlib/", ":1.0", "fmtlib/:1.0"] {
            let err = DependencyToken::parse(bad).unwrap_err();
            assert!(
                matches!(err, BuildError::UnnamedDependency { .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_plugin_path_layout() {
        let token = DependencyToken::parse("nlohmann/nlohmann_json").unwrap();
        assert_eq!(
            token.plugin_path(Path::new("/deps")),
            PathBuf::from("/deps/nlohmann/nlohmann_json/NlohmannJsonDependency")
        );
    }

    #[test]
    fn test_upper_camel() {
        assert_eq!(upper_camel("fmt"), "Fmt");
        assert_eq!(upper_camel("sdl2-image"), "Sdl2Image");
        assert_eq!(upper_camel("boost.asio"), "BoostAsio");
    }
}
