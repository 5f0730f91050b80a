use super::provider::{DependencyProvider, FfiProvider, RawProvider};
use super::token::DependencyToken;
use crate::build::utils::merge_flags;
use crate::error::{BuildError, Result};
use crate::plugin::PluginLoader;
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Compiler and linker inputs contributed by resolved dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contribution {
    pub flags: Vec<String>,
    pub libs: Vec<String>,
    pub incs: Vec<PathBuf>,
}

impl Contribution {
    pub fn extend(&mut self, other: &Contribution) {
        merge_flags(&mut self.flags, &other.flags);
        extend_unique(&mut self.libs, &other.libs);
        extend_unique(&mut self.incs, &other.incs);
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.libs.is_empty() && self.incs.is_empty()
    }
}

fn extend_unique<T: PartialEq + Clone>(into: &mut Vec<T>, from: &[T]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// Turns dependency tokens into compiler/linker contributions by loading
/// their provider plugins. Each distinct token is resolved at most once.
pub struct DependencyResolver<'l> {
    root: PathBuf,
    loader: &'l PluginLoader,
    resolved: Mutex<HashMap<DependencyToken, Contribution>>,
}

impl<'l> DependencyResolver<'l> {
    pub fn new(root: impl Into<PathBuf>, loader: &'l PluginLoader) -> Self {
        Self {
            root: root.into(),
            loader,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves one token, installing the dependency if its provider says it
    /// is missing.
    ///
    /// Resolution is serialized: providers are free to touch shared state
    /// (download caches, package managers) without their own locking.
    pub fn resolve(&self, token: &str) -> Result<Contribution> {
        let token = DependencyToken::parse(token)?;

        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(contribution) = resolved.get(&token) {
            return Ok(contribution.clone());
        }

        let plugin = token.plugin_path(&self.root);
        let instance = self.loader.load::<RawProvider>(&plugin, &[])?;
        if !FfiProvider::has_vtable(&instance) {
            self.loader.destroy(instance)?;
            return Err(BuildError::LibraryLoadFailed {
                library: plugin,
                reason: "provider has no function table".to_string(),
            });
        }

        let mut provider = FfiProvider::new(instance);
        let collected = collect(&token, &mut provider);
        self.loader.destroy(provider.into_instance())?;
        let contribution = collected?;

        resolved.insert(token, contribution.clone());
        Ok(contribution)
    }

    /// Resolves every token and merges the results in order.
    pub fn resolve_all<'t>(&self, tokens: impl IntoIterator<Item = &'t String>) -> Result<Contribution> {
        let mut merged = Contribution::default();
        for token in tokens {
            merged.extend(&self.resolve(token)?);
        }
        Ok(merged)
    }
}

// --- Helper: Version, install if needed, then read the contribution ---
fn collect(token: &DependencyToken, provider: &mut dyn DependencyProvider) -> Result<Contribution> {
    provider.set_version(&token.version);

    if !provider.installed() {
        println!("{} Installing {}...", "📦".blue(), token.to_string().bold());
        provider
            .install()
            .map_err(|reason| BuildError::DependencyInstallFailed {
                token: token.to_string(),
                reason,
            })?;
        if !provider.installed() {
            return Err(BuildError::DependencyInstallFailed {
                token: token.to_string(),
                reason: "provider still reports the dependency as missing".to_string(),
            });
        }
        println!("   {} Installed {}", "✓".green(), token);
    }

    Ok(Contribution {
        flags: provider.flags(),
        libs: provider.libs(),
        incs: provider.incs().into_iter().map(PathBuf::from).collect(),
    })
}
