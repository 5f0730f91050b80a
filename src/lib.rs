//! # incc - Incremental C/C++ Compiler Driver
//!
//! incc compiles C/C++ translation units only when something they depend on
//! has changed. It discovers dependencies by scanning quoted `#include`
//! directives, caches the resulting graph per file keyed by modification time,
//! precompiles reachable headers, builds implementation companions
//! (`foo.hpp` -> `foo.cpp`) alongside link targets, and resolves third-party
//! libraries declared with `// @depends creator/library:version` through
//! dynamically loaded provider plugins.
//!
//! ## Quick Start
//!
//! ```bash
//! # Build main.cpp and everything it includes
//! incc main.cpp
//!
//! # Debug build of a whole tree, then run it
//! incc -r -m debug src/ --run -- --verbose
//! ```
//!
//! ## Module Organization
//!
//! - [`build`] - Graph walker, cache, PCH coordinator, scheduler and invoker
//! - [`config`] - Configuration parsing (`incc.toml`) and derived build paths
//! - [`deps`] - Dependency tokens, the provider ABI and the resolver
//! - [`plugin`] - Self-rebuilding dynamic library loader
//! - [`error`] - Typed build errors
//! - [`exec`] - Process execution seam

/// Incremental build engine.
pub mod build;

/// Configuration file parsing (`incc.toml`).
pub mod config;

/// Dependency provider plugins.
pub mod deps;

pub mod error;

/// External command execution.
pub mod exec;

/// Dynamic library plugins rebuilt from source on load.
pub mod plugin;
