//! External dependencies declared in sources.
//!
//! A source opts into a dependency with a comment directive:
//!
//! ```cpp
//! // @depends fmtlib/fmt:10.2.1, nlohmann/json
//! ```
//!
//! Each token names a provider plugin under the dependencies root. The
//! provider installs the library on demand and reports the compiler flags,
//! link libraries and include directories it contributes.
//!
//! - **Tokens**: `creator/library:version` parsing and plugin path layout
//! - **Providers**: the C ABI between incc and provider libraries
//! - **Resolver**: token to contribution, once per token per session

pub mod provider;
mod resolver;
mod token;

pub use provider::{DependencyProvider, FfiProvider, ProviderVTable, RawProvider};
pub use resolver::{Contribution, DependencyResolver};
pub use token::{DEFAULT_VERSION, DependencyToken};
