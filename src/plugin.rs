//! Dynamic plugin loader.
//!
//! Plugins are C/C++ sources that incc itself builds as shared libraries.
//! Before a library is opened for the first time, the loader re-invokes the
//! driver with `--shared` so the library is rebuilt if its sources changed.
//! Each library exports two C entry points:
//!
//! - `incc_plugin_create(argc, argv) -> void*`
//! - `incc_plugin_destroy(void*)`
//!
//! Instances are tracked by address together with their destroy function;
//! dropping the loader destroys whatever is still alive and then closes the
//! libraries.

use crate::build::utils::normalize;
use crate::config::{BuildConfig, TargetKind};
use crate::error::{BuildError, Result};
use crate::exec::{CommandRunner, display_command};
use colored::*;
use std::collections::HashMap;
use std::ffi::{CString, c_char, c_void};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const CONSTRUCT_SYMBOL: &str = "incc_plugin_create";
pub const DESTROY_SYMBOL: &str = "incc_plugin_destroy";

pub type ConstructFn = unsafe extern "C" fn(argc: usize, argv: *const *const c_char) -> *mut c_void;
pub type DestroyFn = unsafe extern "C" fn(instance: *mut c_void);

/// An opened shared library. Dropping it closes the handle.
pub trait DynamicLibrary: Send {
    fn construct_fn(&self, symbol: &str) -> Option<ConstructFn>;
    fn destroy_fn(&self, symbol: &str) -> Option<DestroyFn>;
}

pub trait LibraryOpener: Send + Sync {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String>;
}

/// Opens libraries with the platform loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

struct NativeLibrary(libloading::Library);

impl LibraryOpener for NativeOpener {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String> {
        // Safety: Loading untrusted code - plugins run with the driver's privileges
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(NativeLibrary(library)))
    }
}

impl DynamicLibrary for NativeLibrary {
    fn construct_fn(&self, symbol: &str) -> Option<ConstructFn> {
        // Safety: the symbol type is fixed by the plugin ABI
        unsafe { self.0.get::<ConstructFn>(symbol.as_bytes()) }
            .ok()
            .map(|sym| *sym)
    }

    fn destroy_fn(&self, symbol: &str) -> Option<DestroyFn> {
        unsafe { self.0.get::<DestroyFn>(symbol.as_bytes()) }
            .ok()
            .map(|sym| *sym)
    }
}

/// A live object created by a plugin's constructor.
///
/// The instance borrows the loader, so it can never outlive the library
/// that holds its code. Hand it back to [`PluginLoader::destroy`].
pub struct PluginInstance<'l, T> {
    ptr: NonNull<T>,
    _loader: PhantomData<&'l PluginLoader>,
}

// Safety: the loader serializes creation and destruction; callers are responsible
// for the thread-safety of the plugin object itself.
unsafe impl<T> Send for PluginInstance<'_, T> {}

impl<T> PluginInstance<'_, T> {
    pub fn get(&self) -> &T {
        // Safety: non-null and alive until handed back to the loader
        unsafe { self.ptr.as_ref() }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

struct LoadedLibrary {
    construct: ConstructFn,
    destroy: DestroyFn,
    // Keeps the code mapped while the function pointers above are in use.
    _library: Box<dyn DynamicLibrary>,
}

struct TrackedInstance {
    destroy: DestroyFn,
    library: PathBuf,
}

#[derive(Default)]
struct LoaderState {
    libraries: HashMap<PathBuf, LoadedLibrary>,
    instances: HashMap<usize, TrackedInstance>,
}

pub struct PluginLoader {
    config: BuildConfig,
    driver: PathBuf,
    runner: Arc<dyn CommandRunner>,
    opener: Box<dyn LibraryOpener>,
    state: Mutex<LoaderState>,
    opens: AtomicUsize,
}

impl PluginLoader {
    /// A loader that rebuilds plugins with the running executable under the
    /// same build root, base and modes as `config`.
    pub fn new(config: &BuildConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let driver = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("incc"));
        Self {
            config: config.clone(),
            driver,
            runner,
            opener: Box::new(NativeOpener),
            state: Mutex::new(LoaderState::default()),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn with_driver(mut self, driver: impl Into<PathBuf>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_opener(mut self, opener: Box<dyn LibraryOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// How many times a library was actually opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn live_instances(&self) -> usize {
        self.lock().instances.len()
    }

    /// Locates the plugin source for `path`, makes sure its shared library is
    /// built and open, and constructs one instance with `args`.
    ///
    /// The library is opened once per path; later loads reuse the handle.
    pub fn load<T>(&self, path: &Path, args: &[&str]) -> Result<PluginInstance<'_, T>> {
        let source = find_source(path)?;
        let library_path = self.config.output_path(&source, TargetKind::Shared);

        let mut state = self.lock();
        if !state.libraries.contains_key(&library_path) {
            let loaded = self.open_library(&source, &library_path)?;
            state.libraries.insert(library_path.clone(), loaded);
        }
        let Some(loaded) = state.libraries.get(&library_path) else {
            return Err(BuildError::LibraryLoadFailed {
                library: library_path,
                reason: "library handle disappeared".to_string(),
            });
        };

        let owned: Vec<CString> = args
            .iter()
            .map(|arg| CString::new(arg.replace('\0', "")).unwrap_or_default())
            .collect();
        let argv: Vec<*const c_char> = owned.iter().map(|arg| arg.as_ptr()).collect();

        // Safety: constructor resolved from the plugin ABI; argv outlives the call
        let raw = unsafe { (loaded.construct)(argv.len(), argv.as_ptr()) };
        let destroy = loaded.destroy;

        let Some(ptr) = NonNull::new(raw.cast::<T>()) else {
            return Err(BuildError::LibraryLoadFailed {
                library: library_path,
                reason: format!("`{}` returned null", CONSTRUCT_SYMBOL),
            });
        };

        state.instances.insert(
            ptr.as_ptr() as usize,
            TrackedInstance {
                destroy,
                library: library_path,
            },
        );

        Ok(PluginInstance {
            ptr,
            _loader: PhantomData,
        })
    }

    /// Destroys an instance created by this loader.
    pub fn destroy<T>(&self, instance: PluginInstance<'_, T>) -> Result<()> {
        let key = instance.as_ptr() as usize;
        let tracked = self
            .lock()
            .instances
            .remove(&key)
            .ok_or(BuildError::UnmanagedInstance)?;

        // Safety: the instance was produced by the matching constructor and is
        // no longer tracked, so it cannot be destroyed twice
        unsafe { (tracked.destroy)(instance.as_ptr().cast()) };
        Ok(())
    }

    // --- Helper: Rebuild, open and resolve both entry points ---
    fn open_library(&self, source: &Path, library_path: &Path) -> Result<LoadedLibrary> {
        self.rebuild(source, library_path)?;

        let library = self
            .opener
            .open(library_path)
            .map_err(|reason| BuildError::LibraryLoadFailed {
                library: library_path.to_path_buf(),
                reason,
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let construct = library.construct_fn(CONSTRUCT_SYMBOL);
        let destroy = library.destroy_fn(DESTROY_SYMBOL);
        match (construct, destroy) {
            (Some(construct), Some(destroy)) => Ok(LoadedLibrary {
                construct,
                destroy,
                _library: library,
            }),
            (construct, _) => {
                drop(library);
                let symbol = if construct.is_none() {
                    CONSTRUCT_SYMBOL
                } else {
                    DESTROY_SYMBOL
                };
                Err(BuildError::SymbolResolutionFailed {
                    library: library_path.to_path_buf(),
                    symbol: symbol.to_string(),
                })
            }
        }
    }

    fn rebuild(&self, source: &Path, library_path: &Path) -> Result<()> {
        let mut command = vec![
            self.driver.to_string_lossy().to_string(),
            "--shared".to_string(),
            "--base".to_string(),
            self.config.base.to_string_lossy().to_string(),
            "--build-dir".to_string(),
            self.config.build_root.to_string_lossy().to_string(),
        ];
        if !self.config.modes.is_empty() {
            command.push("--mode".to_string());
            command.push(self.config.modes.join(","));
        }
        command.push(source.to_string_lossy().to_string());

        if self.config.verbose {
            println!("   {} {}", "🔌".blue(), display_command(&command).dimmed());
        }

        let output = self
            .runner
            .execute(&command)
            .map_err(|e| BuildError::LibraryBuildFailed {
                library: library_path.to_path_buf(),
                stderr: e.to_string(),
            })?;
        if !output.success() {
            return Err(BuildError::LibraryBuildFailed {
                library: library_path.to_path_buf(),
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for (address, tracked) in state.instances.drain() {
            if self.config.verbose {
                println!(
                    "   {} releasing leaked instance from {}",
                    "!".yellow(),
                    tracked.library.display()
                );
            }
            // Safety: still tracked, so not yet destroyed; its library is still open
            unsafe { (tracked.destroy)(address as *mut c_void) };
        }
        state.libraries.clear();
    }
}

/// The plugin source for `path`: the path itself, or the path with a source extension.
pub fn find_source(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(normalize(path));
    }
    crate::build::utils::SOURCE_EXTENSIONS
        .iter()
        .map(|ext| crate::config::with_suffix(path, &format!(".{}", ext)))
        .find(|candidate| candidate.is_file())
        .map(|found| normalize(&found))
        .ok_or_else(|| BuildError::SourceNotFound {
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process stand-ins for the platform loader and the driver subprocess.

    use super::*;
    use crate::deps::provider::DependencyProvider;
    use crate::exec::CommandOutput;
    use std::cell::Cell;
    use std::io;

    thread_local! {
        static DESTROYED: Cell<usize> = const { Cell::new(0) };
    }

    pub fn destroyed() -> usize {
        DESTROYED.with(Cell::get)
    }

    /// Provider whose behaviour is driven by the requested version:
    /// `broken` fails to install, `ghost` installs but never reports installed.
    #[derive(Default)]
    pub struct FakeProvider {
        version: String,
        installed: bool,
    }

    impl FakeProvider {
        pub fn new(_args: Vec<String>) -> Self {
            Self::default()
        }
    }

    impl DependencyProvider for FakeProvider {
        fn set_version(&mut self, version: &str) {
            self.version = version.to_string();
        }
        fn install(&mut self) -> std::result::Result<(), String> {
            match self.version.as_str() {
                "broken" => Err("download failed".to_string()),
                "ghost" => Ok(()),
                _ => {
                    self.installed = true;
                    Ok(())
                }
            }
        }
        fn installed(&self) -> bool {
            self.installed
        }
        fn flags(&self) -> Vec<String> {
            vec![format!("-DFAKE_VERSION_{}", self.version.replace('.', "_"))]
        }
        fn libs(&self) -> Vec<String> {
            vec!["fake".to_string()]
        }
        fn incs(&self) -> Vec<String> {
            vec!["/opt/fake/include".to_string()]
        }
    }

    crate::export_dependency_provider!(FakeProvider::new);

    unsafe extern "C" fn counting_destroy(instance: *mut c_void) {
        DESTROYED.with(|c| c.set(c.get() + 1));
        unsafe { incc_plugin_destroy(instance) }
    }

    /// Library whose exports depend on the file name it was opened from:
    /// `nocreate`/`nodestroy` lack a symbol, anything else exports both.
    pub struct FakeLibrary {
        name: String,
    }

    impl DynamicLibrary for FakeLibrary {
        fn construct_fn(&self, _symbol: &str) -> Option<ConstructFn> {
            (!self.name.contains("nocreate")).then_some(incc_plugin_create as ConstructFn)
        }
        fn destroy_fn(&self, _symbol: &str) -> Option<DestroyFn> {
            (!self.name.contains("nodestroy")).then_some(counting_destroy as DestroyFn)
        }
    }

    /// Opens every path except ones containing `unloadable`.
    pub struct FakeOpener;

    impl LibraryOpener for FakeOpener {
        fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String> {
            let name = path.to_string_lossy().to_string();
            if name.contains("unloadable") {
                return Err("invalid ELF header".to_string());
            }
            Ok(Box::new(FakeLibrary { name }))
        }
    }

    /// Records driver invocations; fails any whose source path contains `nobuild`.
    #[derive(Default)]
    pub struct FakeDriver {
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl CommandRunner for FakeDriver {
        fn execute(&self, command: &[String]) -> io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(command.to_vec());
            let failing = command.last().is_some_and(|src| src.contains("nobuild"));
            Ok(CommandOutput {
                code: if failing { 1 } else { 0 },
                stdout: String::new(),
                stderr: if failing {
                    "error: expected ';'".to_string()
                } else {
                    String::new()
                },
            })
        }
    }

    pub fn fake_loader(config: &BuildConfig) -> (PluginLoader, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::default());
        let loader = PluginLoader::new(config, driver.clone())
            .with_driver("/usr/bin/incc")
            .with_opener(Box::new(FakeOpener));
        (loader, driver)
    }
}
