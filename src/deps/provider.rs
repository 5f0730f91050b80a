//! Dependency provider ABI.
//!
//! A provider is a shared library exporting `incc_plugin_create` and
//! `incc_plugin_destroy` (see `include/incc/dependency.h`). The constructor
//! returns a [`RawProvider`]: an opaque state pointer plus a table of C
//! functions. List-valued getters return newline-separated strings owned by
//! the provider and valid until the next call on the same instance.

use crate::plugin::PluginInstance;
use std::ffi::{CStr, CString, c_char, c_int, c_void};

pub trait DependencyProvider {
    fn set_version(&mut self, version: &str);
    fn install(&mut self) -> Result<(), String>;
    fn installed(&self) -> bool;
    fn flags(&self) -> Vec<String>;
    fn libs(&self) -> Vec<String>;
    fn incs(&self) -> Vec<String>;
}

#[repr(C)]
pub struct ProviderVTable {
    pub set_version: unsafe extern "C" fn(state: *mut c_void, version: *const c_char),
    /// 0 on success.
    pub install: unsafe extern "C" fn(state: *mut c_void) -> c_int,
    pub installed: unsafe extern "C" fn(state: *mut c_void) -> c_int,
    pub flags: unsafe extern "C" fn(state: *mut c_void) -> *const c_char,
    pub libs: unsafe extern "C" fn(state: *mut c_void) -> *const c_char,
    pub incs: unsafe extern "C" fn(state: *mut c_void) -> *const c_char,
    /// Reason for the last failed install; may return null.
    pub last_error: unsafe extern "C" fn(state: *mut c_void) -> *const c_char,
}

#[repr(C)]
pub struct RawProvider {
    pub state: *mut c_void,
    pub vtable: *const ProviderVTable,
}

// --- Hosting: expose a Rust provider through the C ABI ---

struct Hosted {
    provider: Box<dyn DependencyProvider>,
    scratch: CString,
    error: CString,
}

static HOSTED_VTABLE: ProviderVTable = ProviderVTable {
    set_version: hosted_set_version,
    install: hosted_install,
    installed: hosted_installed,
    flags: hosted_flags,
    libs: hosted_libs,
    incs: hosted_incs,
    last_error: hosted_last_error,
};

impl RawProvider {
    /// Boxes `provider` behind the C ABI. Release with [`RawProvider::destroy_hosted`].
    pub fn hosted(provider: Box<dyn DependencyProvider>) -> *mut c_void {
        let state = Box::into_raw(Box::new(Hosted {
            provider,
            scratch: CString::default(),
            error: CString::default(),
        }));
        Box::into_raw(Box::new(RawProvider {
            state: state.cast(),
            vtable: &HOSTED_VTABLE,
        }))
        .cast()
    }

    /// # Safety
    ///
    /// `instance` must come from [`RawProvider::hosted`] and not be used afterwards.
    pub unsafe fn destroy_hosted(instance: *mut c_void) {
        if instance.is_null() {
            return;
        }
        unsafe {
            let raw = Box::from_raw(instance.cast::<RawProvider>());
            drop(Box::from_raw(raw.state.cast::<Hosted>()));
        }
    }
}

/// Exports `incc_plugin_create`/`incc_plugin_destroy` for a provider written in Rust.
///
/// The argument is called with the constructor arguments and must return a
/// type implementing [`DependencyProvider`].
#[macro_export]
macro_rules! export_dependency_provider {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn incc_plugin_create(
            argc: usize,
            argv: *const *const ::std::ffi::c_char,
        ) -> *mut ::std::ffi::c_void {
            let args = unsafe { $crate::deps::provider::collect_args(argc, argv) };
            $crate::deps::provider::RawProvider::hosted(::std::boxed::Box::new(($ctor)(args)))
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn incc_plugin_destroy(instance: *mut ::std::ffi::c_void) {
            unsafe { $crate::deps::provider::RawProvider::destroy_hosted(instance) }
        }
    };
}

/// # Safety
///
/// `argv` must point to `argc` valid C strings (or be null with `argc == 0`).
pub unsafe fn collect_args(argc: usize, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() {
        return Vec::new();
    }
    (0..argc)
        .map(|i| unsafe { read_str(*argv.add(i)) })
        .collect()
}

unsafe fn hosted<'s>(state: *mut c_void) -> &'s mut Hosted {
    unsafe { &mut *state.cast::<Hosted>() }
}

unsafe extern "C" fn hosted_set_version(state: *mut c_void, version: *const c_char) {
    let version = unsafe { read_str(version) };
    unsafe { hosted(state) }.provider.set_version(&version);
}

unsafe extern "C" fn hosted_install(state: *mut c_void) -> c_int {
    let host = unsafe { hosted(state) };
    match host.provider.install() {
        Ok(()) => 0,
        Err(reason) => {
            host.error = to_c_string(&reason);
            1
        }
    }
}

unsafe extern "C" fn hosted_installed(state: *mut c_void) -> c_int {
    c_int::from(unsafe { hosted(state) }.provider.installed())
}

unsafe extern "C" fn hosted_flags(state: *mut c_void) -> *const c_char {
    let host = unsafe { hosted(state) };
    host.scratch = to_c_string(&host.provider.flags().join("\n"));
    host.scratch.as_ptr()
}

unsafe extern "C" fn hosted_libs(state: *mut c_void) -> *const c_char {
    let host = unsafe { hosted(state) };
    host.scratch = to_c_string(&host.provider.libs().join("\n"));
    host.scratch.as_ptr()
}

unsafe extern "C" fn hosted_incs(state: *mut c_void) -> *const c_char {
    let host = unsafe { hosted(state) };
    host.scratch = to_c_string(&host.provider.incs().join("\n"));
    host.scratch.as_ptr()
}

unsafe extern "C" fn hosted_last_error(state: *mut c_void) -> *const c_char {
    unsafe { hosted(state) }.error.as_ptr()
}

fn to_c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

unsafe fn read_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn split_list(text: String) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// --- Calling: drive a loaded provider through its vtable ---

/// A provider instance living in a loaded shared library.
pub struct FfiProvider<'l> {
    instance: PluginInstance<'l, RawProvider>,
}

impl<'l> FfiProvider<'l> {
    /// Wraps a loaded instance. The instance must carry a non-null vtable.
    pub fn new(instance: PluginInstance<'l, RawProvider>) -> Self {
        Self { instance }
    }

    pub fn has_vtable(instance: &PluginInstance<'l, RawProvider>) -> bool {
        !instance.get().vtable.is_null()
    }

    pub fn into_instance(self) -> PluginInstance<'l, RawProvider> {
        self.instance
    }

    fn parts(&self) -> (&ProviderVTable, *mut c_void) {
        let raw = self.instance.get();
        // Safety: checked non-null at construction; the table lives as long as the library.
        (unsafe { &*raw.vtable }, raw.state)
    }

    fn list(&self, getter: unsafe extern "C" fn(*mut c_void) -> *const c_char) -> Vec<String> {
        let (_, state) = self.parts();
        split_list(unsafe { read_str(getter(state)) })
    }
}

impl DependencyProvider for FfiProvider<'_> {
    fn set_version(&mut self, version: &str) {
        let (vtable, state) = self.parts();
        let version = to_c_string(version);
        unsafe { (vtable.set_version)(state, version.as_ptr()) }
    }

    fn install(&mut self) -> Result<(), String> {
        let (vtable, state) = self.parts();
        if unsafe { (vtable.install)(state) } == 0 {
            return Ok(());
        }
        let reason = unsafe { read_str((vtable.last_error)(state)) };
        if reason.trim().is_empty() {
            Err("provider reported failure".to_string())
        } else {
            Err(reason)
        }
    }

    fn installed(&self) -> bool {
        let (vtable, state) = self.parts();
        unsafe { (vtable.installed)(state) != 0 }
    }

    fn flags(&self) -> Vec<String> {
        self.list(self.parts().0.flags)
    }

    fn libs(&self) -> Vec<String> {
        self.list(self.parts().0.libs)
    }

    fn incs(&self) -> Vec<String> {
        self.list(self.parts().0.incs)
    }
}
