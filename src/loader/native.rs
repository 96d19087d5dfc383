//! Calls into freshly loaded native code
//!
//! Everything here is only valid after a successful load.

use std::ffi::{CStr, CString, c_char, c_int};
use std::time::Duration;

use log::{debug, warn};

use super::linker::LoadedLibraries;
use crate::process::{ApplicationInfo, ProcessType};

/// Native side of the loader
#[cfg_attr(test, mockall::automock)]
pub trait NativeBridge: Send + Sync {
    /// Register everything native needs; `false` means the process is unusable
    fn library_loaded(&self, process_type: ProcessType) -> bool;

    /// Version baked into the loaded library
    fn version_number(&self) -> String;

    /// Hand the process command line over to native
    fn enable_native_command_line(&self, argv: &[String]);

    /// Report the library load time measured in a child process
    fn record_renderer_library_load_time(&self, load_time: Duration);
}

/// Symbol names exported by the native library
pub mod symbols {
    pub const LIBRARY_LOADED: &[u8] = b"library_loaded\0";
    pub const GET_VERSION_NUMBER: &[u8] = b"get_version_number\0";
    pub const INIT_COMMAND_LINE: &[u8] = b"init_command_line\0";
    pub const RECORD_RENDERER_LOAD_TIME: &[u8] = b"record_renderer_library_load_time\0";
}

type LibraryLoadedFn = unsafe extern "C" fn(c_int) -> bool;
type GetVersionNumberFn = unsafe extern "C" fn() -> *const c_char;
type InitCommandLineFn = unsafe extern "C" fn(c_int, *const *const c_char);
type RecordLoadTimeFn = unsafe extern "C" fn(i64);

/// [`NativeBridge`] over C symbols exported by the loaded libraries.
///
/// A missing symbol yields the failing answer: `false`, an empty version,
/// or a skipped call.
#[derive(Debug, Clone)]
pub struct SymbolBridge {
    libraries: LoadedLibraries,
}

impl SymbolBridge {
    pub fn new(libraries: LoadedLibraries) -> Self {
        Self { libraries }
    }
}

impl NativeBridge for SymbolBridge {
    fn library_loaded(&self, process_type: ProcessType) -> bool {
        // SAFETY: the symbol type matches the exported C signature.
        let result = unsafe {
            self.libraries
                .with_symbol::<LibraryLoadedFn, _>(symbols::LIBRARY_LOADED, |f| {
                    (*f)(process_type.as_raw())
                })
        };
        result.unwrap_or_else(|| {
            warn!(target: "LibraryLoader", "library_loaded is not exported");
            false
        })
    }

    fn version_number(&self) -> String {
        // SAFETY: the symbol returns a NUL-terminated static string or null.
        let version = unsafe {
            self.libraries
                .with_symbol::<GetVersionNumberFn, _>(symbols::GET_VERSION_NUMBER, |f| {
                    let ptr = (*f)();
                    if ptr.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(ptr).to_string_lossy().into_owned()
                    }
                })
        };
        version.unwrap_or_default()
    }

    fn enable_native_command_line(&self, argv: &[String]) {
        let owned = native_argv(argv);
        let ptrs: Vec<*const c_char> = owned.iter().map(|arg| arg.as_ptr()).collect();
        // SAFETY: `owned` outlives the call; argc matches the pointer array.
        let called = unsafe {
            self.libraries
                .with_symbol::<InitCommandLineFn, _>(symbols::INIT_COMMAND_LINE, |f| {
                    (*f)(ptrs.len() as c_int, ptrs.as_ptr())
                })
        };
        if called.is_none() {
            debug!(target: "LibraryLoader", "init_command_line is not exported, skipping");
        }
    }

    fn record_renderer_library_load_time(&self, load_time: Duration) {
        let millis = i64::try_from(load_time.as_millis()).unwrap_or(i64::MAX);
        // SAFETY: the symbol type matches the exported C signature.
        let called = unsafe {
            self.libraries
                .with_symbol::<RecordLoadTimeFn, _>(symbols::RECORD_RENDERER_LOAD_TIME, |f| (*f)(millis))
        };
        if called.is_none() {
            debug!(target: "LibraryLoader", "record_renderer_library_load_time is not exported");
        }
    }
}

/// C strings for `argv`; arguments containing a NUL byte cannot cross and are dropped
fn native_argv(argv: &[String]) -> Vec<CString> {
    argv.iter()
        .filter_map(|arg| match CString::new(arg.as_str()) {
            Ok(arg) => Some(arg),
            Err(_) => {
                warn!(target: "LibraryLoader", "Dropping switch with NUL byte: {arg:?}");
                None
            }
        })
        .collect()
}

/// Hook run once before the system linker loads anything, e.g. to reserve
/// address space or warm the page cache.
pub trait NativeLibraryPreloader: Send {
    fn load_library(&mut self, info: &ApplicationInfo);
}

impl<F> NativeLibraryPreloader for F
where
    F: FnMut(&ApplicationInfo) + Send,
{
    fn load_library(&mut self, info: &ApplicationInfo) {
        (self)(info)
    }
}

/// Holds the preloader and remembers whether it already ran
#[derive(Default)]
pub struct PreloaderSlot {
    preloader: Option<Box<dyn NativeLibraryPreloader>>,
    called: bool,
}

impl PreloaderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.preloader.is_some()
    }

    pub fn was_called(&self) -> bool {
        self.called
    }

    /// Install the preloader; it may only be set once
    pub fn set(&mut self, preloader: Box<dyn NativeLibraryPreloader>) {
        assert!(self.preloader.is_none(), "native library preloader already set");
        self.preloader = Some(preloader);
    }

    /// Run the preloader unless it already ran. Returns whether it ran now.
    pub fn run_once(&mut self, info: &ApplicationInfo) -> bool {
        match self.preloader.as_mut() {
            Some(preloader) if !self.called => {
                preloader.load_library(info);
                self.called = true;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for PreloaderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloaderSlot")
            .field("set", &self.is_set())
            .field("called", &self.called)
            .finish()
    }
}
