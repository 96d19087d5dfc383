//! Dynamic linker seams
//!
//! Two kinds of linkers load native code:
//! - [`CustomLinker`]: shares relocated pages between processes, which
//!   requires loading at a fixed address; single library only
//! - [`SystemLinker`]: the platform's default `dlopen`, one call per library

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use log::debug;
use parking_lot::Mutex;

/// Error reported by a linker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    /// What was being loaded (name or path)
    pub library: String,
    /// The platform's message
    pub message: String,
}

impl LinkError {
    pub fn new(library: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.library, self.message)
    }
}

impl std::error::Error for LinkError {}

/// Relocation-sharing linker
#[cfg_attr(test, mockall::automock)]
pub trait CustomLinker: Send {
    /// Archive to load libraries from directly
    fn set_apk_file_path(&mut self, path: &Path);

    /// Load `library` (a name, or a path to an extracted file).
    ///
    /// With `fixed_address_permitted` the linker tries to map at the shared
    /// address so relocations can be shared across processes.
    fn load_library(&mut self, library: &str, fixed_address_permitted: bool) -> Result<(), LinkError>;
}

/// Platform default linker
#[cfg_attr(test, mockall::automock)]
pub trait SystemLinker: Send {
    /// Load by name from the library search path
    fn load_library(&mut self, name: &str) -> Result<(), LinkError>;

    /// Load by full path, `archive!/entry` included
    fn load(&mut self, path: &str) -> Result<(), LinkError>;
}

/// Libraries kept open for the lifetime of the process
#[derive(Clone, Default)]
pub struct LoadedLibraries {
    inner: Arc<Mutex<Vec<(String, Library)>>>,
}

impl LoadedLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, name: String, library: Library) {
        self.inner.lock().push((name, library));
    }

    /// Names or paths of the loaded libraries, in load order
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the first library exporting `symbol`.
    ///
    /// # Safety
    /// `T` must match the exported symbol's real type.
    pub unsafe fn with_symbol<T, R>(&self, symbol: &[u8], f: impl FnOnce(&T) -> R) -> Option<R> {
        let libraries = self.inner.lock();
        for (_, library) in libraries.iter() {
            // SAFETY: forwarded to the caller.
            if let Ok(sym) = unsafe { library.get::<T>(symbol) } {
                return Some(f(&sym));
            }
        }
        None
    }
}

impl fmt::Debug for LoadedLibraries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedLibraries")
            .field("names", &self.names())
            .finish()
    }
}

/// `dlopen`-backed linker for both roles.
///
/// There is no relocation sharing on top of plain `dlopen`, so the
/// fixed-address flag is accepted and ignored.
#[derive(Debug, Default)]
pub struct DlopenLinker {
    loaded: LoadedLibraries,
    search_dir: Option<PathBuf>,
    apk_file_path: Option<PathBuf>,
}

impl DlopenLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve bare library names in `dir` instead of the search path
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    /// Record opened libraries in `loaded`, shared with other linkers
    pub fn with_loaded(mut self, loaded: LoadedLibraries) -> Self {
        self.loaded = loaded;
        self
    }

    /// Shared handle to everything this linker opened
    pub fn loaded(&self) -> LoadedLibraries {
        self.loaded.clone()
    }

    /// Archive set through [`CustomLinker::set_apk_file_path`]
    pub fn apk_file_path(&self) -> Option<&Path> {
        self.apk_file_path.as_deref()
    }

    fn open(&self, target: impl AsRef<std::ffi::OsStr>, label: &str) -> Result<(), LinkError> {
        // SAFETY: running a library's initializers is the purpose of this
        // type; callers vouch for the libraries they configure.
        let library = unsafe { Library::new(target.as_ref()) }
            .map_err(|e| LinkError::new(label, e.to_string()))?;
        debug!(target: "LibraryLoader", "Opened {label}");
        self.loaded.push(label.to_string(), library);
        Ok(())
    }

    fn resolve_name(&self, name: &str) -> PathBuf {
        let file_name = libloading::library_filename(name);
        match &self.search_dir {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }
}

impl SystemLinker for DlopenLinker {
    fn load_library(&mut self, name: &str) -> Result<(), LinkError> {
        let target = self.resolve_name(name);
        self.open(&target, name)
    }

    fn load(&mut self, path: &str) -> Result<(), LinkError> {
        self.open(path, path)
    }
}

impl CustomLinker for DlopenLinker {
    fn set_apk_file_path(&mut self, path: &Path) {
        self.apk_file_path = Some(path.to_path_buf());
    }

    fn load_library(&mut self, library: &str, _fixed_address_permitted: bool) -> Result<(), LinkError> {
        if Path::new(library).components().count() > 1 {
            self.open(library, library)
        } else {
            let target = self.resolve_name(library);
            self.open(&target, library)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_display() {
        let err = LinkError::new("libfoo.so", "cannot open shared object file");
        assert_eq!(err.to_string(), "libfoo.so: cannot open shared object file");
    }

    #[test]
    fn test_missing_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut linker = DlopenLinker::new().with_search_dir(dir.path());
        let err = SystemLinker::load_library(&mut linker, "definitely_missing").unwrap_err();
        assert_eq!(err.library, "definitely_missing");
        assert!(linker.loaded().is_empty());
    }

    #[test]
    fn test_not_a_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libjunk.so");
        std::fs::write(&path, b"not an elf").unwrap();

        let mut linker = DlopenLinker::new();
        let err = CustomLinker::load_library(&mut linker, path.to_str().unwrap(), true).unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_apk_file_path() {
        let mut linker = DlopenLinker::new();
        linker.set_apk_file_path(Path::new("/data/app/base.apk"));
        assert_eq!(linker.apk_file_path(), Some(Path::new("/data/app/base.apk")));
    }

    #[test]
    fn test_resolve_name_in_search_dir() {
        let linker = DlopenLinker::new().with_search_dir("/opt/lib");
        let resolved = linker.resolve_name("chrome");
        assert!(resolved.starts_with("/opt/lib"));
        assert!(resolved.to_string_lossy().contains("chrome"));
    }
}
