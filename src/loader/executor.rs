//! Load attempts, retries and the extraction fallback
//!
//! Custom linker:
//! 1. Load with shared relocations (fixed address).
//! 2. On failure retry once without; a second failure is fatal.
//! 3. Libraries outside the archive on platforms that need it: extract the
//!    library ourselves and run 1-2 again against the extracted copy.
//!
//! System linker: one `dlopen` per library, archive entries addressed as
//! `archive!/entry`. The first failure is fatal; there is no extraction
//! fallback on this path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::extract::ExtractionCache;
use super::linker::{CustomLinker, LinkError, SystemLinker};
use super::native::PreloaderSlot;
use super::path::LibraryDescriptor;
use super::strategy::LoadStrategy;
use crate::config::LoaderConfig;
use crate::metrics::{LoadAttempt, LoadStatusRecorder};
use crate::process::ApplicationInfo;
use crate::utils::{LoaderError, Result};

/// Value of `UBSAN_OPTIONS` for sanitizer builds
pub const UBSAN_OPTIONS: &str = "print_stacktrace=1 stack_trace_format='#%n pc %o %m' \
     handle_segv=0 handle_sigbus=0 handle_sigfpe=0";

/// Configure the sanitizer runtime; must run before any library is loaded.
///
/// Meant for process bootstrap, before the embedder starts other threads.
pub fn set_env_for_native(config: &LoaderConfig) {
    if !config.is_ubsan {
        return;
    }
    if std::env::var("UBSAN_OPTIONS").as_deref() == Ok(UBSAN_OPTIONS) {
        return;
    }
    // SAFETY: the loader lock does not cover other readers of the
    // environment. Callers load during single-threaded bootstrap; otherwise
    // this carries the same race as a plain setenv(3).
    unsafe { std::env::set_var("UBSAN_OPTIONS", UBSAN_OPTIONS) };
}

/// Performs the actual load through one of the linkers
pub struct LoadExecutor {
    config: LoaderConfig,
    custom_linker: Box<dyn CustomLinker>,
    system_linker: Box<dyn SystemLinker>,
    recorder: Arc<LoadStatusRecorder>,
    extraction_cache: Option<Arc<ExtractionCache>>,
}

impl LoadExecutor {
    pub fn new(
        config: LoaderConfig,
        custom_linker: Box<dyn CustomLinker>,
        system_linker: Box<dyn SystemLinker>,
        recorder: Arc<LoadStatusRecorder>,
    ) -> Self {
        Self {
            config,
            custom_linker,
            system_linker,
            recorder,
            extraction_cache: None,
        }
    }

    /// Use `cache` instead of the application's code cache dir
    pub fn with_extraction_cache(mut self, cache: Arc<ExtractionCache>) -> Self {
        self.extraction_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Extraction cache used for `info`
    pub fn extraction_cache(&self, info: &ApplicationInfo) -> Arc<ExtractionCache> {
        self.extraction_cache.clone().unwrap_or_else(|| {
            Arc::new(ExtractionCache::for_application(
                info,
                self.config.extracted_file_suffix.clone(),
            ))
        })
    }

    /// Load every configured library. Returns the wall-clock time spent.
    pub fn load(
        &mut self,
        info: &ApplicationInfo,
        strategy: &LoadStrategy,
        preloader: &mut PreloaderSlot,
    ) -> Result<Duration> {
        let start = Instant::now();

        match strategy {
            LoadStrategy::CustomLinker { library } => self.load_with_custom_linker(info, library)?,
            LoadStrategy::SystemLinker { libraries } => {
                self.load_with_system_linker(info, libraries, preloader)?
            }
        }

        let elapsed = start.elapsed();
        info!(
            target: "LibraryLoader",
            "Time to load native libraries: {} ms",
            elapsed.as_millis()
        );
        Ok(elapsed)
    }

    fn load_with_custom_linker(&mut self, info: &ApplicationInfo, library: &str) -> Result<()> {
        if self.config.is_in_zip_file() {
            self.custom_linker.set_apk_file_path(info.archive_path());
            info!(target: "LibraryLoader", "Loading {library} from within {}", info.archive_path().display());
        } else {
            info!(target: "LibraryLoader", "Loading {library}");
        }

        match self.load_library_with_custom_linker(library, true) {
            Ok(()) => Ok(()),
            Err(e)
                if !self.config.is_in_zip_file()
                    && self.config.platform_requires_native_fallback_extraction =>
            {
                warn!(
                    target: "LibraryLoader",
                    "Failed to load {library} ({e}), attempting fallback extraction then trying again"
                );
                let extracted = self.extracted_library_path(info, library)?;
                let extracted = extracted.to_string_lossy().into_owned();
                self.load_library_with_custom_linker(&extracted, false)
                    .map_err(|source| load_error(library, source))
            }
            Err(e) => Err(load_error(library, e)),
        }
    }

    /// One attempt with shared relocations, falling back to one without.
    fn load_library_with_custom_linker(
        &mut self,
        library: &str,
        is_first_attempt: bool,
    ) -> std::result::Result<(), LinkError> {
        let result = match self.custom_linker.load_library(library, true) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    target: "LibraryLoader",
                    "Failed to load native library with shared RELRO, retrying without: {e}"
                );
                self.recorder
                    .record_load_attempt(LoadAttempt::new(false, is_first_attempt, true));
                self.custom_linker.load_library(library, false).map(|()| false)
            }
        };

        match result {
            Ok(load_at_fixed_address) => {
                self.recorder.record_load_attempt(LoadAttempt::new(
                    true,
                    is_first_attempt,
                    load_at_fixed_address,
                ));
                Ok(())
            }
            Err(e) => {
                self.recorder
                    .record_load_attempt(LoadAttempt::new(false, is_first_attempt, false));
                Err(e)
            }
        }
    }

    fn extracted_library_path(&self, info: &ApplicationInfo, library: &str) -> Result<PathBuf> {
        let descriptor = LibraryDescriptor::resolve(library, &self.config);
        let entry = descriptor.path_in_archive(false)?;
        let cache = self.extraction_cache(info);
        Ok(cache.ensure_extracted(info.archive_path(), &entry)?)
    }

    fn load_with_system_linker(
        &mut self,
        info: &ApplicationInfo,
        libraries: &[String],
        preloader: &mut PreloaderSlot,
    ) -> Result<()> {
        set_env_for_native(&self.config);
        preloader.run_once(info);

        for library in libraries {
            if self.config.is_in_zip_file() {
                // Mapped straight out of the archive; needs a platform
                // linker that understands `archive!/entry`.
                let entry = LibraryDescriptor::resolve(library, &self.config).path_in_archive(false)?;
                let full_path = format!("{}!/{entry}", info.archive_path().display());
                info!(target: "LibraryLoader", "libraryName: {full_path}");
                self.system_linker
                    .load(&full_path)
                    .map_err(|source| load_error(library, source))?;
            } else {
                self.system_linker
                    .load_library(library)
                    .map_err(|source| load_error(library, source))?;
            }
        }
        Ok(())
    }
}

fn load_error(library: &str, source: LinkError) -> LoaderError {
    LoaderError::Load {
        library: library.to_string(),
        source,
    }
}

impl std::fmt::Debug for LoadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadExecutor")
            .field("config", &self.config)
            .field("extraction_cache", &self.extraction_cache)
            .finish_non_exhaustive()
    }
}
