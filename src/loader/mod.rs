//! One-time native library loading and initialization
//!
//! A [`LibraryLoader`] moves through three states, never backwards:
//! 1. `Unloaded`: nothing mapped yet
//! 2. `Loaded`: the libraries are mapped but native code is not registered
//! 3. `Initialized`: native code is registered and its version verified
//!
//! Every transition happens under one lock, so concurrent callers see the
//! load and the initialization run exactly once. [`LibraryLoader::is_initialized`]
//! is lock-free and safe to poll from any thread.

mod executor;
mod extract;
mod linker;
mod native;
mod path;
mod strategy;

pub use executor::{LoadExecutor, UBSAN_OPTIONS, set_env_for_native};
pub use extract::{ExtractedLibraryRecord, ExtractionCache, ExtractionStats, LIBRARY_DIR, SweepReport};
pub use linker::{CustomLinker, DlopenLinker, LinkError, LoadedLibraries, SystemLinker};
pub use native::{NativeBridge, NativeLibraryPreloader, PreloaderSlot, SymbolBridge, symbols};
pub use path::{
    CRAZY_PREFIX, CpuFamily, LibraryDescriptor, Packaging, is_process_64bit,
    make_library_path_in_zip_file, map_library_name,
};
pub use strategy::LoadStrategy;

#[cfg(test)]
pub use linker::{MockCustomLinker, MockSystemLinker};
#[cfg(test)]
pub use native::MockNativeBridge;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info};
use parking_lot::Mutex;

use crate::config::{LoaderConfig, MemorySettings, SettingsStore, keys};
use crate::metrics::{LoadStatusRecorder, LogMetricsSink, MetricsSink};
use crate::process::{
    ApplicationContext, ApplicationInfo, CommandLine, ProcessType, TaskRunner, ThreadTaskRunner,
    switches,
};
use crate::utils::{InitError, Result};

/// Histogram for the browser's library load time
pub const BROWSER_LOAD_TIME_HISTOGRAM: &str = "ChromiumAndroidLinker.BrowserLoadTime";

/// Loader lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadState {
    Unloaded,
    Loaded,
    Initialized,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loaded => "loaded",
            LoadState::Initialized => "initialized",
        };
        f.write_str(name)
    }
}

/// Everything guarded by the loader lock
struct LoaderInner {
    state: LoadState,
    executor: LoadExecutor,
    preloader: PreloaderSlot,
    command_line_switched: bool,
    process_type: Option<ProcessType>,
    loaded_context: Option<ApplicationInfo>,
    load_time: Option<Duration>,
}

/// Builder for [`LibraryLoader`]
pub struct LibraryLoaderBuilder {
    config: LoaderConfig,
    context: Arc<dyn ApplicationContext>,
    custom_linker: Option<Box<dyn CustomLinker>>,
    system_linker: Option<Box<dyn SystemLinker>>,
    bridge: Option<Arc<dyn NativeBridge>>,
    settings: Option<Arc<dyn SettingsStore>>,
    task_runner: Option<Arc<dyn TaskRunner>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    command_line: Option<Arc<CommandLine>>,
    extraction_cache: Option<Arc<ExtractionCache>>,
}

impl LibraryLoaderBuilder {
    pub fn new(config: LoaderConfig, context: Arc<dyn ApplicationContext>) -> Self {
        Self {
            config,
            context,
            custom_linker: None,
            system_linker: None,
            bridge: None,
            settings: None,
            task_runner: None,
            metrics: None,
            command_line: None,
            extraction_cache: None,
        }
    }

    pub fn custom_linker(mut self, linker: Box<dyn CustomLinker>) -> Self {
        self.custom_linker = Some(linker);
        self
    }

    pub fn system_linker(mut self, linker: Box<dyn SystemLinker>) -> Self {
        self.system_linker = Some(linker);
        self
    }

    pub fn native_bridge(mut self, bridge: Arc<dyn NativeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = Some(runner);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn command_line(mut self, command_line: Arc<CommandLine>) -> Self {
        self.command_line = Some(command_line);
        self
    }

    /// Extract into `cache` instead of the application's code cache dir
    pub fn extraction_cache(mut self, cache: Arc<ExtractionCache>) -> Self {
        self.extraction_cache = Some(cache);
        self
    }

    /// Build the loader.
    ///
    /// Missing linkers default to [`DlopenLinker`]s sharing one set of
    /// loaded libraries, and a missing bridge to a [`SymbolBridge`] over it.
    pub fn build(self) -> LibraryLoader {
        let loaded = LoadedLibraries::new();
        let custom_linker = self
            .custom_linker
            .unwrap_or_else(|| Box::new(DlopenLinker::new().with_loaded(loaded.clone())));
        let system_linker = self
            .system_linker
            .unwrap_or_else(|| Box::new(DlopenLinker::new().with_loaded(loaded.clone())));
        let bridge = self
            .bridge
            .unwrap_or_else(|| Arc::new(SymbolBridge::new(loaded)));

        let recorder = Arc::new(LoadStatusRecorder::new());
        let mut executor = LoadExecutor::new(
            self.config.clone(),
            custom_linker,
            system_linker,
            recorder.clone(),
        );
        if let Some(cache) = self.extraction_cache {
            executor = executor.with_extraction_cache(cache);
        }

        LibraryLoader {
            initialized: AtomicBool::new(false),
            loaded_by_zygote: AtomicBool::new(false),
            inner: Mutex::new(LoaderInner {
                state: LoadState::Unloaded,
                executor,
                preloader: PreloaderSlot::new(),
                command_line_switched: false,
                process_type: None,
                loaded_context: None,
                load_time: None,
            }),
            config: self.config,
            context: self.context,
            bridge,
            settings: self.settings.unwrap_or_else(|| Arc::new(MemorySettings::new())),
            task_runner: self
                .task_runner
                .unwrap_or_else(|| Arc::new(ThreadTaskRunner::default())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(LogMetricsSink)),
            command_line: self.command_line.unwrap_or_default(),
            recorder,
        }
    }
}

/// Loads and initializes the native libraries of one process
pub struct LibraryLoader {
    // Written last during initialization, with Release ordering.
    initialized: AtomicBool,
    loaded_by_zygote: AtomicBool,
    inner: Mutex<LoaderInner>,
    config: LoaderConfig,
    context: Arc<dyn ApplicationContext>,
    bridge: Arc<dyn NativeBridge>,
    settings: Arc<dyn SettingsStore>,
    task_runner: Arc<dyn TaskRunner>,
    metrics: Arc<dyn MetricsSink>,
    command_line: Arc<CommandLine>,
    recorder: Arc<LoadStatusRecorder>,
}

impl LibraryLoader {
    pub fn builder(config: LoaderConfig, context: Arc<dyn ApplicationContext>) -> LibraryLoaderBuilder {
        LibraryLoaderBuilder::new(config, context)
    }

    /// Load and initialize for `process_type`, unless already initialized
    pub fn ensure_initialized(&self, process_type: ProcessType) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == LoadState::Initialized {
            return Ok(());
        }
        let info = self.context.application_info();
        self.load_already_locked(&mut inner, &info, false)?;
        self.initialize_already_locked(&mut inner, process_type)
    }

    /// Load without initializing, using the application context
    pub fn load_now(&self) -> Result<()> {
        let info = self.context.application_info();
        self.load_now_with_context(&info)
    }

    /// Load without initializing, using `info` instead of the application context.
    ///
    /// # Panics
    /// When already loaded from a different context.
    pub fn load_now_with_context(&self, info: &ApplicationInfo) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state >= LoadState::Loaded {
            assert!(
                inner.loaded_context.as_ref() == Some(info),
                "Attempt to load again from alternate context."
            );
            return Ok(());
        }
        self.load_already_locked(&mut inner, info, false)
    }

    /// Load in a zygote process, always through the system linker.
    ///
    /// # Panics
    /// When anything was loaded before.
    pub fn load_now_in_zygote(&self, info: &ApplicationInfo) -> Result<()> {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, LoadState::Unloaded, "zygote load after the library was loaded");
        self.load_already_locked(&mut inner, info, true)?;
        self.loaded_by_zygote.store(true, Ordering::Release);
        Ok(())
    }

    /// Initialize an already loaded library for `process_type`.
    ///
    /// A second call for the same role is a no-op; a different role fails.
    ///
    /// # Panics
    /// When nothing is loaded yet.
    pub fn initialize(&self, process_type: ProcessType) -> Result<()> {
        let mut inner = self.inner.lock();
        self.initialize_already_locked(&mut inner, process_type)
    }

    /// Install the hook run before the system linker loads anything.
    ///
    /// # Panics
    /// When a preloader is already set or the library is already loaded.
    pub fn set_native_library_preloader(&self, preloader: Box<dyn NativeLibraryPreloader>) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            LoadState::Unloaded,
            "native library preloader set after the library was loaded"
        );
        inner.preloader.set(preloader);
    }

    /// Run the preloader ahead of the load, using the application context
    pub fn preload_now(&self) {
        let info = self.context.application_info();
        self.preload_now_with_context(&info);
    }

    /// Run the preloader ahead of the load.
    ///
    /// Does nothing with the custom linker, which maps libraries itself.
    pub fn preload_now_with_context(&self, info: &ApplicationInfo) {
        let mut inner = self.inner.lock();
        if self.config.use_chromium_linker() {
            return;
        }
        inner.preloader.run_once(info);
    }

    /// Whether initialization completed. Lock-free.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().state >= LoadState::Loaded
    }

    pub fn is_loaded_by_zygote(&self) -> bool {
        self.loaded_by_zygote.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LoadState {
        self.inner.lock().state
    }

    /// Role the library was initialized for
    pub fn process_type(&self) -> Option<ProcessType> {
        self.inner.lock().process_type
    }

    /// Hand the command line to native without a full initialization.
    ///
    /// # Panics
    /// When nothing is loaded yet.
    pub fn switch_command_line_for_webview(&self) {
        let mut inner = self.inner.lock();
        self.ensure_command_line_switched_already_locked(&mut inner);
    }

    /// Report the browser's load time once startup finished
    pub fn on_browser_native_initialization_complete(&self) {
        if !self.config.use_chromium_linker() {
            return;
        }
        if let Some(load_time) = self.library_load_time() {
            self.metrics.record_times(BROWSER_LOAD_TIME_HISTOGRAM, load_time);
        }
    }

    /// Pass a child process's load time to native for reporting
    pub fn register_renderer_process_histogram(&self) {
        if !self.config.use_chromium_linker() {
            return;
        }
        if let Some(load_time) = self.library_load_time() {
            self.bridge.record_renderer_library_load_time(load_time);
        }
    }

    /// Time the load took, once loaded
    pub fn library_load_time(&self) -> Option<Duration> {
        self.inner.lock().load_time
    }

    /// Persist whether the reached-code profiler runs on the next browser start
    pub fn set_reached_code_profiler_enabled_on_next_runs(settings: &dyn SettingsStore, enabled: bool) {
        settings.set_bool(keys::REACHED_CODE_PROFILER_ENABLED, enabled);
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn command_line(&self) -> &Arc<CommandLine> {
        &self.command_line
    }

    pub fn recorder(&self) -> &LoadStatusRecorder {
        &self.recorder
    }

    fn load_already_locked(
        &self,
        inner: &mut LoaderInner,
        info: &ApplicationInfo,
        in_zygote: bool,
    ) -> Result<()> {
        if inner.state >= LoadState::Loaded {
            return Ok(());
        }
        assert!(!self.is_initialized(), "initialized before loaded");

        let result = LoadStrategy::select(&self.config, in_zygote)
            .and_then(|strategy| inner.executor.load(info, &strategy, &mut inner.preloader));
        let load_time = result.inspect_err(|e| {
            error!(target: "LibraryLoader", "Unable to load library: {e}");
        })?;

        inner.load_time = Some(load_time);
        inner.loaded_context = Some(info.clone());
        inner.state = LoadState::Loaded;
        Ok(())
    }

    fn initialize_already_locked(&self, inner: &mut LoaderInner, process_type: ProcessType) -> Result<()> {
        assert!(
            inner.state >= LoadState::Loaded,
            "initialize() called before the library was loaded"
        );
        // The role is fixed by the first attempt, even a failed one.
        if let Some(current) = inner.process_type.filter(|current| *current != process_type) {
            return Err(InitError::ProcessTypeMismatch {
                current,
                requested: process_type,
            }
            .into());
        }
        if inner.state == LoadState::Initialized {
            return Ok(());
        }

        inner.process_type = Some(process_type);
        self.recorder.set_process_type(process_type, self.metrics.as_ref());

        if process_type.is_browser()
            && self
                .settings
                .get_bool(keys::REACHED_CODE_PROFILER_ENABLED, false)
        {
            self.command_line
                .append_switch(switches::ENABLE_REACHED_CODE_PROFILER);
        }

        self.ensure_command_line_switched_already_locked(inner);

        if !self.bridge.library_loaded(process_type) {
            error!(target: "LibraryLoader", "error calling library_loaded");
            return Err(InitError::FailedToRegister.into());
        }

        let actual = self.bridge.version_number();
        info!(
            target: "LibraryLoader",
            "Loaded native library version number \"{actual}\", expected \"{}\"",
            self.config.version_number
        );
        if actual != self.config.version_number {
            return Err(InitError::WrongVersion {
                expected: self.config.version_number.clone(),
                actual,
            }
            .into());
        }

        if process_type == ProcessType::Browser
            && !self.config.is_in_zip_file()
            && self.config.platform_requires_native_fallback_extraction
        {
            let info = inner
                .loaded_context
                .clone()
                .unwrap_or_else(|| self.context.application_info());
            let cache = inner.executor.extraction_cache(&info);
            self.task_runner.post_background_task(Box::new(move || {
                cache.sweep_obsolete();
            }));
        }

        inner.state = LoadState::Initialized;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_command_line_switched_already_locked(&self, inner: &mut LoaderInner) {
        assert!(
            inner.state >= LoadState::Loaded,
            "command line switched before the library was loaded"
        );
        if inner.command_line_switched {
            return;
        }
        self.command_line.enable_native_proxy(self.bridge.as_ref());
        inner.command_line_switched = true;
    }
}

impl fmt::Debug for LibraryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LibraryLoader")
            .field("state", &inner.state)
            .field("process_type", &inner.process_type)
            .field("loaded_by_zygote", &self.is_loaded_by_zygote())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
