//! Integration tests for library-loader
//!
//! These tests drive the loader through its public API with in-memory
//! linkers and a fake native side.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use library_loader::config::MemorySettings;
use library_loader::loader::{
    CpuFamily, CustomLinker, ExtractionCache, LIBRARY_DIR, LinkError, NativeBridge, SystemLinker,
    is_process_64bit, make_library_path_in_zip_file,
};
use library_loader::metrics::{HistogramRecorder, load_status};
use library_loader::process::{InlineTaskRunner, StaticContext};
use library_loader::utils::{ConfigError, InitError};
use library_loader::{
    ApplicationInfo, LibraryLoader, LoadState, LoaderConfig, LoaderError, ProcessType,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use zip::write::SimpleFileOptions;

/// Linker that records every call and fails the names it is told to
#[derive(Clone, Default)]
struct FakeLinker {
    calls: Arc<Mutex<Vec<String>>>,
    loads: Arc<AtomicUsize>,
    fail_bare_names: bool,
}

impl FakeLinker {
    fn failing_bare_names() -> Self {
        Self {
            fail_bare_names: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String, target: &str) -> Result<(), LinkError> {
        self.calls.lock().push(call);
        if self.fail_bare_names && !target.contains('/') {
            return Err(LinkError::new(target, "not found"));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CustomLinker for FakeLinker {
    fn set_apk_file_path(&mut self, path: &Path) {
        self.calls.lock().push(format!("apk {}", path.display()));
    }

    fn load_library(&mut self, library: &str, fixed_address_permitted: bool) -> Result<(), LinkError> {
        self.record(format!("custom {library} {fixed_address_permitted}"), library)
    }
}

impl SystemLinker for FakeLinker {
    fn load_library(&mut self, name: &str) -> Result<(), LinkError> {
        self.record(format!("system {name}"), name)
    }

    fn load(&mut self, path: &str) -> Result<(), LinkError> {
        self.record(format!("path {path}"), path)
    }
}

/// Native side answering with a fixed version
struct FakeNative {
    version: String,
    registrations: AtomicUsize,
    command_lines: Mutex<Vec<Vec<String>>>,
    renderer_load_times: Mutex<Vec<Duration>>,
}

impl FakeNative {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            registrations: AtomicUsize::new(0),
            command_lines: Mutex::new(Vec::new()),
            renderer_load_times: Mutex::new(Vec::new()),
        }
    }
}

impl NativeBridge for FakeNative {
    fn library_loaded(&self, _process_type: ProcessType) -> bool {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn version_number(&self) -> String {
        self.version.clone()
    }

    fn enable_native_command_line(&self, argv: &[String]) {
        self.command_lines.lock().push(argv.to_vec());
    }

    fn record_renderer_library_load_time(&self, load_time: Duration) {
        self.renderer_load_times.lock().push(load_time);
    }
}

fn config(libraries: &[&str], version: &str) -> LoaderConfig {
    let mut config = LoaderConfig::new(libraries.iter().copied());
    config.version_number = version.to_string();
    config.cpu_family = CpuFamily::Arm;
    config
}

fn context(info: &ApplicationInfo) -> Arc<StaticContext> {
    Arc::new(StaticContext::new(info.clone()))
}

fn default_info() -> ApplicationInfo {
    ApplicationInfo::new("/data/app/base.apk", "/data/cache")
}

#[test]
fn test_system_linker_initializes_browser() {
    let linker = FakeLinker::default();
    let native = Arc::new(FakeNative::new("74.0.0.1"));
    let loader = LibraryLoader::builder(config(&["base", "chrome"], "74.0.0.1"), context(&default_info()))
        .system_linker(Box::new(linker.clone()))
        .native_bridge(native.clone())
        .task_runner(Arc::new(InlineTaskRunner))
        .build();

    loader.ensure_initialized(ProcessType::Browser).unwrap();

    assert_eq!(linker.calls(), vec!["system base", "system chrome"]);
    assert!(loader.is_initialized());
    assert_eq!(native.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(native.command_lines.lock().len(), 1);
}

#[test]
fn test_system_linker_from_archive() {
    let linker = FakeLinker::default();
    let mut config = config(&["chrome"], "74.0.0.1");
    config.use_library_in_zip_file = true;
    let loader = LibraryLoader::builder(config, context(&default_info()))
        .system_linker(Box::new(linker.clone()))
        .native_bridge(Arc::new(FakeNative::new("74.0.0.1")))
        .build();

    loader.load_now().unwrap();

    let entry = make_library_path_in_zip_file("chrome", &CpuFamily::Arm, false, is_process_64bit()).unwrap();
    assert_eq!(linker.calls(), vec![format!("path /data/app/base.apk!/{entry}")]);
}

#[test]
fn test_concurrent_callers_load_once() {
    let linker = FakeLinker::default();
    let native = Arc::new(FakeNative::new("74.0.0.1"));
    let loader = Arc::new(
        LibraryLoader::builder(config(&["chrome"], "74.0.0.1"), context(&default_info()))
            .system_linker(Box::new(linker.clone()))
            .native_bridge(native.clone())
            .task_runner(Arc::new(InlineTaskRunner))
            .build(),
    );

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let loader = loader.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    loader.ensure_initialized(ProcessType::Child).unwrap();
                    assert!(loader.is_initialized());
                } else {
                    loader.load_now().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(linker.loads.load(Ordering::SeqCst), 1);
    assert_eq!(native.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(loader.state(), LoadState::Initialized);
}

#[test]
fn test_version_mismatch_keeps_uninitialized() {
    let loader = LibraryLoader::builder(config(&["chrome"], "75.0.0.0"), context(&default_info()))
        .system_linker(Box::new(FakeLinker::default()))
        .native_bridge(Arc::new(FakeNative::new("74.0.0.1")))
        .build();

    let err = loader.ensure_initialized(ProcessType::Browser).unwrap_err();
    assert!(matches!(err, LoaderError::Init(InitError::WrongVersion { .. })));
    assert_eq!(err.code().as_i32(), 3);
    assert!(!loader.is_initialized());
}

#[test]
fn test_unknown_cpu_family_fails_before_loading() {
    let linker = FakeLinker::default();
    let mut config = config(&["chrome"], "74.0.0.1");
    config.use_library_in_zip_file = true;
    config.cpu_family = CpuFamily::from("sparc");
    let loader = LibraryLoader::builder(config, context(&default_info()))
        .system_linker(Box::new(linker.clone()))
        .native_bridge(Arc::new(FakeNative::new("74.0.0.1")))
        .build();

    let err = loader.load_now().unwrap_err();
    assert!(matches!(
        &err,
        LoaderError::Config(ConfigError::UnknownCpuFamily(name)) if name == "sparc"
    ));
    assert!(linker.calls().is_empty());
    assert!(!loader.is_loaded());
}

#[test]
fn test_config_from_json() {
    let config = LoaderConfig::from_json_str(
        r#"{
            "libraries": ["monochrome"],
            "cpu_family": "arm",
            "use_chromium_linker": true,
            "version_number": "74.0.0.1"
        }"#,
    )
    .unwrap();
    assert_eq!(config.libraries, vec!["monochrome"]);
    assert_eq!(config.cpu_family, CpuFamily::Arm);
    assert!(config.use_chromium_linker());
    assert!(!config.is_in_zip_file());
}

fn write_archive(path: &Path, entry: &str, bytes: &[u8]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    writer.start_file(entry, SimpleFileOptions::default()).unwrap();
    writer.write_all(bytes).unwrap();
    writer.finish().unwrap();
}

#[test]
fn test_fallback_extraction_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("base.apk");
    let entry = make_library_path_in_zip_file("chrome", &CpuFamily::Arm, false, is_process_64bit()).unwrap();
    write_archive(&archive, &entry, b"\x7fELF chrome");

    let cache_dir = dir.path().join("cache");
    let info = ApplicationInfo::new(&archive, &cache_dir);
    // Left behind by an earlier build.
    let library_dir: PathBuf = cache_dir.join(LIBRARY_DIR);
    fs::create_dir_all(&library_dir).unwrap();
    fs::write(library_dir.join("libchrome.so@73"), b"old").unwrap();

    let mut config = config(&["chrome"], "74.0.0.1");
    config.use_chromium_linker = true;
    config.platform_requires_native_fallback_extraction = true;
    config.extracted_file_suffix = "@74".to_string();

    let linker = FakeLinker::failing_bare_names();
    let metrics = Arc::new(HistogramRecorder::new());
    let loader = LibraryLoader::builder(config, context(&info))
        .custom_linker(Box::new(linker.clone()))
        .native_bridge(Arc::new(FakeNative::new("74.0.0.1")))
        .task_runner(Arc::new(InlineTaskRunner))
        .metrics(metrics.clone())
        .build();

    loader.ensure_initialized(ProcessType::Browser).unwrap();

    let extracted = library_dir.join("libchrome.so@74");
    assert_eq!(fs::read(&extracted).unwrap(), b"\x7fELF chrome");
    assert_eq!(
        linker.calls(),
        vec![
            "custom chrome true".to_string(),
            "custom chrome false".to_string(),
            format!("custom {} true", extracted.display()),
        ]
    );

    // Sweep ran on the inline runner.
    assert!(!library_dir.join("libchrome.so@73").exists());
    assert!(extracted.exists());

    let histogram = load_status::BROWSER_HISTOGRAM;
    assert_eq!(metrics.count(histogram, load_status::FIRST_ATTEMPT | load_status::FIXED_ADDRESS), 1);
    assert_eq!(metrics.count(histogram, load_status::FIRST_ATTEMPT), 1);
    assert_eq!(
        metrics.count(histogram, load_status::SUCCESS | load_status::FIXED_ADDRESS),
        1
    );
}

#[test]
fn test_extraction_cache_reused_across_loaders() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("base.apk");
    let entry = "lib/x86/libchrome.so";
    write_archive(&archive, entry, b"payload");

    let cache = ExtractionCache::new(dir.path().join(LIBRARY_DIR), "@1");
    let first = cache.ensure_extracted(&archive, entry).unwrap();
    let second = ExtractionCache::new(dir.path().join(LIBRARY_DIR), "@1")
        .ensure_extracted(&archive, entry)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read(second).unwrap(), b"payload");
}

#[test]
fn test_renderer_load_time_handed_to_native() {
    let native = Arc::new(FakeNative::new("74.0.0.1"));
    let mut config = config(&["chrome"], "74.0.0.1");
    config.use_chromium_linker = true;
    let loader = LibraryLoader::builder(config, context(&default_info()))
        .custom_linker(Box::new(FakeLinker::default()))
        .native_bridge(native.clone())
        .build();

    loader.ensure_initialized(ProcessType::Child).unwrap();
    loader.register_renderer_process_histogram();
    assert_eq!(native.renderer_load_times.lock().len(), 1);
}

#[test]
fn test_profiler_setting_reaches_native_command_line() {
    let settings = Arc::new(MemorySettings::new());
    LibraryLoader::set_reached_code_profiler_enabled_on_next_runs(settings.as_ref(), true);

    let native = Arc::new(FakeNative::new("74.0.0.1"));
    let loader = LibraryLoader::builder(config(&["chrome"], "74.0.0.1"), context(&default_info()))
        .system_linker(Box::new(FakeLinker::default()))
        .native_bridge(native.clone())
        .settings(settings)
        .build();

    loader.ensure_initialized(ProcessType::Browser).unwrap();
    let command_lines = native.command_lines.lock();
    assert_eq!(command_lines.as_slice(), &[vec!["--enable-reached-code-profiler".to_string()]]);
}

proptest! {
    #[test]
    fn test_archive_paths_are_deterministic(name in "[a-z][a-z0-9_]{0,15}", crazy: bool, is_64bit: bool) {
        let first = make_library_path_in_zip_file(&name, &CpuFamily::Arm, crazy, is_64bit).unwrap();
        let second = make_library_path_in_zip_file(&name, &CpuFamily::Arm, crazy, is_64bit).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.starts_with("lib/"));
        let expected_suffix = format!("lib{name}.so");
        prop_assert!(first.ends_with(&expected_suffix));
        prop_assert_eq!(first.contains("crazy."), crazy);
    }

    #[test]
    fn test_unknown_families_always_rejected(family in "[a-z]{3,8}") {
        prop_assume!(!["arm", "arm64", "aarch64", "x86", "mips", "mips64", "i386", "i686"].contains(&family.as_str()));
        let result = make_library_path_in_zip_file("chrome", &CpuFamily::from(family.as_str()), false, false);
        prop_assert!(result.is_err());
    }
}
