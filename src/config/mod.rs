//! Static loader configuration
//!
//! Mirrors what the build system generates for each package: which
//! libraries to load, how they are packaged, which linker to use and which
//! version the loaded code must report.

mod settings;

pub use settings::{JsonFileSettings, MemorySettings, SettingsStore, keys};

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::loader::CpuFamily;
use crate::utils::{ConfigError, Result};

/// Build-time description of the native libraries
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Library names, without `lib` prefix or `.so` suffix, in load order
    pub libraries: Vec<String>,
    /// CPU family the package was built for
    pub cpu_family: CpuFamily,
    /// Libraries stay uncompressed inside the package archive
    pub use_library_in_zip_file: bool,
    /// Use the relocation-sharing linker instead of the system one
    pub use_chromium_linker: bool,
    /// Version the loaded library must report
    pub version_number: String,
    /// Appended to extracted file names; changes with every build
    pub extracted_file_suffix: String,
    /// Old platforms where the package manager may fail to extract libraries
    pub platform_requires_native_fallback_extraction: bool,
    /// Set `UBSAN_OPTIONS` before loading
    pub is_ubsan: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            libraries: Vec::new(),
            cpu_family: CpuFamily::detect(),
            use_library_in_zip_file: false,
            use_chromium_linker: false,
            version_number: crate::VERSION.to_string(),
            extracted_file_suffix: format!("@{}", crate::VERSION),
            platform_requires_native_fallback_extraction: false,
            is_ubsan: false,
        }
    }
}

impl LoaderConfig {
    /// Config loading the given libraries with the system linker
    pub fn new<I, S>(libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            libraries: libraries.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a JSON config
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e).into())
    }

    /// Read and parse a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Whether the relocation-sharing linker is enabled
    pub fn use_chromium_linker(&self) -> bool {
        self.use_chromium_linker
    }

    /// Whether libraries remain inside the package archive
    pub fn is_in_zip_file(&self) -> bool {
        self.use_library_in_zip_file
    }
}
