//! Installed-package metadata

use std::path::{Path, PathBuf};

/// Where the installed package lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    /// Path of the package archive (the APK)
    pub source_dir: PathBuf,
    /// Writable, executable per-app cache directory
    pub code_cache_dir: PathBuf,
    /// Isolated processes cannot create directories
    pub is_isolated_process: bool,
}

impl ApplicationInfo {
    /// Create application info for a regular process
    pub fn new(source_dir: impl Into<PathBuf>, code_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            code_cache_dir: code_cache_dir.into(),
            is_isolated_process: false,
        }
    }

    /// Mark as an isolated process
    pub fn isolated(mut self) -> Self {
        self.is_isolated_process = true;
        self
    }

    /// Path of the package archive
    pub fn archive_path(&self) -> &Path {
        &self.source_dir
    }
}

/// Supplies the application info of the running process.
///
/// Must answer synchronously and return the same value for the lifetime of
/// the process.
pub trait ApplicationContext: Send + Sync {
    fn application_info(&self) -> ApplicationInfo;
}

/// Context backed by a fixed [`ApplicationInfo`]
#[derive(Debug, Clone)]
pub struct StaticContext {
    info: ApplicationInfo,
}

impl StaticContext {
    pub fn new(info: ApplicationInfo) -> Self {
        Self { info }
    }
}

impl ApplicationContext for StaticContext {
    fn application_info(&self) -> ApplicationInfo {
        self.info.clone()
    }
}
