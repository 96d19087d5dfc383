//! Error types for the native library loader
//!
//! Every failure in this crate is fatal for the process that hit it: the
//! caller is expected to log the error and exit with [`LoaderError::code`].
//! Contract violations by the caller (loading twice from different contexts,
//! initializing before loading, ...) are panics and never show up here.

use std::path::PathBuf;

use thiserror::Error;

use crate::loader::LinkError;
use crate::process::ProcessType;

/// Main error type for loader operations
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Static configuration cannot be satisfied
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The dynamic linker rejected the library after every fallback
    #[error("unable to load native library {library}")]
    Load {
        library: String,
        #[source]
        source: LinkError,
    },
    /// Fallback extraction out of the archive failed
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    /// The loaded library refused to initialize
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// CPU family missing from the ABI table
    #[error("unknown CPU ABI for native libraries: {0}")]
    UnknownCpuFamily(String),
    /// The custom linker only handles a single library
    #[error("custom linker requires exactly one library, {count} configured")]
    CustomLinkerLibraryCount { count: usize },
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid JSON for [`crate::config::LoaderConfig`]
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The entry does not exist in the archive
    #[error("cannot find entry {entry} in {}", archive.display())]
    MissingEntry { archive: PathBuf, entry: String },
    /// The archive itself is unreadable
    #[error("cannot read archive {}: {source}", archive.display())]
    Archive {
        archive: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    /// Filesystem error while copying or finalizing
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Initialization errors
#[derive(Debug, Error)]
pub enum InitError {
    /// The native readiness hook returned false
    #[error("native library failed to register")]
    FailedToRegister,
    /// Loaded library reports a different version than the one packaged
    #[error("wrong native library version: expected \"{expected}\", actual \"{actual}\"")]
    WrongVersion { expected: String, actual: String },
    /// Already initialized for another process role
    #[error("already initialized as {current}, cannot re-initialize as {requested}")]
    ProcessTypeMismatch {
        current: ProcessType,
        requested: ProcessType,
    },
}

/// Process exit codes reported for loader failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LoaderErrorCode {
    NormalCompletion = 0,
    FailedToRegisterJni = 1,
    NativeLibraryLoadFailed = 2,
    NativeLibraryWrongVersion = 3,
    NativeStartupFailed = 4,
}

impl LoaderErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl LoaderError {
    /// Exit code for this failure
    pub fn code(&self) -> LoaderErrorCode {
        match self {
            Self::Init(InitError::FailedToRegister) => LoaderErrorCode::FailedToRegisterJni,
            Self::Init(InitError::WrongVersion { .. }) => {
                LoaderErrorCode::NativeLibraryWrongVersion
            }
            Self::Init(InitError::ProcessTypeMismatch { .. })
            | Self::Config(_)
            | Self::Load { .. }
            | Self::Extraction(_) => LoaderErrorCode::NativeLibraryLoadFailed,
        }
    }
}

/// Convenience Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;
