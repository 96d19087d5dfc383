//! # library-loader
//!
//! Loads a process's native libraries exactly once and hands control to
//! native code in a known state.
//!
//! ## Architecture
//!
//! - **loader**: the load/initialize state machine, linker strategies,
//!   fallback extraction and the native bridge
//! - **config**: build-time library configuration and persisted settings
//! - **metrics**: load status recording and histogram sinks
//! - **process**: process roles, command line, application context and
//!   background task runners
//! - **utils**: shared error types

pub mod config;
pub mod loader;
pub mod metrics;
pub mod process;
pub mod utils;

// Re-export main types for convenience
pub use config::LoaderConfig;
pub use loader::{LibraryLoader, LibraryLoaderBuilder, LoadState};
pub use process::{ApplicationInfo, ProcessType};
pub use utils::error::{LoaderError, LoaderErrorCode, Result};

/// Crate version; also the default expected native version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "library-loader";
