//! Shared utilities and error types

pub mod error;

pub use error::{
    ConfigError, ExtractionError, InitError, LoaderError, LoaderErrorCode, Result,
};
