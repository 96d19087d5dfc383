//! Persisted key-value settings
//!
//! Values written here are read by the loader on the next process launch,
//! before any native configuration system exists.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Setting keys read by the loader
pub mod keys {
    pub const REACHED_CODE_PROFILER_ENABLED: &str = "reached_code_profiler_enabled";
}

/// Boolean settings store
pub trait SettingsStore: Send + Sync {
    /// Read a flag, falling back to `default` when unset or unreadable
    fn get_bool(&self, key: &str, default: bool) -> bool;
    /// Write a flag; failures are logged, not reported
    fn set_bool(&self, key: &str, value: bool);
}

/// In-memory settings, lost at exit
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, bool>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.lock().get(key).copied().unwrap_or(default)
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.values.lock().insert(key.to_string(), value);
    }
}

/// Settings stored as a flat JSON object on disk
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Map<String, Value> {
        match fs::read_to_string(&self.path) {
            Ok(json) => match serde_json::from_str::<Map<String, Value>>(&json) {
                Ok(map) => map,
                Err(e) => {
                    warn!(target: "LibraryLoader", "Ignoring corrupt settings {}: {e}", self.path.display());
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!(target: "LibraryLoader", "Unable to read settings {}: {e}", self.path.display());
                Map::new()
            }
        }
    }

    fn write_map(&self, map: &Map<String, Value>) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(map)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.read_map()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    fn set_bool(&self, key: &str, value: bool) {
        let _guard = self.write_lock.lock();
        let mut map = self.read_map();
        map.insert(key.to_string(), Value::Bool(value));
        if let Err(e) = self.write_map(&map) {
            warn!(target: "LibraryLoader", "Unable to persist setting {key}: {e}");
        }
    }
}
