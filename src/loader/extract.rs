//! Fallback extraction of libraries out of the package archive
//!
//! On some old platforms the package manager fails to extract native
//! libraries at install time. The loader then copies the library out of the
//! archive into its own cache directory and retries from there.
//!
//! Extracted files are named `<libname.so><suffix>`. The suffix changes with
//! every build, so an upgrade misses the cache and obsolete copies are
//! recognised by the missing suffix. A file that exists under the final name
//! is trusted without looking at its content.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::process::ApplicationInfo;
use crate::utils::ExtractionError;

/// Name of the extraction directory under the code cache dir
pub const LIBRARY_DIR: &str = "native_libraries";

/// Marker of in-progress copies; they still contain the suffix
const TEMP_FILE_SUFFIX: &str = ".tmp";

/// One extracted library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLibraryRecord {
    pub archive_path: PathBuf,
    pub entry_name: String,
    pub destination: PathBuf,
    pub suffix: String,
}

/// Extraction statistics
#[derive(Debug, Default)]
pub struct ExtractionStats {
    /// Entries copied out of an archive
    pub extractions: AtomicUsize,
    /// Bytes written to the cache directory
    pub bytes_copied: AtomicU64,
    /// Requests answered by an existing file
    pub cache_hits: AtomicUsize,
}

impl ExtractionStats {
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

/// Outcome of a stale-file sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Per-build cache of libraries copied out of the package archive
#[derive(Debug)]
pub struct ExtractionCache {
    library_dir: PathBuf,
    suffix: String,
    create_dirs: bool,
    stats: ExtractionStats,
}

impl ExtractionCache {
    /// Cache rooted at `library_dir`; extracted names end with `suffix`
    pub fn new(library_dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            library_dir: library_dir.into(),
            suffix: suffix.into(),
            create_dirs: true,
            stats: ExtractionStats::default(),
        }
    }

    /// Cache inside the application's code cache dir
    pub fn for_application(info: &ApplicationInfo, suffix: impl Into<String>) -> Self {
        let mut cache = Self::new(info.code_cache_dir.join(LIBRARY_DIR), suffix);
        // Isolated processes have no filesystem write access.
        cache.create_dirs = !info.is_isolated_process;
        cache
    }

    /// Directory holding extracted libraries
    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    /// Build suffix of extracted names
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Extraction statistics
    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    /// Final path for an archive entry
    pub fn destination_for(&self, entry: &str) -> PathBuf {
        let base = entry.rsplit('/').next().unwrap_or(entry);
        self.library_dir.join(format!("{base}{}", self.suffix))
    }

    /// Create the cache dir and library dir, traversable by the dynamic
    /// linker. Safe to call repeatedly.
    pub fn make_library_dir_and_set_permission(&self) -> Result<&Path, ExtractionError> {
        if !self.create_dirs {
            return Ok(&self.library_dir);
        }
        if let Some(cache_dir) = self.library_dir.parent() {
            create_executable_dir(cache_dir)?;
        }
        create_executable_dir(&self.library_dir)?;
        Ok(&self.library_dir)
    }

    /// Make sure `entry` of `archive` exists as a plain file and return its path.
    ///
    /// An existing destination is returned without touching the archive.
    /// Otherwise the entry is copied to a temporary file in the same
    /// directory and renamed into place, so the final name never refers to
    /// a partial copy. Concurrent extractors produce identical bytes and the
    /// last rename wins.
    pub fn ensure_extracted(&self, archive: &Path, entry: &str) -> Result<PathBuf, ExtractionError> {
        let destination = self.destination_for(entry);
        if destination.exists() {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: "LibraryLoader", "Using extracted {}", destination.display());
            return Ok(destination);
        }

        self.make_library_dir_and_set_permission()?;
        let record = ExtractedLibraryRecord {
            archive_path: archive.to_path_buf(),
            entry_name: entry.to_string(),
            destination,
            suffix: self.suffix.clone(),
        };
        let copied = self.extract(&record)?;

        self.stats.extractions.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_copied.fetch_add(copied, Ordering::Relaxed);
        info!(
            target: "LibraryLoader",
            "Extracted {} from {} ({copied} bytes)",
            record.entry_name,
            record.archive_path.display()
        );
        Ok(record.destination)
    }

    fn extract(&self, record: &ExtractedLibraryRecord) -> Result<u64, ExtractionError> {
        let archive_err = |source| ExtractionError::Archive {
            archive: record.archive_path.clone(),
            source,
        };
        let file = File::open(&record.archive_path).map_err(|e| archive_err(ZipError::Io(e)))?;
        let mut zip = ZipArchive::new(file).map_err(archive_err)?;
        let mut entry = match zip.by_name(&record.entry_name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ExtractionError::MissingEntry {
                    archive: record.archive_path.clone(),
                    entry: record.entry_name.clone(),
                });
            }
            Err(e) => return Err(archive_err(e)),
        };

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExtractionError::Io { path, source }
        };

        // The temp name keeps the suffix so the sweep leaves it alone.
        let file_name = record
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{file_name}."))
            .suffix(TEMP_FILE_SUFFIX)
            .tempfile_in(&self.library_dir)
            .map_err(io_err(&self.library_dir))?;

        let copied = io::copy(&mut entry, tmp.as_file_mut()).map_err(io_err(tmp.path()))?;
        tmp.as_file_mut().flush().map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        set_mode(tmp.path(), 0o755).map_err(io_err(tmp.path()))?;

        // Dropping `tmp` on any error above removes the partial copy.
        tmp.persist(&record.destination)
            .map_err(|e| ExtractionError::Io {
                path: record.destination.clone(),
                source: e.error,
            })?;
        Ok(copied)
    }

    /// Delete files left behind by other builds.
    ///
    /// Anything whose name contains the current suffix is kept, which covers
    /// both finished copies and in-progress temporary files. Failures are
    /// logged and reported, never returned as errors.
    pub fn sweep_obsolete(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.library_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(target: "LibraryLoader", "Nothing to sweep in {}: {e}", self.library_dir.display());
                return report;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.contains(&self.suffix) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(target: "LibraryLoader", "Removed obsolete file {file_name}");
                    report.removed.push(file_name);
                }
                Err(e) => {
                    warn!(target: "LibraryLoader", "Unable to remove {file_name}: {e}");
                    report.failed.push(file_name);
                }
            }
        }
        report
    }
}

fn create_executable_dir(dir: &Path) -> Result<(), ExtractionError> {
    let io_err = |source| ExtractionError::Io {
        path: dir.to_path_buf(),
        source,
    };
    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(io_err(e)),
    }
    add_mode(dir, 0o711).map_err(io_err)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(unix)]
fn add_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let current = fs::metadata(path)?.permissions().mode();
    if current & mode == mode {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(current | mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn add_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
