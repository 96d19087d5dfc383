//! Library path resolution
//!
//! Maps a library name plus the target CPU to the path of its bytes inside
//! the package archive, e.g. `lib/arm64-v8a/libmonochrome.so`.

use std::fmt;

use serde::Deserialize;

use crate::config::LoaderConfig;
use crate::utils::ConfigError;

/// Prefix applied by the build when the relocation-sharing linker loads
/// uncompressed libraries from the archive, so the package manager leaves
/// them alone at install time.
pub const CRAZY_PREFIX: &str = "crazy.";

/// CPU family the libraries were built for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum CpuFamily {
    Arm,
    X86,
    Mips,
    /// Anything outside the ABI table; rejected at resolution time
    Other(String),
}

impl CpuFamily {
    /// Family of the running process
    pub fn detect() -> Self {
        Self::from(std::env::consts::ARCH)
    }

    /// ABI directory name used inside the archive
    pub fn abi_dir(&self, is_64bit: bool) -> Result<&'static str, ConfigError> {
        // 'armeabi' is intentionally absent.
        match (self, is_64bit) {
            (CpuFamily::Arm, true) => Ok("arm64-v8a"),
            (CpuFamily::Arm, false) => Ok("armeabi-v7a"),
            (CpuFamily::X86, true) => Ok("x86_64"),
            (CpuFamily::X86, false) => Ok("x86"),
            (CpuFamily::Mips, true) => Ok("mips64"),
            (CpuFamily::Mips, false) => Ok("mips"),
            (CpuFamily::Other(name), _) => Err(ConfigError::UnknownCpuFamily(name.clone())),
        }
    }
}

impl From<&str> for CpuFamily {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "arm" | "arm64" | "aarch64" => CpuFamily::Arm,
            "x86" | "x86_64" | "i386" | "i686" => CpuFamily::X86,
            "mips" | "mips64" => CpuFamily::Mips,
            _ => CpuFamily::Other(name.to_string()),
        }
    }
}

impl From<String> for CpuFamily {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl fmt::Display for CpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuFamily::Arm => f.write_str("arm"),
            CpuFamily::X86 => f.write_str("x86"),
            CpuFamily::Mips => f.write_str("mips"),
            CpuFamily::Other(name) => f.write_str(name),
        }
    }
}

/// How a library ships inside the package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packaging {
    /// Stored uncompressed in the archive and mapped from there
    InArchive,
    /// Extracted by the package manager to the library search path
    Standalone,
}

/// Platform file name of a library: `foo` -> `libfoo.so`
pub fn map_library_name(library: &str) -> String {
    format!("lib{library}.so")
}

/// Path of `library` inside the package archive
pub fn make_library_path_in_zip_file(
    library: &str,
    cpu_family: &CpuFamily,
    crazy_prefix: bool,
    is_64bit: bool,
) -> Result<String, ConfigError> {
    let abi = cpu_family.abi_dir(is_64bit)?;
    let crazy = if crazy_prefix { CRAZY_PREFIX } else { "" };
    Ok(format!("lib/{abi}/{crazy}{}", map_library_name(library)))
}

/// Whether the running process is 64-bit
pub fn is_process_64bit() -> bool {
    cfg!(target_pointer_width = "64")
}

/// Fully resolved identity of one library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDescriptor {
    pub name: String,
    pub cpu_family: CpuFamily,
    pub is_64bit: bool,
    pub packaging: Packaging,
}

impl LibraryDescriptor {
    /// Resolve `name` against the build config and the running process
    pub fn resolve(name: &str, config: &LoaderConfig) -> Self {
        Self {
            name: name.to_string(),
            cpu_family: config.cpu_family.clone(),
            is_64bit: is_process_64bit(),
            packaging: if config.is_in_zip_file() {
                Packaging::InArchive
            } else {
                Packaging::Standalone
            },
        }
    }

    /// Path of this library inside the package archive
    pub fn path_in_archive(&self, crazy_prefix: bool) -> Result<String, ConfigError> {
        make_library_path_in_zip_file(&self.name, &self.cpu_family, crazy_prefix, self.is_64bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_abi_table() {
        let table = [
            (CpuFamily::Arm, true, "arm64-v8a"),
            (CpuFamily::Arm, false, "armeabi-v7a"),
            (CpuFamily::X86, true, "x86_64"),
            (CpuFamily::X86, false, "x86"),
            (CpuFamily::Mips, true, "mips64"),
            (CpuFamily::Mips, false, "mips"),
        ];
        for (family, is_64bit, abi) in table {
            assert_eq!(family.abi_dir(is_64bit).unwrap(), abi);
        }
    }

    #[test]
    fn test_make_library_path() {
        assert_eq!(
            make_library_path_in_zip_file("chrome", &CpuFamily::Arm, false, true).unwrap(),
            "lib/arm64-v8a/libchrome.so"
        );
        assert_eq!(
            make_library_path_in_zip_file("chrome", &CpuFamily::Arm, true, false).unwrap(),
            "lib/armeabi-v7a/crazy.libchrome.so"
        );
    }

    #[test]
    fn test_unknown_family_is_an_error() {
        let family = CpuFamily::from("RISCV");
        let err = make_library_path_in_zip_file("chrome", &family, false, true).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCpuFamily(ref name) if name == "RISCV"));
    }

    #[test]
    fn test_family_from_arch_names() {
        assert_eq!(CpuFamily::from("aarch64"), CpuFamily::Arm);
        assert_eq!(CpuFamily::from("x86_64"), CpuFamily::X86);
        assert_eq!(CpuFamily::from("mips64"), CpuFamily::Mips);
        assert_eq!(CpuFamily::from("X86").to_string(), "x86");
    }

    #[test]
    fn test_descriptor_resolve() {
        let mut config = LoaderConfig::new(["monochrome"]);
        config.cpu_family = CpuFamily::X86;
        config.use_library_in_zip_file = true;

        let descriptor = LibraryDescriptor::resolve("monochrome", &config);
        assert_eq!(descriptor.packaging, Packaging::InArchive);

        let expected_abi = if is_process_64bit() { "x86_64" } else { "x86" };
        assert_eq!(
            descriptor.path_in_archive(false).unwrap(),
            format!("lib/{expected_abi}/libmonochrome.so")
        );
    }
}
