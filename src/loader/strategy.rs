//! Choice between the custom and the system linker

use crate::config::LoaderConfig;
use crate::utils::{ConfigError, Result};

/// How the libraries will be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Relocation-sharing linker, shared RELRO attempted first
    CustomLinker { library: String },
    /// Platform `dlopen`, once per library in configured order
    SystemLinker { libraries: Vec<String> },
}

impl LoadStrategy {
    /// Pick the strategy for this process.
    ///
    /// A zygote-forked process always uses the system linker: the shared
    /// relocations only make sense for a process that maps the library
    /// itself.
    pub fn select(config: &LoaderConfig, in_zygote: bool) -> Result<Self> {
        if config.use_chromium_linker() && !in_zygote {
            return match config.libraries.as_slice() {
                [library] => Ok(LoadStrategy::CustomLinker {
                    library: library.clone(),
                }),
                libraries => Err(ConfigError::CustomLinkerLibraryCount {
                    count: libraries.len(),
                }
                .into()),
            };
        }
        Ok(LoadStrategy::SystemLinker {
            libraries: config.libraries.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoaderError;
    use pretty_assertions::assert_eq;

    fn config(libraries: &[&str], custom: bool) -> LoaderConfig {
        let mut config = LoaderConfig::new(libraries.iter().copied());
        config.use_chromium_linker = custom;
        config
    }

    #[test]
    fn test_custom_linker_single_library() {
        let strategy = LoadStrategy::select(&config(&["monochrome"], true), false).unwrap();
        assert_eq!(
            strategy,
            LoadStrategy::CustomLinker {
                library: "monochrome".to_string()
            }
        );
    }

    #[test]
    fn test_custom_linker_rejects_many_libraries() {
        let err = LoadStrategy::select(&config(&["a", "b"], true), false).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::Config(ConfigError::CustomLinkerLibraryCount { count: 2 })
        ));
    }

    #[test]
    fn test_zygote_uses_system_linker() {
        let strategy = LoadStrategy::select(&config(&["a", "b"], true), true).unwrap();
        assert_eq!(
            strategy,
            LoadStrategy::SystemLinker {
                libraries: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_system_linker_keeps_order() {
        let strategy = LoadStrategy::select(&config(&["base", "chrome"], false), false).unwrap();
        assert_eq!(
            strategy,
            LoadStrategy::SystemLinker {
                libraries: vec!["base".to_string(), "chrome".to_string()]
            }
        );
    }
}
