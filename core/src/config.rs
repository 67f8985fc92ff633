//! Engine configuration and definition loading
//!
//! Definitions are loaded from TOML files in two locations:
//! - **Builtin**: Shipped with the game (read-only)
//! - **Custom**: Server-specific definitions (editable)
//!
//! Custom definitions with the same key override builtins. Behavior set up in
//! code via `EffectRegistry::attach_hooks` survives an override.

use std::fs;
use std::path::{Path, PathBuf};

use boons_types::DefinitionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::effects::EffectRegistry;

const APP_NAME: &str = "boons";

/// Engine settings, persisted as TOML through confy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of definition files shipped with the game
    pub builtin_definitions_dir: Option<PathBuf>,
    /// Directory of server-specific definition files
    pub custom_definitions_dir: Option<PathBuf>,
    /// Where `JsonFileStore` keeps per-entity files
    pub store_dir: Option<PathBuf>,

    /// Attribute name the effect collection is stored under
    pub attribute_key: String,
    /// Floor for the time-to-next-tick snapshot taken on pause
    pub min_tick_resume_secs: f64,
    /// Warn the first time an uncapped definition stacks past one
    pub warn_uncapped_stacks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            builtin_definitions_dir: None,
            custom_definitions_dir: None,
            store_dir: None,
            attribute_key: "effects".to_string(),
            min_tick_resume_secs: 1.0,
            warn_uncapped_stacks: true,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, writing defaults there if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        confy::load_path(path).map_err(|source| ConfigError::Confy {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        confy::store_path(path, self).map_err(|source| ConfigError::Confy {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Configured builtin dir, else the one next to the executable
    pub fn builtin_dir(&self) -> Option<PathBuf> {
        self.builtin_definitions_dir.clone().or_else(default_builtin_dir)
    }

    /// Configured custom dir, else the per-user config dir
    pub fn custom_dir(&self) -> Option<PathBuf> {
        self.custom_definitions_dir.clone().or_else(default_custom_dir)
    }

    /// Configured store dir, else the per-user data dir
    pub fn store_dir(&self) -> Option<PathBuf> {
        self.store_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join(APP_NAME).join("entities")))
    }
}

/// Build a registry from the configured definition directories
pub fn load_registry(config: &EngineConfig) -> Result<EffectRegistry, ConfigError> {
    load_definitions(config.builtin_dir().as_deref(), config.custom_dir().as_deref())
}

/// Load definitions from builtin and custom directories.
///
/// Builtin definitions are loaded first, then custom definitions, which
/// override builtins with the same key. Missing directories are skipped.
/// Files that fail to parse are logged and skipped.
pub fn load_definitions(
    builtin_dir: Option<&Path>,
    custom_dir: Option<&Path>,
) -> Result<EffectRegistry, ConfigError> {
    let mut registry = EffectRegistry::new();

    if let Some(dir) = builtin_dir
        && dir.exists()
    {
        load_directory(&mut registry, dir, "builtin", false)?;
    }

    if let Some(dir) = custom_dir
        && dir.exists()
    {
        load_directory(&mut registry, dir, "custom", true)?;
    }

    tracing::info!(count = registry.len(), "Loaded effect definitions");
    Ok(registry)
}

/// Load all TOML files from a directory, in file name order
fn load_directory(
    registry: &mut EffectRegistry,
    dir: &Path,
    source: &str,
    overwrite: bool,
) -> Result<(), ConfigError> {
    let entries = fs::read_dir(dir).map_err(|e| ConfigError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    for path in paths {
        match load_file(&path) {
            Ok(config) => {
                let count = config.effects.len();
                let duplicates = registry.add_definitions(config.effects, overwrite);
                if !duplicates.is_empty() {
                    tracing::warn!(
                        source,
                        file = ?path.file_name(),
                        ?duplicates,
                        "Duplicate effect definition keys"
                    );
                }
                tracing::debug!(source, file = ?path.file_name(), count, "Loaded definition file");
            }
            Err(e) => {
                tracing::warn!(source, error = %e, "Failed to load definition file");
            }
        }
    }

    Ok(())
}

/// Load a single TOML definition file
pub fn load_file(path: &Path) -> Result<DefinitionConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Save definitions to a TOML file
pub fn save_file(path: &Path, config: &DefinitionConfig) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;

    fs::write(path, contents).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Default engine config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME).join("engine.toml"))
}

/// Builtin definitions next to the executable
pub fn default_builtin_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("definitions").join("builtin")))
}

/// Custom definitions in the per-user config dir
pub fn default_custom_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_NAME).join("definitions"))
}

/// Errors that can occur during config loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Serialize error for {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },

    #[error("Config error for {path:?}: {source}")]
    Confy {
        path: PathBuf,
        #[source]
        source: confy::ConfyError,
    },
}
