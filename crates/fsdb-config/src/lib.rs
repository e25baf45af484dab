//! Configuration management for fsdb.
//!
//! Parses `fsdb.toml` configuration files with serde and provides
//! auto-discovery of config files in parent directories.
//!
//! CLI settings can be applied during load via [`CliSettings`].
//!
//! ## Environment Variable Expansion
//!
//! `storage.root` supports environment variable expansion:
//!
//! - `${VAR}` - expands to the value of VAR, errors if unset
//! - `${VAR:-default}` - expands to VAR if set, otherwise uses default

mod expand;

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI settings that override configuration file values.
///
/// All fields are optional. Only non-None values override the loaded config.
#[derive(Debug, Default)]
pub struct CliSettings {
    /// Override the storage root directory.
    pub root: Option<PathBuf>,
    /// Override the revision file format.
    pub format: Option<String>,
}

/// Configuration filename to search for.
const CONFIG_FILENAME: &str = "fsdb.toml";

/// Extensions revision files may be written with.
const FORMATS: &[&str] = &["json", "yaml", "yml"];

const DEFAULT_ROOT: &str = "data";
const DEFAULT_FORMAT: &str = "json";

/// Application configuration.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Storage configuration (root is a relative string from TOML).
    storage: StorageConfigRaw,

    /// Resolved storage configuration (set after loading).
    #[serde(skip)]
    pub storage_resolved: StorageConfig,
    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct StorageConfigRaw {
    root: Option<String>,
    format: Option<String>,
}

/// Resolved storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per database.
    pub root: PathBuf,
    /// Extension used when writing revision files.
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            format: DEFAULT_FORMAT.to_owned(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Validation error.
    #[error("Configuration error: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("Environment variable error in {field}: {message}")]
    EnvVar {
        /// Config field path (e.g., "`storage.root`").
        field: String,
        /// Error message (e.g., "${`FSDB_ROOT`} not set").
        message: String,
    },
}

impl Config {
    /// Load configuration from file with optional CLI settings.
    ///
    /// If `config_path` is provided, loads from that file.
    /// Otherwise, searches for `fsdb.toml` in current directory and parents.
    ///
    /// CLI settings are applied after loading and path resolution, allowing CLI
    /// arguments to take precedence over config file values.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist, parsing fails,
    /// or the resulting configuration is invalid.
    pub fn load(
        config_path: Option<&Path>,
        cli_settings: Option<&CliSettings>,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Self::load_from_file(path)?
        } else if let Some(discovered) = Self::discover_config() {
            Self::load_from_file(&discovered)?
        } else {
            Self::default_with_cwd()
        };

        if let Some(settings) = cli_settings {
            config.apply_cli_settings(settings);
            config.validate()?;
        }

        Ok(config)
    }

    fn apply_cli_settings(&mut self, settings: &CliSettings) {
        if let Some(root) = &settings.root {
            self.storage_resolved.root.clone_from(root);
        }
        if let Some(format) = &settings.format {
            self.storage_resolved.format.clone_from(format);
        }
    }

    /// Search for config file in current directory and parents.
    fn discover_config() -> Option<PathBuf> {
        let mut current = std::env::current_dir().ok()?;
        loop {
            let candidate = current.join(CONFIG_FILENAME);
            if candidate.exists() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    fn default_with_cwd() -> Self {
        let cwd = std::env::current_dir().unwrap_or_default();
        Self::default_with_base(&cwd)
    }

    /// Create default config with the root relative to `base`.
    fn default_with_base(base: &Path) -> Self {
        Self {
            storage: StorageConfigRaw::default(),
            storage_resolved: StorageConfig {
                root: base.join(DEFAULT_ROOT),
                format: DEFAULT_FORMAT.to_owned(),
            },
            config_path: None,
        }
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;

        config.expand_env_vars()?;

        let config_dir = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(config_dir);
        config.config_path = Some(path.to_path_buf());

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if the root is empty or the format
    /// is not a known extension.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_resolved.root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "storage.root cannot be empty".to_owned(),
            ));
        }
        let format = &self.storage_resolved.format;
        if !FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::Validation(format!(
                "storage.format must be one of {}, got {format:?}",
                FORMATS.join(", ")
            )));
        }
        Ok(())
    }

    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref root) = self.storage.root {
            self.storage.root = Some(expand::expand_env(root, "storage.root")?);
        }
        Ok(())
    }

    /// Resolve the storage root against the config directory.
    fn resolve_paths(&mut self, config_dir: &Path) {
        let root = self.storage.root.as_deref().unwrap_or(DEFAULT_ROOT);
        self.storage_resolved = StorageConfig {
            // An empty root stays empty so validation can reject it.
            root: if root.is_empty() {
                PathBuf::new()
            } else {
                config_dir.join(root)
            },
            format: self
                .storage
                .format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_owned()),
        };
    }
}
