//! Configuration management for the registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (xregistry.toml)
//! - Environment variables (XREGISTRY__*)
//!
//! ## Example config file (xregistry.toml):
//! ```toml
//! [registry]
//! id = "my-registry"
//! base_url = "http://localhost:8080"
//! read_only = false
//!
//! [store]
//! backend = "sqlite"
//! path = "./data/registry.db"
//!
//! [fetch]
//! timeout_secs = 30
//!
//! [model]
//! path = "./model.json"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const SPEC_VERSION: &str = "1.0";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub store: StoreConfig,

    /// Proxy content fetches
    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

/// Registry identity and behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// `registryid` of the root entity
    #[serde(default = "default_registry_id")]
    pub id: String,

    /// Prefix for rendered `self` URLs
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Reject every write
    #[serde(default)]
    pub read_only: bool,

    #[serde(default = "default_spec_version")]
    pub spec_version: String,
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file for the sqlite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    /// Model document applied on startup
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_registry_id() -> String {
    "xregistry".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("xregistry.db")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("xregistry/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            id: default_registry_id(),
            base_url: default_base_url(),
            read_only: false,
            spec_version: default_spec_version(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_store_path(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, adding a specific file on top of the defaults
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["xregistry.toml", ".xregistry.toml", "config/xregistry.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(dirs) = directories::ProjectDirs::from("io", "xregistry", "xregistry") {
            let xdg_config = dirs.config_dir().join("xregistry.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // XREGISTRY__STORE__BACKEND=sqlite
        builder = builder.add_source(
            Environment::with_prefix("XREGISTRY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Store path with relative paths resolved against the working directory
    pub fn store_path(&self) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.store.path)
        }
    }
}
