//! Configuration for commitstore processes.
//!
//! One `Config` holds the storage backend choice, the polling settings and
//! serializer options. Values come from YAML files and `COMMITSTORE__*`
//! environment variables.

mod storage;

pub use storage::{GrpcConfig, SqliteConfig, StorageConfig, StorageType};

use serde::Deserialize;

use crate::polling::PollingConfig;
use crate::serialization::SerializerOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "commitstore.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COMMITSTORE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COMMITSTORE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COMMITSTORE_LOG";

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Catch-up polling configuration.
    pub polling: PollingConfig,
    /// Serializer options used by storage backends.
    pub serializer: SerializerOptions,
}

impl Config {
    /// Load configuration, later sources overriding earlier ones:
    ///
    /// 1. `commitstore.yaml` in the working directory, when present
    /// 2. the file at `path`
    /// 3. the file named by `COMMITSTORE_CONFIG`
    /// 4. `COMMITSTORE__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as Layers, Environment, File, FileFormat};

        let explicit = path
            .map(str::to_string)
            .into_iter()
            .chain(std::env::var(CONFIG_ENV_VAR).ok());

        let builder = explicit.fold(
            Layers::builder()
                .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false)),
            |builder, file| builder.add_source(File::new(&file, FileFormat::Yaml)),
        );

        let layers = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(layers.try_deserialize()?)
    }
}
