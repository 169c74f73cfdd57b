//! Storage configuration types.

use serde::Deserialize;

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    #[default]
    Sqlite,
    Grpc,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
    /// Remote store configuration.
    pub grpc: GrpcConfig,
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file path, or `:memory:` for a private in-memory database.
    pub path: String,
    /// Commits fetched per page on reads.
    pub page_size: u64,
    /// Pool size for file-backed databases.
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "data/commitstore.db".to_string(),
            page_size: 128,
            max_connections: 5,
        }
    }
}

/// Remote store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    /// Store address as `host:port` or a full `http://` URI.
    pub address: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1340".to_string(),
            timeout_ms: 5000,
        }
    }
}
