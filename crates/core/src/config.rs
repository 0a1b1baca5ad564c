//! Archive configuration model.
//!
//! Mirrors the on-disk configuration layout: an `[archive]` table selecting
//! the database and storage backends plus the extension lists, and one table
//! per backend with its connection settings. Loading and merging of the
//! actual files is done by the archive crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The `[archive]` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Database backend name ("postgresql" or "sqlite").
    pub database: String,
    /// Storage backend name ("fs", "s3", "swift" or "none").
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Grace period in minutes before cascade rules act on orphans.
    #[serde(default)]
    pub cascade_grace_period: i64,
    /// Upper bound on cascade fixed-point iterations.
    #[serde(default = "default_max_cascade_cycles")]
    pub max_cascade_cycles: u32,
    #[serde(default)]
    pub namespace_extensions: Vec<String>,
    #[serde(default)]
    pub product_type_extensions: Vec<String>,
    #[serde(default)]
    pub remote_backend_extensions: Vec<String>,
    #[serde(default)]
    pub hook_extensions: Vec<String>,
    /// Path of the JSON credentials file used for remote fetches.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    /// Directory for scratch space; defaults to a workspace under the
    /// archive root so final moves never cross mount points.
    #[serde(default)]
    pub tempdir: Option<PathBuf>,
}

fn default_storage() -> String {
    "fs".to_string()
}

fn default_max_cascade_cycles() -> u32 {
    25
}

/// The `[postgresql]` table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PostgresqlConfig {
    pub connection_string: String,
    /// Optional table name prefix for coexistence with other tenants.
    #[serde(default)]
    pub table_prefix: String,
}

/// The `[sqlite]` table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub connection_string: String,
    #[serde(default)]
    pub table_prefix: String,
    /// Path of the SpatiaLite loadable extension. When unset, the backend
    /// runs without spatial support and geometry queries fail at use.
    #[serde(default)]
    pub mod_spatialite_path: Option<String>,
}

/// The `[fs]` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    /// Archive root directory.
    pub root: PathBuf,
    /// Store intra-archive products as (relative) symbolic links by default.
    #[serde(default)]
    pub use_symlinks: bool,
}

/// The `[s3]` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

/// The `[swift]` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwiftConfig {
    pub container: String,
    pub user: String,
    pub key: String,
    pub authurl: String,
}

/// A complete archive configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub postgresql: Option<PostgresqlConfig>,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub fs: Option<FsConfig>,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub swift: Option<SwiftConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "archive": {"database": "sqlite"},
            "sqlite": {"connection_string": ":memory:"},
        }))
        .unwrap();

        assert_eq!(config.archive.storage, "fs");
        assert_eq!(config.archive.max_cascade_cycles, 25);
        assert_eq!(config.archive.cascade_grace_period, 0);
        assert!(config.sqlite.unwrap().mod_spatialite_path.is_none());
    }
}
