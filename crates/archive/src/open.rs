//! Opening archives from configuration.
//!
//! An archive id resolves to `<id>.toml` along the `MUNINN_CONFIG_PATH`
//! search path (a colon-separated list of files and directories); the id
//! may also be a direct path to a configuration file. Extension objects
//! cannot come from configuration alone in a compiled setting, so the
//! caller provides the candidate set and the configuration's extension
//! lists select and order what gets registered.

use crate::archive::{Archive, ArchiveOptions};
use crate::plugin::{HookExtension, ProductTypePlugin, Registry, RemoteBackend};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use muninn_core::config::Config;
use muninn_core::{Error, NamespaceDef, Result, SchemaRegistry};
use muninn_database::{DatabaseBackend, PostgresBackend, SqliteBackend};
use muninn_storage::{FilesystemBackend, NoneBackend, S3Backend, StorageBackend, SwiftBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable holding the configuration search path.
pub const CONFIG_PATH_ENV: &str = "MUNINN_CONFIG_PATH";

/// Candidate extensions an archive configuration can select from.
#[derive(Default)]
pub struct Extensions {
    pub namespaces: Vec<NamespaceDef>,
    pub product_types: Vec<Arc<dyn ProductTypePlugin>>,
    pub remote_backends: Vec<(String, Arc<dyn RemoteBackend>)>,
    pub hook_extensions: Vec<(String, Arc<dyn HookExtension>)>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: NamespaceDef) -> Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn with_product_type(mut self, plugin: Arc<dyn ProductTypePlugin>) -> Self {
        self.product_types.push(plugin);
        self
    }

    pub fn with_remote_backend(mut self, name: &str, backend: Arc<dyn RemoteBackend>) -> Self {
        self.remote_backends.push((name.to_string(), backend));
        self
    }

    pub fn with_hook_extension(mut self, name: &str, extension: Arc<dyn HookExtension>) -> Self {
        self.hook_extensions.push((name.to_string(), extension));
        self
    }
}

/// Locate the configuration file for an archive id.
pub fn resolve_config_file(archive_id: &str) -> Result<PathBuf> {
    let direct = Path::new(archive_id);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }

    let search_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let file_name = format!("{archive_id}.toml");
    for entry in search_path.split(':').filter(|entry| !entry.is_empty()) {
        let entry = Path::new(entry);
        if entry.is_dir() {
            let candidate = entry.join(&file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        } else if entry.is_file()
            && entry.file_stem().map(|stem| stem.to_string_lossy()) == Some(archive_id.into())
        {
            return Ok(entry.to_path_buf());
        }
    }
    Err(Error::Config(format!(
        "configuration file for archive \"{archive_id}\" not found (search path: \"{search_path}\")"
    )))
}

/// Load and merge the configuration for an archive id.
pub fn load_config(archive_id: &str) -> Result<Config> {
    let file = resolve_config_file(archive_id)?;
    Figment::new()
        .merge(Toml::file(&file))
        .merge(Env::prefixed("MUNINN_").split("__"))
        .extract()
        .map_err(|e| Error::Config(format!("invalid configuration: {e}")))
}

/// Open an archive by id.
pub async fn open(archive_id: &str, extensions: Extensions) -> Result<Archive> {
    let config = load_config(archive_id)?;
    open_with_config(&config, extensions)
}

/// Open an archive from an already loaded configuration.
pub fn open_with_config(config: &Config, extensions: Extensions) -> Result<Archive> {
    let schemas = build_schemas(config, &extensions)?;
    let registry = build_registry(config, extensions)?;
    let schemas = Arc::new(schemas);
    let database = build_database(config, schemas.clone())?;
    let storage = build_storage(config)?;

    let use_symlinks = config.fs.as_ref().map(|fs| fs.use_symlinks).unwrap_or(false);
    Ok(Archive::new(
        database,
        storage,
        schemas,
        registry,
        ArchiveOptions {
            cascade_grace_period: config.archive.cascade_grace_period,
            max_cascade_cycles: config.archive.max_cascade_cycles,
            use_symlinks,
            auth_file: config.archive.auth_file.clone(),
        },
    ))
}

fn build_schemas(config: &Config, extensions: &Extensions) -> Result<SchemaRegistry> {
    let mut schemas = SchemaRegistry::new();
    for name in &config.archive.namespace_extensions {
        let namespace = extensions
            .namespaces
            .iter()
            .find(|namespace| namespace.name() == name)
            .ok_or_else(|| Error::Config(format!("namespace extension \"{name}\" not found")))?;
        schemas.register(namespace.clone())?;
    }
    Ok(schemas)
}

fn build_registry(config: &Config, extensions: Extensions) -> Result<Registry> {
    let mut registry = Registry::new();
    for name in &config.archive.product_type_extensions {
        let plugin = extensions
            .product_types
            .iter()
            .find(|plugin| plugin.product_type() == name)
            .ok_or_else(|| {
                Error::Config(format!("product type extension \"{name}\" not found"))
            })?;
        registry.register_product_type(plugin.clone())?;
    }
    for name in &config.archive.remote_backend_extensions {
        let backend = extensions
            .remote_backends
            .iter()
            .find(|(candidate, _)| candidate == name)
            .ok_or_else(|| {
                Error::Config(format!("remote backend extension \"{name}\" not found"))
            })?;
        registry.register_remote_backend(name, backend.1.clone())?;
    }
    for name in &config.archive.hook_extensions {
        let extension = extensions
            .hook_extensions
            .iter()
            .find(|(candidate, _)| candidate == name)
            .ok_or_else(|| Error::Config(format!("hook extension \"{name}\" not found")))?;
        registry.register_hook_extension(name, extension.1.clone())?;
    }
    Ok(registry)
}

fn build_database(config: &Config, schemas: Arc<SchemaRegistry>) -> Result<Arc<dyn DatabaseBackend>> {
    match config.archive.database.as_str() {
        "postgresql" => {
            let settings = config.postgresql.as_ref().ok_or_else(|| {
                Error::Config("database \"postgresql\" selected but no [postgresql] table".to_string())
            })?;
            Ok(Arc::new(PostgresBackend::new(
                &settings.connection_string,
                &settings.table_prefix,
                schemas,
            )?))
        }
        "sqlite" => {
            let settings = config.sqlite.as_ref().ok_or_else(|| {
                Error::Config("database \"sqlite\" selected but no [sqlite] table".to_string())
            })?;
            Ok(Arc::new(SqliteBackend::new(
                &settings.connection_string,
                &settings.table_prefix,
                settings.mod_spatialite_path.as_deref(),
                schemas,
            )?))
        }
        other => Err(Error::Config(format!("unknown database backend: \"{other}\""))),
    }
}

fn build_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.archive.storage.as_str() {
        "fs" => {
            let settings = config.fs.as_ref().ok_or_else(|| {
                Error::Config("storage \"fs\" selected but no [fs] table".to_string())
            })?;
            Ok(Arc::new(FilesystemBackend::new(settings.root.clone())))
        }
        "s3" => {
            let settings = config.s3.as_ref().ok_or_else(|| {
                Error::Config("storage \"s3\" selected but no [s3] table".to_string())
            })?;
            Ok(Arc::new(S3Backend::new(settings)?))
        }
        "swift" => {
            let settings = config.swift.as_ref().ok_or_else(|| {
                Error::Config("storage \"swift\" selected but no [swift] table".to_string())
            })?;
            Ok(Arc::new(SwiftBackend::new(settings)))
        }
        "none" => Ok(Arc::new(NoneBackend)),
        other => Err(Error::Config(format!("unknown storage backend: \"{other}\""))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("myarchive.toml");
        std::fs::write(
            &file,
            r#"
[archive]
database = "sqlite"
storage = "fs"
cascade_grace_period = 5

[sqlite]
connection_string = "/tmp/catalogue.db"

[fs]
root = "/tmp/archive-root"
"#,
        )
        .unwrap();

        let config = load_config(file.to_str().unwrap()).unwrap();
        assert_eq!(config.archive.database, "sqlite");
        assert_eq!(config.archive.cascade_grace_period, 5);
        assert_eq!(config.archive.max_cascade_cycles, 25);
        assert!(config.sqlite.is_some());
    }

    #[test]
    fn missing_extension_is_a_config_error() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "archive": {
                "database": "sqlite",
                "product_type_extensions": ["UNKNOWN"],
            },
            "sqlite": {"connection_string": ":memory:"},
        }))
        .unwrap();
        let error = open_with_config(&config, Extensions::new()).unwrap_err();
        assert!(error.to_string().contains("not found"), "{error}");
    }
}
