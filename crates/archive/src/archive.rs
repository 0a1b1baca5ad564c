//! The archive orchestrator.
//!
//! An [`Archive`] pairs a catalogue database with a storage backend and a
//! plug-in registry and is the sole authority stepping products through
//! their states. Writes that touch both worlds are two-phase: the catalogue
//! row is reserved with `active = false` before any bytes move, and flipped
//! back only after storage settled, so partial failures stay observable and
//! reclaimable.

use crate::cascade;
use crate::plugin::{AnalyzeResult, ProductTypePlugin, Registry};
use muninn_core::expr::{ParameterValue, Parameters};
use muninn_core::{Error, Properties, Result, SchemaRegistry, Value};
use muninn_database::{DatabaseBackend, SearchQuery, SummaryQuery, SummaryResult};
use muninn_storage::{HashAlgorithm, StorageBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Core fields the analyze step of a rebuild may not override.
const RESTRICTED_CORE_FIELDS: &[&str] = &[
    "uuid",
    "active",
    "hash",
    "size",
    "metadata_date",
    "archive_date",
    "archive_path",
    "product_type",
    "physical_name",
];

/// Tunables carried by an archive handle.
pub struct ArchiveOptions {
    /// Grace period in minutes before cascade rules act on fresh orphans.
    pub cascade_grace_period: i64,
    /// Upper bound on cascade fixed-point iterations.
    pub max_cascade_cycles: u32,
    /// Store products as symbolic links by default (fs storage only).
    pub use_symlinks: bool,
    /// Path of the JSON credentials file for remote fetches.
    pub auth_file: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            cascade_grace_period: 0,
            max_cascade_cycles: 25,
            use_symlinks: false,
            auth_file: None,
        }
    }
}

/// Options for [`Archive::ingest`].
pub struct IngestOptions {
    /// Product type; identified from the paths when unset.
    pub product_type: Option<String>,
    /// Caller-supplied properties; extracted by the plug-in when unset.
    pub properties: Option<Properties>,
    /// Store the bytes; `false` creates a catalogue-only product.
    pub ingest_product: bool,
    /// Override the archive-wide symlink default.
    pub use_symlinks: Option<bool>,
    /// Re-read the stored bytes and match them against the computed hash.
    pub verify_hash: bool,
    /// Keep the files where they are (must be inside the archive root).
    pub use_current_path: bool,
    /// Reclaim an existing product with the same type and name first.
    pub force: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            product_type: None,
            properties: None,
            ingest_product: true,
            use_symlinks: None,
            verify_hash: false,
            use_current_path: false,
            force: false,
        }
    }
}

/// Options for [`Archive::attach`].
#[derive(Default)]
pub struct AttachOptions {
    /// Product type; identified from the paths when unset.
    pub product_type: Option<String>,
    pub use_symlinks: Option<bool>,
    /// Verify the incoming files against the recorded hash before storing.
    pub verify_hash_before: bool,
    /// Verify the stored bytes against the recorded hash afterwards.
    pub verify_hash: bool,
    /// Skip the size-equality check against the catalogue record.
    pub force: bool,
    /// The files are already at their archive location.
    pub use_current_path: bool,
}

/// One archive handle: catalogue, storage and plug-in registry.
pub struct Archive {
    database: Arc<dyn DatabaseBackend>,
    storage: Arc<dyn StorageBackend>,
    schemas: Arc<SchemaRegistry>,
    registry: Registry,
    cascade_grace_period: Duration,
    max_cascade_cycles: u32,
    use_symlinks: bool,
    auth_file: Option<PathBuf>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").finish_non_exhaustive()
    }
}

enum HookPhase {
    Create,
    Ingest,
    Pull,
    Remove,
}

impl Archive {
    pub fn new(
        database: Arc<dyn DatabaseBackend>,
        storage: Arc<dyn StorageBackend>,
        schemas: Arc<SchemaRegistry>,
        registry: Registry,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            database,
            storage,
            schemas,
            registry,
            cascade_grace_period: Duration::minutes(options.cascade_grace_period),
            max_cascade_cycles: options.max_cascade_cycles,
            use_symlinks: options.use_symlinks,
            auth_file: options.auth_file,
        }
    }

    /// A fresh UUID usable as a product identity.
    pub fn generate_uuid() -> Uuid {
        Uuid::new_v4()
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.schemas.names()
    }

    pub fn product_types(&self) -> Vec<String> {
        self.registry.product_types()
    }

    pub fn export_formats(&self) -> Vec<String> {
        self.registry.export_formats()
    }

    /// Path of the credentials file for remote fetches, if configured.
    pub fn auth_file(&self) -> Option<&Path> {
        self.auth_file.as_deref()
    }

    pub(crate) fn database(&self) -> &dyn DatabaseBackend {
        self.database.as_ref()
    }

    pub(crate) fn cascade_grace_period(&self) -> Duration {
        self.cascade_grace_period
    }

    pub(crate) fn max_cascade_cycles(&self) -> u32 {
        self.max_cascade_cycles
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Prepare the archive for (first) use.
    ///
    /// With `force`, an existing catalogue and storage are removed first.
    #[instrument(skip(self))]
    pub async fn prepare(&self, force: bool) -> Result<()> {
        if !force {
            if self.storage.exists().await? {
                return Err(Error::State("storage already exists".to_string()));
            }
            if self.database.exists().await? {
                return Err(Error::State("database already exists".to_string()));
            }
        }
        self.destroy().await?;
        self.database.prepare().await?;
        self.storage.prepare().await
    }

    /// Prepare the catalogue only.
    pub async fn prepare_catalogue(&self) -> Result<()> {
        self.database.prepare().await
    }

    /// Remove the catalogue and all stored products.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        self.destroy_catalogue().await?;
        self.storage.destroy().await
    }

    /// Remove the catalogue, leaving stored bytes untouched.
    pub async fn destroy_catalogue(&self) -> Result<()> {
        if self.database.exists().await? {
            self.database.destroy().await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Properties>> {
        self.database.search(query).await
    }

    pub async fn count(&self, where_clause: &str, parameters: &Parameters) -> Result<i64> {
        self.database.count(where_clause, parameters).await
    }

    pub async fn summary(&self, query: &SummaryQuery) -> Result<SummaryResult> {
        self.database.summary(query).await
    }

    /// Product properties for the given UUID, all namespaces included.
    pub async fn retrieve_properties(&self, uuid: Uuid) -> Result<Properties> {
        self.get_product(uuid).await
    }

    /// Determine the product type of the given files.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<String> {
        self.registry.identify(paths)
    }

    /// Location of a product's bytes, as a displayable path.
    pub async fn product_path(&self, uuid: Uuid) -> Result<String> {
        let product = self
            .first_match(
                "uuid == @uuid",
                &uuid_parameters(uuid),
                &["uuid", "archive_path", "physical_name"],
            )
            .await?;
        let archive_path = product.core_text("archive_path").ok_or_else(|| {
            Error::NotFound(format!("no data available for product ({uuid})"))
        })?;
        let physical_name = physical_name(&product)?;
        let relative = self.storage.product_path(archive_path, physical_name);
        let prefix = self.storage.global_prefix();
        if prefix.is_empty() {
            Ok(relative)
        } else {
            Ok(format!("{prefix}/{relative}"))
        }
    }

    pub async fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.database.derived_products(uuid).await
    }

    pub async fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.database.source_products(uuid).await
    }

    // ------------------------------------------------------------------
    // Links and tags
    // ------------------------------------------------------------------

    /// Record that a product was derived from the given sources.
    pub async fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        if source_uuids.contains(&uuid) {
            return Err(Error::State(format!(
                "product ({uuid}) cannot be linked to itself"
            )));
        }
        self.database.link(uuid, source_uuids).await
    }

    pub async fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        self.database.unlink(uuid, source_uuids).await
    }

    /// Set one or more tags on a product. Empty tags are rejected.
    pub async fn tag(&self, uuid: Uuid, tags: &[String]) -> Result<()> {
        if tags.iter().any(|tag| tag.is_empty()) {
            return Err(Error::State("a tag cannot be empty".to_string()));
        }
        self.database.tag(uuid, tags).await
    }

    pub async fn untag(&self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        self.database.untag(uuid, tags).await
    }

    pub async fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        self.database.tags(uuid).await
    }

    // ------------------------------------------------------------------
    // Catalogue-only property operations
    // ------------------------------------------------------------------

    /// Create a catalogue record. Fails on a UUID, type/name or archive
    /// path/physical name conflict.
    #[instrument(skip(self, properties))]
    pub async fn create_properties(
        &self,
        properties: &mut Properties,
        disable_hooks: bool,
    ) -> Result<()> {
        self.update_metadata_date(properties).await?;
        properties.validate(&self.schemas, false)?;
        self.database.insert_product(properties).await?;

        if !disable_hooks {
            let product_type = product_type(properties)?.to_string();
            let plugin = self.registry.product_type_plugin(&product_type)?;
            self.run_hooks(HookPhase::Create, &plugin, properties).await?;
        }
        Ok(())
    }

    /// Update catalogue properties; the UUID is taken from `core.uuid` when
    /// not given. Namespaces set to the removal sentinel are deleted;
    /// `create_namespaces` inserts namespace records that do not exist yet.
    #[instrument(skip(self, properties))]
    pub async fn update_properties(
        &self,
        properties: &mut Properties,
        uuid: Option<Uuid>,
        create_namespaces: bool,
    ) -> Result<()> {
        let embedded = properties.get("uuid").and_then(|value| value.as_uuid());
        let uuid = match (uuid, embedded) {
            (Some(uuid), Some(embedded)) if uuid != embedded => {
                return Err(Error::State(
                    "specified uuid does not match uuid included in the specified product properties"
                        .to_string(),
                ));
            }
            (Some(uuid), _) => uuid,
            (None, Some(embedded)) => embedded,
            (None, None) => {
                return Err(Error::State(
                    "no uuid specified for property update".to_string(),
                ));
            }
        };

        let new_namespaces = if create_namespaces {
            let existing = self.get_product(uuid).await?;
            properties
                .namespace_names()
                .into_iter()
                .filter(|namespace| {
                    properties.is_defined(namespace) && !existing.is_defined(namespace)
                })
                .collect()
        } else {
            Vec::new()
        };

        self.update_metadata_date(properties).await?;
        properties.validate(&self.schemas, true)?;
        self.database
            .update_product(uuid, properties, &new_namespaces)
            .await
    }

    /// Remove catalogue records matching the expression; bytes in storage
    /// are left alone and no cascade rules run. Returns the number removed.
    pub async fn delete_properties(
        &self,
        where_clause: &str,
        parameters: &Parameters,
    ) -> Result<usize> {
        let products = self
            .search_properties(where_clause, parameters, &["uuid"])
            .await?;
        for product in &products {
            self.database.delete_product(product.core_uuid()?).await?;
        }
        Ok(products.len())
    }

    pub async fn delete_properties_by_uuid(&self, uuid: Uuid) -> Result<()> {
        self.database.delete_product(uuid).await
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Ingest a product. Multiple paths are ingested as one logical
    /// (multi-part) product.
    #[instrument(skip(self, paths, options))]
    pub async fn ingest(&self, paths: &[PathBuf], options: IngestOptions) -> Result<Properties> {
        if paths.is_empty() {
            return Err(Error::State("nothing to ingest".to_string()));
        }
        let paths = resolve_paths(paths)?;

        let mut basenames: Vec<String> = paths
            .iter()
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        basenames.sort();
        basenames.dedup();
        if basenames.len() < paths.len() {
            return Err(Error::State(
                "basename of each part should be unique for multi-part products".to_string(),
            ));
        }

        let product_type = match &options.product_type {
            Some(product_type) => product_type.clone(),
            None => self.identify(&paths)?,
        };
        let plugin = self.registry.product_type_plugin(&product_type)?;
        let use_enclosing_directory = plugin.use_enclosing_directory();

        let (mut properties, tags) = match &options.properties {
            Some(properties) => (properties.clone(), Vec::new()),
            None => {
                let AnalyzeResult { properties, tags } = plugin.analyze(&paths)?;
                (properties, tags)
            }
        };
        if properties.core_text("product_name").unwrap_or_default().is_empty() {
            return Err(Error::Plugin(
                "product_name is required in core properties".to_string(),
            ));
        }

        let uuid = Self::generate_uuid();
        properties.set("uuid", Value::Uuid(uuid));
        properties.set("active", Value::Boolean(false));
        properties.unset("hash");
        properties.set(
            "size",
            Value::Long(product_size_blocking(paths.clone()).await? as i64),
        );
        properties.unset("archive_date");
        properties.unset("archive_path");
        properties.set("product_type", Value::Text(product_type.clone()));

        let physical_name = if use_enclosing_directory {
            plugin.enclosing_directory(&properties)?
        } else if paths.len() == 1 {
            paths[0]
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::State("invalid product path".to_string()))?
        } else {
            return Err(Error::State(
                "cannot determine physical name for multi-part product".to_string(),
            ));
        };
        properties.set("physical_name", Value::Text(physical_name.clone()));

        let archive_path = if options.ingest_product {
            let archive_path = if options.use_current_path {
                self.storage
                    .current_archive_path(&paths, &physical_name, use_enclosing_directory)?
            } else {
                plugin.archive_path(&properties)?
            };
            properties.set("archive_path", Value::Text(archive_path.clone()));
            Some(archive_path)
        } else {
            None
        };

        if options.force {
            self.reclaim_slot(&properties, &paths, use_enclosing_directory)
                .await?;
        }

        // phase one: reserve the catalogue slots before touching any bytes
        self.create_properties(&mut properties, true).await?;

        // phase two: hash and bytes; on failure the reservation stays with
        // active = false so a forced retry can reclaim it
        let outcome: Result<()> = async {
            if let Some(algorithm) = plugin.hash_type() {
                let hash = product_hash_blocking(paths.clone(), algorithm).await?;
                properties.set("hash", Value::Text(hash.clone()));
                self.update_core(uuid, &[("hash", Value::Text(hash))]).await?;
            }

            if let Some(archive_path) = &archive_path {
                let use_symlinks = options.use_symlinks.unwrap_or(self.use_symlinks)
                    && !options.use_current_path;
                self.storage
                    .put(
                        &paths,
                        archive_path,
                        &physical_name,
                        use_enclosing_directory,
                        use_symlinks,
                    )
                    .await?;

                if options.verify_hash
                    && !self
                        .verify_hash("uuid == @uuid", &uuid_parameters(uuid))
                        .await?
                        .is_empty()
                {
                    return Err(Error::Storage(
                        "ingested product has incorrect hash".to_string(),
                    ));
                }

                let archive_date = self.database.server_time_utc().await?;
                properties.set("archive_date", Value::Timestamp(archive_date));
            }
            Ok(())
        }
        .await;
        if let Err(error) = outcome {
            warn!(%uuid, %error, "ingest failed after reservation; product left inactive");
            return Err(error);
        }

        // activate
        properties.set("active", Value::Boolean(true));
        let mut activation = vec![("active", Value::Boolean(true))];
        if let Some(archive_date) = properties.get("archive_date").cloned() {
            activation.push(("archive_date", archive_date));
        }
        self.update_core(uuid, &activation).await?;

        if !tags.is_empty() {
            self.database.tag(uuid, &tags).await?;
        }

        if options.ingest_product {
            self.run_hooks(HookPhase::Ingest, &plugin, &properties).await?;
        } else {
            self.run_hooks(HookPhase::Create, &plugin, &properties).await?;
        }
        Ok(properties)
    }

    /// With `force`, an existing product occupying the same type/name slot
    /// is removed (or, when the incoming files already are the archived
    /// files, only its catalogue record).
    async fn reclaim_slot(
        &self,
        properties: &Properties,
        paths: &[PathBuf],
        use_enclosing_directory: bool,
    ) -> Result<()> {
        let mut parameters = Parameters::new();
        parameters.insert(
            "product_type".to_string(),
            ParameterValue::Single(Value::Text(product_type(properties)?.to_string())),
        );
        parameters.insert(
            "product_name".to_string(),
            ParameterValue::Single(Value::Text(
                properties.core_text("product_name").unwrap_or_default().to_string(),
            )),
        );
        let existing = self
            .search_properties(
                "product_type == @product_type and product_name == @product_name",
                &parameters,
                &["uuid", "active", "product_name", "archive_path", "physical_name", "product_type"],
            )
            .await?;
        let Some(existing) = existing.into_iter().next() else {
            return Ok(());
        };

        match existing.core_text("archive_path") {
            Some(existing_archive_path) => {
                let new_archive_path = properties.core_text("archive_path");
                if new_archive_path != Some(existing_archive_path) {
                    return Err(Error::Conflict(
                        "cannot force ingest because of archive_path mismatch".to_string(),
                    ));
                }
                let physical_name = physical_name(properties)?;
                let in_place = self
                    .storage
                    .current_archive_path(paths, physical_name, use_enclosing_directory)
                    .map(|current| current == existing_archive_path)
                    .unwrap_or(false);
                if in_place {
                    // the incoming files are the archived files: keep them
                    self.delete_properties_by_uuid(existing.core_uuid()?).await
                } else {
                    self.remove_by_uuid(existing.core_uuid()?, true).await?;
                    Ok(())
                }
            }
            None => self.delete_properties_by_uuid(existing.core_uuid()?).await,
        }
    }

    // ------------------------------------------------------------------
    // Attach
    // ------------------------------------------------------------------

    /// Attach files to an existing catalogue record: the inverse of strip.
    ///
    /// The record is looked up by product type and physical name and must
    /// not have bytes in storage yet.
    #[instrument(skip(self, paths, options))]
    pub async fn attach(&self, paths: &[PathBuf], options: AttachOptions) -> Result<Properties> {
        if paths.is_empty() {
            return Err(Error::State("nothing to attach".to_string()));
        }
        let paths = resolve_paths(paths)?;

        let product_type = match &options.product_type {
            Some(product_type) => product_type.clone(),
            None => self.identify(&paths)?,
        };
        let plugin = self.registry.product_type_plugin(&product_type)?;
        let use_enclosing_directory = plugin.use_enclosing_directory();

        let physical_name = if use_enclosing_directory || paths.len() > 1 {
            paths[0]
                .parent()
                .and_then(|parent| parent.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::State("cannot determine physical name".to_string()))?
        } else {
            paths[0]
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::State("invalid product path".to_string()))?
        };

        let mut parameters = Parameters::new();
        parameters.insert(
            "product_type".to_string(),
            ParameterValue::Single(Value::Text(product_type.clone())),
        );
        parameters.insert(
            "physical_name".to_string(),
            ParameterValue::Single(Value::Text(physical_name.clone())),
        );
        let mut product = self
            .first_match(
                "product_type == @product_type and physical_name == @physical_name",
                &parameters,
                &[],
            )
            .await?;
        let uuid = product.core_uuid()?;

        if let Some(archive_path) = product.core_text("archive_path") {
            if self
                .storage
                .product_exists(archive_path, &physical_name)
                .await?
            {
                return Err(Error::State(format!(
                    "product '{physical_name}' ({uuid}) already has data in storage"
                )));
            }
        }

        if !options.force {
            if let Some(recorded) = product.core_long("size") {
                let incoming = product_size_blocking(paths.clone()).await? as i64;
                if incoming != recorded {
                    return Err(Error::State(format!(
                        "size of files to attach ({incoming}) does not match catalogue size ({recorded})"
                    )));
                }
            }
        }

        if options.verify_hash_before {
            if let Some(stored) = product.core_text("hash") {
                let (algorithm, _) = muninn_storage::split_hash(stored);
                let algorithm = algorithm.unwrap_or(HashAlgorithm::Sha1);
                let incoming = product_hash_blocking(paths.clone(), algorithm).await?;
                if incoming != normalize_hash(stored) {
                    return Err(Error::Storage(
                        "files to attach do not match the recorded hash".to_string(),
                    ));
                }
            }
        }

        let archive_path = if options.use_current_path {
            self.storage
                .current_archive_path(&paths, &physical_name, use_enclosing_directory)?
        } else {
            plugin.archive_path(&product)?
        };

        // reserve, move bytes, then activate
        self.update_core(
            uuid,
            &[
                ("active", Value::Boolean(false)),
                ("archive_path", Value::Text(archive_path.clone())),
            ],
        )
        .await?;

        let outcome: Result<()> = async {
            let use_symlinks =
                options.use_symlinks.unwrap_or(self.use_symlinks) && !options.use_current_path;
            self.storage
                .put(
                    &paths,
                    &archive_path,
                    &physical_name,
                    use_enclosing_directory,
                    use_symlinks,
                )
                .await?;

            if options.verify_hash
                && !self
                    .verify_hash("uuid == @uuid", &uuid_parameters(uuid))
                    .await?
                    .is_empty()
            {
                return Err(Error::Storage(
                    "attached product has incorrect hash".to_string(),
                ));
            }
            Ok(())
        }
        .await;
        if let Err(error) = outcome {
            self.update_core(uuid, &[("active", Value::Boolean(true))])
                .await
                .ok();
            self.database
                .clear_core_fields(uuid, &["archive_path".to_string()])
                .await
                .ok();
            return Err(error);
        }

        let size = self.storage.size(&archive_path, &physical_name).await? as i64;
        let archive_date = self.database.server_time_utc().await?;
        let mut updates = vec![
            ("active", Value::Boolean(true)),
            ("archive_date", Value::Timestamp(archive_date)),
            ("size", Value::Long(size)),
        ];
        if product.core_text("hash").is_none() {
            if let Some(algorithm) = plugin.hash_type() {
                let hash = self
                    .storage
                    .product_hash(&archive_path, &physical_name, use_enclosing_directory, algorithm)
                    .await?;
                updates.push(("hash", Value::Text(hash)));
            }
        }
        self.update_core(uuid, &updates).await?;

        for (field, value) in updates {
            product.set(field, value);
        }
        product.set("archive_path", Value::Text(archive_path));
        Ok(product)
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    /// Fetch remote products into storage. Returns the number pulled.
    #[instrument(skip(self, parameters))]
    pub async fn pull(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        verify_hash: bool,
    ) -> Result<usize> {
        let queue = self
            .search(
                &SearchQuery::new(where_clause)
                    .with_parameters(parameters.clone())
                    .with_namespaces(self.namespaces()),
            )
            .await?;
        for product in &queue {
            self.pull_product(product, verify_hash).await?;
        }
        Ok(queue.len())
    }

    async fn pull_product(&self, product: &Properties, verify_hash: bool) -> Result<()> {
        let uuid = product.core_uuid()?;
        let name = product.core_text("product_name").unwrap_or_default().to_string();
        if product.core_bool("active") != Some(true) {
            return Err(Error::State(format!("product '{name}' ({uuid}) not available")));
        }
        if product.core_text("archive_path").is_some() {
            return Err(Error::State(format!(
                "product '{name}' ({uuid}) is already in the local archive"
            )));
        }
        let Some(remote_url) = product.core_text("remote_url").map(|url| url.to_string()) else {
            return Err(Error::State(format!(
                "product '{name}' ({uuid}) does not have a remote_url"
            )));
        };

        let plugin = self.registry.product_type_plugin(product_type(product)?)?;
        let use_enclosing_directory = plugin.use_enclosing_directory();
        let archive_path = plugin.archive_path(product)?;
        let physical_name = physical_name(product)?.to_string();

        // reserve while the bytes are in flight
        self.update_core(
            uuid,
            &[
                ("active", Value::Boolean(false)),
                ("archive_path", Value::Text(archive_path.clone())),
            ],
        )
        .await?;

        let outcome: Result<()> = async {
            let (_workspace, paths) = self.fetch_remote(product, &remote_url).await?;
            self.storage
                .put(&paths, &archive_path, &physical_name, use_enclosing_directory, false)
                .await
        }
        .await;
        if let Err(error) = outcome {
            // reset honestly: the product is remote-only again
            self.update_core(uuid, &[("active", Value::Boolean(true))])
                .await
                .ok();
            self.database
                .clear_core_fields(uuid, &["archive_path".to_string()])
                .await
                .ok();
            return Err(error);
        }

        let size = self.storage.size(&archive_path, &physical_name).await? as i64;
        let archive_date = self.database.server_time_utc().await?;
        self.update_core(
            uuid,
            &[
                ("active", Value::Boolean(true)),
                ("archive_date", Value::Timestamp(archive_date)),
                ("size", Value::Long(size)),
            ],
        )
        .await?;

        if verify_hash
            && product.core_text("hash").is_some()
            && !self
                .verify_hash("uuid == @uuid", &uuid_parameters(uuid))
                .await?
                .is_empty()
        {
            return Err(Error::Storage(format!(
                "pulled product '{name}' ({uuid}) has incorrect hash"
            )));
        }

        self.run_hooks(HookPhase::Pull, &plugin, product).await
    }

    /// Download a remote product into a scratch workspace. HTTP transports
    /// get one retry on timeout. The workspace is returned alongside the
    /// paths; dropping it discards the downloaded files.
    async fn fetch_remote(
        &self,
        product: &Properties,
        url: &str,
    ) -> Result<(muninn_storage::TempWorkspace, Vec<PathBuf>)> {
        let backend = self.registry.remote_backend_for_url(url)?;
        let workspace = self.storage.temp_workspace().await?;
        let paths = match backend.pull(self, product, workspace.path()).await {
            Ok(paths) => paths,
            Err(error) if is_retryable_timeout(url, &error) => {
                warn!(%url, %error, "remote fetch timed out, retrying once");
                backend.pull(self, product, workspace.path()).await?
            }
            Err(error) => return Err(error),
        };
        if paths.is_empty() {
            return Err(Error::Storage(format!(
                "remote backend returned no files for \"{url}\""
            )));
        }
        Ok((workspace, paths))
    }

    // ------------------------------------------------------------------
    // Strip and remove
    // ------------------------------------------------------------------

    /// Delete the bytes of matching products, keeping their catalogue rows.
    /// Returns the number stripped. Cascade rules may strip or remove
    /// derived products along with them.
    #[instrument(skip(self, parameters))]
    pub async fn strip(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        force: bool,
    ) -> Result<usize> {
        let query = if where_clause.is_empty() {
            "is_defined(archive_path)".to_string()
        } else {
            format!("is_defined(archive_path) and ({where_clause})")
        };
        let products = self
            .search_properties(
                &query,
                parameters,
                &["uuid", "active", "product_name", "archive_path", "physical_name", "product_type"],
            )
            .await?;
        for product in &products {
            self.ensure_available(product, force)?;
            self.strip_product(product).await?;
        }
        if !products.is_empty() {
            cascade::establish_invariants(self).await?;
        }
        Ok(products.len())
    }

    pub async fn strip_by_uuid(&self, uuid: Uuid) -> Result<()> {
        let count = self
            .strip("uuid == @uuid", &uuid_parameters(uuid), false)
            .await?;
        if count == 0 {
            return Err(Error::NotFound(format!(
                "product with uuid '{uuid}' not found"
            )));
        }
        Ok(())
    }

    /// Remove matching products from catalogue and storage. Returns the
    /// number removed (cascaded removals not included).
    #[instrument(skip(self, parameters))]
    pub async fn remove(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        force: bool,
    ) -> Result<usize> {
        let products = self
            .search_properties(
                where_clause,
                parameters,
                &["uuid", "active", "product_name", "archive_path", "physical_name", "product_type"],
            )
            .await?;
        for product in &products {
            self.ensure_available(product, force)?;
            self.purge_product(product).await?;
        }
        if !products.is_empty() {
            cascade::establish_invariants(self).await?;
        }
        Ok(products.len())
    }

    pub async fn remove_by_uuid(&self, uuid: Uuid, force: bool) -> Result<usize> {
        let count = self
            .remove("uuid == @uuid", &uuid_parameters(uuid), force)
            .await?;
        if count == 0 {
            return Err(Error::NotFound(format!(
                "product with uuid '{uuid}' not found"
            )));
        }
        Ok(count)
    }

    pub async fn remove_by_name(&self, product_name: &str, force: bool) -> Result<usize> {
        let mut parameters = Parameters::new();
        parameters.insert(
            "product_name".to_string(),
            ParameterValue::Single(Value::Text(product_name.to_string())),
        );
        let count = self
            .remove("product_name == @product_name", &parameters, force)
            .await?;
        if count == 0 {
            return Err(Error::NotFound(format!(
                "no products found with name '{product_name}'"
            )));
        }
        Ok(count)
    }

    fn ensure_available(&self, product: &Properties, force: bool) -> Result<()> {
        if product.core_bool("active") != Some(true) && !force {
            return Err(Error::State(format!(
                "product '{}' ({}) not available",
                product.core_text("product_name").unwrap_or_default(),
                product.core_uuid()?,
            )));
        }
        Ok(())
    }

    /// Catalogue row stays; bytes and archive fields go.
    pub(crate) async fn strip_product(&self, product: &Properties) -> Result<()> {
        let uuid = product.core_uuid()?;
        self.update_core(uuid, &[("active", Value::Boolean(true))]).await?;
        self.database
            .clear_core_fields(
                uuid,
                &["archive_path".to_string(), "archive_date".to_string()],
            )
            .await?;
        self.remove_bytes(product).await
    }

    /// Catalogue row and bytes both go; post-remove hooks run last, in
    /// reverse registration order.
    pub(crate) async fn purge_product(&self, product: &Properties) -> Result<()> {
        let uuid = product.core_uuid()?;
        let full = self.get_product(uuid).await?;
        self.database.delete_product(uuid).await?;
        self.remove_bytes(&full).await?;

        let plugin = self.registry.product_type_plugin(product_type(&full)?)?;
        self.run_hooks(HookPhase::Remove, &plugin, &full).await
    }

    async fn remove_bytes(&self, product: &Properties) -> Result<()> {
        if let Some(archive_path) = product.core_text("archive_path") {
            self.storage
                .delete(archive_path, physical_name(product)?)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retrieve and export
    // ------------------------------------------------------------------

    /// Copy (or symlink) matching products into a target directory and
    /// return the produced paths. Products without local bytes but with a
    /// remote URL are fetched transparently.
    #[instrument(skip(self, parameters))]
    pub async fn retrieve(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let products = self
            .search_properties(
                where_clause,
                parameters,
                &[
                    "uuid",
                    "active",
                    "product_type",
                    "product_name",
                    "archive_path",
                    "physical_name",
                    "remote_url",
                ],
            )
            .await?;
        let mut result = Vec::with_capacity(products.len());
        for product in &products {
            result.extend(self.retrieve_product(product, target_dir, use_symlinks).await?);
        }
        Ok(result)
    }

    pub async fn retrieve_by_uuid(
        &self,
        uuid: Uuid,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        let paths = self
            .retrieve("uuid == @uuid", &uuid_parameters(uuid), target_dir, use_symlinks)
            .await?;
        paths.into_iter().next().ok_or_else(|| {
            Error::NotFound(format!("product with uuid '{uuid}' not found"))
        })
    }

    async fn retrieve_product(
        &self,
        product: &Properties,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let uuid = product.core_uuid()?;
        let name = product.core_text("product_name").unwrap_or_default();
        if product.core_bool("active") != Some(true) {
            return Err(Error::State(format!("product '{name}' ({uuid}) not available")));
        }

        match product.core_text("archive_path") {
            Some(archive_path) => {
                let plugin = self.registry.product_type_plugin(product_type(product)?)?;
                self.storage
                    .get(
                        archive_path,
                        physical_name(product)?,
                        target_dir,
                        plugin.use_enclosing_directory(),
                        use_symlinks,
                    )
                    .await
            }
            None => match product.core_text("remote_url") {
                // no local bytes: fall back to a transparent remote fetch
                Some(remote_url) => {
                    let remote_url = remote_url.to_string();
                    let (_workspace, paths) = self.fetch_remote(product, &remote_url).await?;
                    let mut result = Vec::with_capacity(paths.len());
                    for path in paths {
                        let name = path.file_name().ok_or_else(|| {
                            Error::Storage(format!("invalid downloaded path: {}", path.display()))
                        })?;
                        let target = target_dir.join(name);
                        if std::fs::rename(&path, &target).is_err() {
                            std::fs::copy(&path, &target)
                                .map_err(|e| Error::Storage(e.to_string()))?;
                        }
                        result.push(target);
                    }
                    Ok(result)
                }
                None => Err(Error::State(format!(
                    "product '{name}' ({uuid}) not available"
                ))),
            },
        }
    }

    /// Export matching products, through the plug-in's export hook when it
    /// has one, as a plain retrieve otherwise.
    #[instrument(skip(self, parameters))]
    pub async fn export(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        target_dir: &Path,
        format: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        if let Some(format) = format {
            if !format.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                || format.is_empty()
            {
                return Err(Error::State(format!("invalid export format '{format}'")));
            }
        }

        let products = self
            .search(
                &SearchQuery::new(where_clause)
                    .with_parameters(parameters.clone())
                    .with_namespaces(self.namespaces()),
            )
            .await?;
        let mut result = Vec::with_capacity(products.len());
        for product in &products {
            let uuid = product.core_uuid()?;
            let name = product.core_text("product_name").unwrap_or_default();
            if product.core_bool("active") != Some(true) {
                return Err(Error::State(format!("product '{name}' ({uuid}) not available")));
            }
            let plugin = self.registry.product_type_plugin(product_type(product)?)?;
            match plugin.export(self, product, format, target_dir).await? {
                Some(path) => result.push(path),
                None => match format {
                    Some(format) => {
                        return Err(Error::State(format!(
                            "export format '{format}' not supported for product '{name}' ({uuid})"
                        )));
                    }
                    None => {
                        result.extend(self.retrieve_product(product, target_dir, false).await?);
                    }
                },
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Rebuild and verification
    // ------------------------------------------------------------------

    /// Re-extract properties from the stored bytes and merge the result.
    /// Fields the plug-in does not return are preserved; restricted core
    /// fields are never overridden by the plug-in.
    #[instrument(skip(self))]
    pub async fn rebuild_properties(
        &self,
        uuid: Uuid,
        disable_hooks: bool,
        use_current_path: bool,
    ) -> Result<()> {
        let product = self.get_product(uuid).await?;
        if product.core_bool("active") != Some(true) {
            return Err(Error::State(format!(
                "product '{}' ({uuid}) not available",
                product.core_text("product_name").unwrap_or_default()
            )));
        }
        let archive_path = product
            .core_text("archive_path")
            .ok_or_else(|| {
                Error::State(format!("no data available for product ({uuid})"))
            })?
            .to_string();
        let physical_name = physical_name(&product)?.to_string();
        let plugin = self.registry.product_type_plugin(product_type(&product)?)?;
        let use_enclosing_directory = plugin.use_enclosing_directory();

        // run analyze against a scratch copy of the stored bytes
        let workspace = self.storage.temp_workspace().await?;
        let local = self
            .storage
            .get(
                &archive_path,
                &physical_name,
                workspace.path(),
                use_enclosing_directory,
                false,
            )
            .await?;
        let analyze_paths = if use_enclosing_directory {
            list_directory(&local[0])?
        } else {
            local
        };
        let AnalyzeResult {
            properties: mut rebuilt,
            tags,
        } = plugin.analyze(&analyze_paths)?;

        for field in RESTRICTED_CORE_FIELDS {
            rebuilt.unset(field);
        }

        rebuilt.set(
            "size",
            Value::Long(self.storage.size(&archive_path, &physical_name).await? as i64),
        );

        // make sure the product sits where the plug-in wants it
        let mut current_archive_path = archive_path.clone();
        if !use_current_path {
            let mut merged = product.clone();
            merged.merge(&rebuilt);
            let wanted = plugin.archive_path(&merged)?;
            if wanted != current_archive_path {
                self.storage
                    .move_to(&current_archive_path, &physical_name, &wanted)
                    .await?;
                rebuilt.set("archive_path", Value::Text(wanted.clone()));
                current_archive_path = wanted;
            }
        }

        // hash maintenance: follow the plug-in's current hash policy
        let mut clear_fields = Vec::new();
        let stored_hash = product.core_text("hash").map(|hash| hash.to_string());
        match plugin.hash_type() {
            None => {
                if stored_hash.is_some() {
                    clear_fields.push("hash".to_string());
                }
            }
            Some(algorithm) => match &stored_hash {
                None => {
                    let hash = self
                        .storage
                        .product_hash(
                            &current_archive_path,
                            &physical_name,
                            use_enclosing_directory,
                            algorithm,
                        )
                        .await?;
                    rebuilt.set("hash", Value::Text(hash));
                }
                Some(stored) => {
                    let (stored_algorithm, digest) = muninn_storage::split_hash(stored);
                    match stored_algorithm {
                        None if algorithm == HashAlgorithm::Sha1 => {
                            rebuilt.set("hash", Value::Text(format!("sha1:{digest}")));
                        }
                        Some(stored_algorithm) if stored_algorithm == algorithm => {}
                        _ => {
                            let hash = self
                                .storage
                                .product_hash(
                                    &current_archive_path,
                                    &physical_name,
                                    use_enclosing_directory,
                                    algorithm,
                                )
                                .await?;
                            rebuilt.set("hash", Value::Text(hash));
                        }
                    }
                }
            },
        }

        self.update_properties(&mut rebuilt, Some(uuid), true).await?;
        if !clear_fields.is_empty() {
            self.database.clear_core_fields(uuid, &clear_fields).await?;
        }
        if !tags.is_empty() {
            self.tag(uuid, &tags).await?;
        }

        if !disable_hooks {
            let mut updated = product;
            updated.merge(&rebuilt);
            self.run_hooks(HookPhase::Ingest, &plugin, &updated).await?;
        }
        Ok(())
    }

    /// Refresh the catalogue record of a pulled product from its stored
    /// bytes (size, location, optionally hash verification).
    #[instrument(skip(self))]
    pub async fn rebuild_pull_properties(
        &self,
        uuid: Uuid,
        verify_hash: bool,
        disable_hooks: bool,
        use_current_path: bool,
    ) -> Result<()> {
        let mut product = self.get_product(uuid).await?;
        let Some(archive_path) = product.core_text("archive_path").map(|s| s.to_string()) else {
            return Err(Error::State("cannot update missing product".to_string()));
        };
        if product.core_text("remote_url").is_none() {
            return Err(Error::State(
                "cannot pull products that have no remote_url".to_string(),
            ));
        }
        let physical_name = physical_name(&product)?.to_string();
        let plugin = self.registry.product_type_plugin(product_type(&product)?)?;

        let mut current_archive_path = archive_path;
        if !use_current_path {
            let wanted = plugin.archive_path(&product)?;
            if wanted != current_archive_path {
                self.storage
                    .move_to(&current_archive_path, &physical_name, &wanted)
                    .await?;
                self.update_core(uuid, &[("archive_path", Value::Text(wanted.clone()))])
                    .await?;
                product.set("archive_path", Value::Text(wanted.clone()));
                current_archive_path = wanted;
            }
        }

        let size = self.storage.size(&current_archive_path, &physical_name).await? as i64;
        self.update_core(uuid, &[("size", Value::Long(size))]).await?;
        product.set("size", Value::Long(size));

        if verify_hash
            && product.core_text("hash").is_some()
            && !self
                .verify_hash("uuid == @uuid", &uuid_parameters(uuid))
                .await?
                .is_empty()
        {
            return Err(Error::Storage(format!(
                "pulled product ({uuid}) has incorrect hash"
            )));
        }

        if !disable_hooks {
            self.run_hooks(HookPhase::Pull, &plugin, &product).await?;
        }
        Ok(())
    }

    /// Verify stored bytes against recorded hashes. Returns the UUIDs of
    /// products whose verification failed.
    #[instrument(skip(self, parameters))]
    pub async fn verify_hash(
        &self,
        where_clause: &str,
        parameters: &Parameters,
    ) -> Result<Vec<Uuid>> {
        let products = self
            .search_properties(
                where_clause,
                parameters,
                &[
                    "uuid",
                    "active",
                    "product_name",
                    "archive_path",
                    "physical_name",
                    "hash",
                    "product_type",
                ],
            )
            .await?;
        let mut failed = Vec::new();
        for product in &products {
            let Some(archive_path) = product.core_text("archive_path") else {
                continue;
            };
            let uuid = product.core_uuid()?;
            let stored = product.core_text("hash").ok_or_else(|| {
                Error::State(format!(
                    "no hash available for product '{}' ({uuid})",
                    product.core_text("product_name").unwrap_or_default()
                ))
            })?;
            let (algorithm, _) = muninn_storage::split_hash(stored);
            let algorithm = algorithm.unwrap_or(HashAlgorithm::Sha1);
            let plugin = self.registry.product_type_plugin(product_type(product)?)?;
            let current = self
                .storage
                .product_hash(
                    archive_path,
                    physical_name(product)?,
                    plugin.use_enclosing_directory(),
                    algorithm,
                )
                .await?;
            if current != normalize_hash(stored) {
                failed.push(uuid);
            }
        }
        Ok(failed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn get_product(&self, uuid: Uuid) -> Result<Properties> {
        self.first_match("uuid == @uuid", &uuid_parameters(uuid), &[])
            .await
    }

    /// The single product matching the expression; all namespaces when no
    /// property projection is given.
    async fn first_match(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        property_names: &[&str],
    ) -> Result<Properties> {
        let mut query = SearchQuery::new(where_clause).with_parameters(parameters.clone());
        if property_names.is_empty() {
            query = query.with_namespaces(self.namespaces());
        } else {
            query = query.with_property_names(property_names);
        }
        self.search(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("no product found".to_string()))
    }

    async fn search_properties(
        &self,
        where_clause: &str,
        parameters: &Parameters,
        property_names: &[&str],
    ) -> Result<Vec<Properties>> {
        self.search(
            &SearchQuery::new(where_clause)
                .with_parameters(parameters.clone())
                .with_property_names(property_names),
        )
        .await
    }

    async fn update_core(&self, uuid: Uuid, fields: &[(&str, Value)]) -> Result<()> {
        let mut update = Properties::new();
        for (field, value) in fields {
            update.set(field, value.clone());
        }
        self.database.update_product(uuid, &update, &[]).await
    }

    async fn update_metadata_date(&self, properties: &mut Properties) -> Result<()> {
        let now = self.database.server_time_utc().await?;
        properties.set("metadata_date", Value::Timestamp(now));
        Ok(())
    }

    /// Run a post-phase hook on the product type plug-in and every hook
    /// extension. Hooks run after the catalogue settled; failures surface
    /// to the caller but roll nothing back.
    async fn run_hooks(
        &self,
        phase: HookPhase,
        plugin: &Arc<dyn ProductTypePlugin>,
        properties: &Properties,
    ) -> Result<()> {
        let extensions = self.registry.hook_extensions();

        let result: Result<()> = async {
            match phase {
                HookPhase::Create => {
                    plugin.post_create_hook(self, properties).await?;
                    for extension in &extensions {
                        extension.post_create_hook(self, properties).await?;
                    }
                }
                HookPhase::Ingest => {
                    plugin.post_ingest_hook(self, properties).await?;
                    for extension in &extensions {
                        extension.post_ingest_hook(self, properties).await?;
                    }
                }
                HookPhase::Pull => {
                    plugin.post_pull_hook(self, properties).await?;
                    for extension in &extensions {
                        extension.post_pull_hook(self, properties).await?;
                    }
                }
                HookPhase::Remove => {
                    // teardown mirrors setup: extensions first, reversed
                    for extension in extensions.iter().rev() {
                        extension.post_remove_hook(self, properties).await?;
                    }
                    plugin.post_remove_hook(self, properties).await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(error) = &result {
            warn!(%error, "hook failed after commit");
        }
        result
    }
}

fn product_type(properties: &Properties) -> Result<&str> {
    properties
        .core_text("product_type")
        .ok_or_else(|| Error::Schema("core.product_type is not set".to_string()))
}

fn physical_name(properties: &Properties) -> Result<&str> {
    properties
        .core_text("physical_name")
        .ok_or_else(|| Error::Schema("core.physical_name is not set".to_string()))
}

fn uuid_parameters(uuid: Uuid) -> Parameters {
    let mut parameters = Parameters::new();
    parameters.insert("uuid".to_string(), ParameterValue::Single(Value::Uuid(uuid)));
    parameters
}

/// Canonicalize incoming paths so error messages are useful and symbolic
/// links created during ingest cannot dangle.
fn resolve_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|path| {
            path.canonicalize().map_err(|e| {
                Error::Storage(format!("cannot resolve '{}' [{e}]", path.display()))
            })
        })
        .collect()
}

fn list_directory(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
        .map_err(|e| Error::Storage(format!("cannot list '{}': {e}", path.display())))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Storage(e.to_string()))?;
    entries.sort();
    Ok(entries)
}

fn normalize_hash(stored: &str) -> String {
    match muninn_storage::split_hash(stored) {
        (Some(_), _) => stored.to_string(),
        (None, digest) => format!("sha1:{digest}"),
    }
}

fn is_retryable_timeout(url: &str, error: &Error) -> bool {
    (url.starts_with("http://") || url.starts_with("https://"))
        && matches!(error, Error::Storage(message) if message.to_lowercase().contains("timeout"))
}

async fn product_size_blocking(paths: Vec<PathBuf>) -> Result<u64> {
    tokio::task::spawn_blocking(move || muninn_storage::product_size(&paths))
        .await
        .map_err(|e| Error::Storage(format!("storage task failed: {e}")))?
}

async fn product_hash_blocking(paths: Vec<PathBuf>, algorithm: HashAlgorithm) -> Result<String> {
    tokio::task::spawn_blocking(move || muninn_storage::product_hash(&paths, algorithm))
        .await
        .map_err(|e| Error::Storage(format!("storage task failed: {e}")))?
}
