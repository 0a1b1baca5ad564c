//! Plug-in interfaces and the run-time registry.
//!
//! Product type plug-ins, remote backends and hook extensions are explicit
//! objects registered when the archive is opened; there is no ambient
//! lookup. The registry resolves a product type to its plug-in, a remote
//! URL to a transport, and keeps hook extensions in registration order.

use crate::archive::Archive;
use async_trait::async_trait;
use muninn_core::{Error, Properties, Result};
use muninn_storage::HashAlgorithm;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Policy for propagating strip/remove through the link graph.
///
/// The left action applies when all of a product's sources were removed,
/// the right one when all of them were stripped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CascadeRule {
    /// Never touch derived products.
    #[default]
    Ignore,
    /// removed: strip, stripped: keep.
    CascadePurgeAsStrip,
    /// removed: remove, stripped: keep.
    CascadePurge,
    /// removed: strip, stripped: strip.
    Strip,
    /// removed: remove, stripped: strip.
    Cascade,
    /// removed: remove, stripped: remove.
    Purge,
}

/// Properties and tags extracted from a product's files.
#[derive(Clone, Debug, Default)]
pub struct AnalyzeResult {
    pub properties: Properties,
    pub tags: Vec<String>,
}

impl From<Properties> for AnalyzeResult {
    fn from(properties: Properties) -> Self {
        Self {
            properties,
            tags: Vec::new(),
        }
    }
}

/// Type-specific behavior for one product type.
#[async_trait]
pub trait ProductTypePlugin: Send + Sync {
    /// The product type this plug-in handles.
    fn product_type(&self) -> &str;

    /// Whether products are wrapped in an enclosing directory (required for
    /// multi-part products).
    fn use_enclosing_directory(&self) -> bool;

    /// Hash algorithm for product content, `None` to disable hashing.
    fn hash_type(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::Md5)
    }

    fn cascade_rule(&self) -> CascadeRule {
        CascadeRule::Ignore
    }

    /// Extension namespaces this plug-in fills in.
    fn namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the given files form a product of this type.
    fn identify(&self, paths: &[PathBuf]) -> bool;

    /// Extract properties (and optionally tags) from the product files.
    fn analyze(&self, paths: &[PathBuf]) -> Result<AnalyzeResult>;

    /// Name of the enclosing directory for multi-part products.
    fn enclosing_directory(&self, _properties: &Properties) -> Result<String> {
        Err(Error::Plugin(format!(
            "product type \"{}\" does not define an enclosing directory",
            self.product_type()
        )))
    }

    /// Relative directory inside the archive where the product belongs.
    fn archive_path(&self, properties: &Properties) -> Result<String>;

    /// Alternative export formats this plug-in implements.
    fn export_formats(&self) -> Vec<String> {
        Vec::new()
    }

    /// Export a product; `format` is `None` for the plug-in's default
    /// export. Returning `Ok(None)` means the plug-in has no custom export
    /// and the archive falls back to a plain retrieve.
    async fn export(
        &self,
        _archive: &Archive,
        _product: &Properties,
        _format: Option<&str>,
        _target_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    async fn post_create_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_ingest_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_pull_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_remove_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }
}

/// Transport for fetching remote products into the archive.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Whether this backend handles the given URL.
    fn identify(&self, url: &str) -> bool;

    /// Download the product into the target directory and return the
    /// downloaded paths. Retries within one attempt are the backend's
    /// responsibility; timeouts should surface as retryable storage errors.
    async fn pull(
        &self,
        archive: &Archive,
        product: &Properties,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>>;
}

/// A bag of optional post-phase hooks, run across the registry in
/// registration order (reverse order after removal).
#[async_trait]
pub trait HookExtension: Send + Sync {
    async fn post_create_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_ingest_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_pull_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn post_remove_hook(&self, _archive: &Archive, _properties: &Properties) -> Result<()> {
        Ok(())
    }
}

/// The four plug-in tables behind one archive handle.
#[derive(Default)]
pub struct Registry {
    product_types: Vec<Arc<dyn ProductTypePlugin>>,
    remote_backends: Vec<(String, Arc<dyn RemoteBackend>)>,
    hook_extensions: Vec<(String, Arc<dyn HookExtension>)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_product_type(&mut self, plugin: Arc<dyn ProductTypePlugin>) -> Result<()> {
        let product_type = plugin.product_type().to_string();
        if self
            .product_types
            .iter()
            .any(|existing| existing.product_type() == product_type)
        {
            return Err(Error::Config(format!(
                "redefinition of product type: \"{product_type}\""
            )));
        }
        self.product_types.push(plugin);
        Ok(())
    }

    pub fn product_type_plugin(&self, product_type: &str) -> Result<Arc<dyn ProductTypePlugin>> {
        self.product_types
            .iter()
            .find(|plugin| plugin.product_type() == product_type)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "undefined product type: \"{product_type}\"; defined product types: {}",
                    self.product_types().join(", ")
                ))
            })
    }

    pub fn product_types(&self) -> Vec<String> {
        self.product_types
            .iter()
            .map(|plugin| plugin.product_type().to_string())
            .collect()
    }

    pub fn product_type_plugins(&self) -> impl Iterator<Item = &Arc<dyn ProductTypePlugin>> {
        self.product_types.iter()
    }

    /// The product type of the first plug-in that recognizes the paths.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<String> {
        for plugin in &self.product_types {
            if plugin.identify(paths) {
                return Ok(plugin.product_type().to_string());
            }
        }
        Err(Error::NotFound(format!(
            "unable to identify product: {paths:?}"
        )))
    }

    pub fn register_remote_backend(
        &mut self,
        name: &str,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<()> {
        if self.remote_backends.iter().any(|(existing, _)| existing == name) {
            return Err(Error::Config(format!(
                "redefinition of remote backend: \"{name}\""
            )));
        }
        self.remote_backends.push((name.to_string(), backend));
        Ok(())
    }

    pub fn remote_backend(&self, name: &str) -> Result<Arc<dyn RemoteBackend>> {
        self.remote_backends
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, backend)| backend.clone())
            .ok_or_else(|| Error::Config(format!("undefined remote backend: \"{name}\"")))
    }

    /// The first remote backend that recognizes the URL.
    pub fn remote_backend_for_url(&self, url: &str) -> Result<Arc<dyn RemoteBackend>> {
        self.remote_backends
            .iter()
            .find(|(_, backend)| backend.identify(url))
            .map(|(_, backend)| backend.clone())
            .ok_or_else(|| {
                Error::Config(format!("no remote backend available for URL \"{url}\""))
            })
    }

    pub fn remote_backends(&self) -> Vec<String> {
        self.remote_backends
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn register_hook_extension(
        &mut self,
        name: &str,
        extension: Arc<dyn HookExtension>,
    ) -> Result<()> {
        if self.hook_extensions.iter().any(|(existing, _)| existing == name) {
            return Err(Error::Config(format!(
                "redefinition of hook extension: \"{name}\""
            )));
        }
        self.hook_extensions.push((name.to_string(), extension));
        Ok(())
    }

    pub fn hook_extension(&self, name: &str) -> Result<Arc<dyn HookExtension>> {
        self.hook_extensions
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, extension)| extension.clone())
            .ok_or_else(|| Error::Config(format!("undefined hook extension: \"{name}\"")))
    }

    /// Hook extensions in registration order.
    pub fn hook_extensions(&self) -> Vec<Arc<dyn HookExtension>> {
        self.hook_extensions
            .iter()
            .map(|(_, extension)| extension.clone())
            .collect()
    }

    /// Export formats contributed by all registered plug-ins.
    pub fn export_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .product_types
            .iter()
            .flat_map(|plugin| plugin.export_formats())
            .collect();
        formats.sort();
        formats.dedup();
        formats
    }
}
