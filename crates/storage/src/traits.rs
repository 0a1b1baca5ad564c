//! Storage backend trait definitions.

use crate::hash::{self, HashAlgorithm};
use async_trait::async_trait;
use muninn_core::{Error, Result};
use std::path::{Path, PathBuf};

/// A scoped scratch directory, removed when dropped.
///
/// Filesystem backends place it under the archive root so the final move
/// into the archive never crosses a mount point.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl TempWorkspace {
    pub fn new(dir: tempfile::TempDir) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Uniform facade over the byte store behind an archive.
///
/// The backend does not know about catalogue state; a product is addressed
/// by `(archive_path, physical_name)`. Multi-part products are wrapped in
/// an enclosing directory named after the physical name.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether products can be stored and retrieved as symbolic links.
    fn supports_symlinks(&self) -> bool {
        false
    }

    /// Displayable location prefix (root directory, bucket, container).
    fn global_prefix(&self) -> String;

    /// Create the storage location.
    async fn prepare(&self) -> Result<()>;

    /// Whether the storage location exists.
    async fn exists(&self) -> Result<bool>;

    /// Remove the storage location and everything in it.
    async fn destroy(&self) -> Result<()>;

    /// Relative path of a product inside the storage.
    fn product_path(&self, archive_path: &str, physical_name: &str) -> String {
        if archive_path.is_empty() {
            physical_name.to_string()
        } else {
            format!("{archive_path}/{physical_name}")
        }
    }

    /// The archive path of files already at their final location inside the
    /// storage, for in-place ingestion. Only meaningful for backends with a
    /// browsable root.
    fn current_archive_path(
        &self,
        _paths: &[PathBuf],
        _physical_name: &str,
        _use_enclosing_directory: bool,
    ) -> Result<String> {
        Err(Error::Storage(
            "this storage backend does not support in-place ingestion".to_string(),
        ))
    }

    /// Whether any bytes exist for the product.
    async fn product_exists(&self, archive_path: &str, physical_name: &str) -> Result<bool>;

    /// Place the given files or directories into storage.
    async fn put(
        &self,
        paths: &[PathBuf],
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        use_symlinks: bool,
    ) -> Result<()>;

    /// Copy (or symlink) a product out of storage into a target directory;
    /// returns the produced paths.
    async fn get(
        &self,
        archive_path: &str,
        physical_name: &str,
        target_dir: &Path,
        use_enclosing_directory: bool,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>>;

    /// Delete a product's bytes. Missing bytes are not an error.
    async fn delete(&self, archive_path: &str, physical_name: &str) -> Result<()>;

    /// Total size of a product's bytes.
    async fn size(&self, archive_path: &str, physical_name: &str) -> Result<u64>;

    /// Move a product to a different archive path within the storage.
    async fn move_to(
        &self,
        archive_path: &str,
        physical_name: &str,
        new_archive_path: &str,
    ) -> Result<()>;

    /// Scratch directory for staging downloads and uploads.
    async fn temp_workspace(&self) -> Result<TempWorkspace>;

    /// Compute the product hash of the stored bytes.
    ///
    /// The default retrieves into a scratch directory and hashes locally,
    /// which keeps fingerprints identical across backends; backends with a
    /// local root override this.
    async fn product_hash(
        &self,
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        algorithm: HashAlgorithm,
    ) -> Result<String> {
        let workspace = self.temp_workspace().await?;
        let paths = self
            .get(
                archive_path,
                physical_name,
                workspace.path(),
                use_enclosing_directory,
                false,
            )
            .await?;
        let paths = if use_enclosing_directory {
            // hash the parts, not the wrapper directory
            let mut parts = Vec::new();
            for path in &paths {
                let mut entries = std::fs::read_dir(path)
                    .map_err(|e| Error::Storage(e.to_string()))?
                    .map(|entry| entry.map(|e| e.path()))
                    .collect::<std::io::Result<Vec<_>>>()
                    .map_err(|e| Error::Storage(e.to_string()))?;
                parts.append(&mut entries);
            }
            parts
        } else {
            paths
        };
        hash::product_hash(&paths, algorithm)
    }
}
