//! Catalogue-only storage backend.
//!
//! Every byte-carrying operation is refused; deletes are no-ops so that
//! catalogue removal still works. Products managed with this backend carry
//! their whereabouts in `remote_url` only.

use crate::hash::HashAlgorithm;
use crate::traits::{StorageBackend, TempWorkspace};
use async_trait::async_trait;
use muninn_core::{Error, Result};
use std::path::{Path, PathBuf};

pub struct NoneBackend;

fn unsupported(operation: &str) -> Error {
    Error::Storage(format!(
        "storage backend \"none\" does not support {operation}"
    ))
}

#[async_trait]
impl StorageBackend for NoneBackend {
    fn global_prefix(&self) -> String {
        String::new()
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(false)
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn product_exists(&self, _archive_path: &str, _physical_name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn put(
        &self,
        _paths: &[PathBuf],
        _archive_path: &str,
        _physical_name: &str,
        _use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<()> {
        Err(unsupported("storing products"))
    }

    async fn get(
        &self,
        _archive_path: &str,
        _physical_name: &str,
        _target_dir: &Path,
        _use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        Err(unsupported("retrieving products"))
    }

    async fn delete(&self, _archive_path: &str, _physical_name: &str) -> Result<()> {
        Ok(())
    }

    async fn size(&self, _archive_path: &str, _physical_name: &str) -> Result<u64> {
        Err(unsupported("sizing products"))
    }

    async fn move_to(
        &self,
        _archive_path: &str,
        _physical_name: &str,
        _new_archive_path: &str,
    ) -> Result<()> {
        Err(unsupported("moving products"))
    }

    async fn temp_workspace(&self) -> Result<TempWorkspace> {
        let dir = tempfile::Builder::new()
            .prefix(".muninn-")
            .tempdir()
            .map_err(|e| Error::Storage(format!("cannot create temporary workspace: {e}")))?;
        Ok(TempWorkspace::new(dir))
    }

    async fn product_hash(
        &self,
        _archive_path: &str,
        _physical_name: &str,
        _use_enclosing_directory: bool,
        _algorithm: HashAlgorithm,
    ) -> Result<String> {
        Err(unsupported("hashing products"))
    }
}
