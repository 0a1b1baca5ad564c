//! Local filesystem storage backend.
//!
//! Products are staged in a hidden temporary directory next to their final
//! destination and moved into place with a rename, so a crash never leaves
//! a half-written product at its catalogue location and the final move
//! never crosses a mount point. Intra-archive symbolic links are created
//! relative, which keeps the archive relocatable.

use crate::hash::{self, HashAlgorithm};
use crate::traits::{StorageBackend, TempWorkspace};
use async_trait::async_trait;
use muninn_core::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn absolute_product_path(&self, archive_path: &str, physical_name: &str) -> PathBuf {
        self.root.join(archive_path).join(physical_name)
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(operation)
            .await
            .map_err(|e| Error::Storage(format!("storage task failed: {e}")))?
    }
}

fn io_error(context: &str, error: std::io::Error) -> Error {
    Error::Storage(format!("{context} [{error}]"))
}

/// Whether `path` is inside `base` (or equal to it), after resolving links.
fn is_sub_path(path: &Path, base: &Path, allow_equal: bool) -> bool {
    let (Ok(path), Ok(base)) = (canonical(path), canonical(base)) else {
        return false;
    };
    if path == base {
        return allow_equal;
    }
    path.starts_with(&base)
}

/// Canonicalize, tolerating a missing leaf by resolving its parent.
fn canonical(path: &Path) -> std::io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(path) => Ok(path),
        Err(_) => {
            let parent = path.parent().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no parent path")
            })?;
            let name = path.file_name().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name")
            })?;
            Ok(parent.canonicalize()?.join(name))
        }
    }
}

/// Relative path from `base` to `target` (both absolute).
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target_components: Vec<Component> = target.components().collect();
    let base_components: Vec<Component> = base.components().collect();
    let mut common = 0;
    while common < target_components.len()
        && common < base_components.len()
        && target_components[common] == base_components[common]
    {
        common += 1;
    }
    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    relative
}

fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
            .map_err(|e| io_error("cannot create symbolic link", e))
    }
    #[cfg(not(unix))]
    {
        let _ = (target, link);
        Err(Error::Storage(
            "symbolic links are not supported on this platform".to_string(),
        ))
    }
}

/// Copy a file or directory tree into `target_dir`, keeping the base name.
fn copy_into(source: &Path, target_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::Storage(format!("invalid source path: {}", source.display())))?;
    let target = target_dir.join(name);
    copy_tree(source, &target)?;
    Ok(target)
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::metadata(source)
        .map_err(|e| io_error(&format!("cannot stat '{}'", source.display()), e))?;
    if metadata.is_dir() {
        fs::create_dir_all(target)
            .map_err(|e| io_error(&format!("cannot create '{}'", target.display()), e))?;
        for entry in fs::read_dir(source)
            .map_err(|e| io_error(&format!("cannot list '{}'", source.display()), e))?
        {
            let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
            copy_tree(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(source, target)
            .map_err(|e| io_error(&format!("cannot copy to '{}'", target.display()), e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn supports_symlinks(&self) -> bool {
        true
    }

    fn global_prefix(&self) -> String {
        self.root.display().to_string()
    }

    async fn prepare(&self) -> Result<()> {
        let root = self.root.clone();
        self.blocking(move || {
            fs::create_dir_all(&root).map_err(|e| {
                io_error(&format!("unable to create archive root path '{}'", root.display()), e)
            })
        })
        .await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.root.is_dir())
    }

    async fn destroy(&self) -> Result<()> {
        let root = self.root.clone();
        self.blocking(move || {
            if root.is_dir() {
                fs::remove_dir_all(&root).map_err(|e| {
                    io_error(&format!("unable to remove archive root path '{}'", root.display()), e)
                })?;
            }
            Ok(())
        })
        .await
    }

    fn current_archive_path(
        &self,
        paths: &[PathBuf],
        physical_name: &str,
        use_enclosing_directory: bool,
    ) -> Result<String> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| io_error("cannot resolve archive root", e))?;
        let mut real_paths = Vec::with_capacity(paths.len());
        for path in paths {
            let real = path
                .canonicalize()
                .map_err(|e| io_error(&format!("cannot resolve '{}'", path.display()), e))?;
            if !is_sub_path(&real, &root, true) {
                return Err(Error::State(
                    "cannot ingest a file in-place if it is not inside the archive root"
                        .to_string(),
                ));
            }
            real_paths.push(real);
        }

        let container = if use_enclosing_directory || real_paths.len() > 1 {
            let parent = real_paths[0]
                .parent()
                .ok_or_else(|| Error::Storage("path has no parent".to_string()))?;
            if parent.file_name().map(|n| n.to_string_lossy()) != Some(physical_name.into()) {
                return Err(Error::State(
                    "multi-part product has invalid enclosing directory for in-place ingestion"
                        .to_string(),
                ));
            }
            parent
                .parent()
                .ok_or_else(|| Error::Storage("path has no parent".to_string()))?
        } else {
            real_paths[0]
                .parent()
                .ok_or_else(|| Error::Storage("path has no parent".to_string()))?
        };
        Ok(relative_to(container, &root).to_string_lossy().into_owned())
    }

    async fn product_exists(&self, archive_path: &str, physical_name: &str) -> Result<bool> {
        let path = self.absolute_product_path(archive_path, physical_name);
        Ok(fs::symlink_metadata(path).is_ok())
    }

    #[instrument(skip(self, paths), fields(backend = "fs"))]
    async fn put(
        &self,
        paths: &[PathBuf],
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        use_symlinks: bool,
    ) -> Result<()> {
        let root = self.root.clone();
        let paths = paths.to_vec();
        let archive_path = archive_path.to_string();
        let physical_name = physical_name.to_string();

        self.blocking(move || {
            let abs_archive_path = root.join(&archive_path);
            let abs_product_path = abs_archive_path.join(&physical_name);

            // already at the target location: leave everything as-is
            if is_sub_path(&paths[0], &abs_product_path, true) {
                for path in &paths {
                    if fs::symlink_metadata(path).is_err() {
                        return Err(Error::Storage(format!(
                            "product source path does not exist '{}'",
                            path.display()
                        )));
                    }
                    if !is_sub_path(path, &abs_product_path, true) {
                        return Err(Error::Storage(
                            "cannot ingest product where only part of the files are already at the destination location".to_string(),
                        ));
                    }
                }
                return Ok(());
            }

            fs::create_dir_all(&abs_archive_path).map_err(|e| {
                io_error(
                    &format!("cannot create parent destination path '{}'", abs_archive_path.display()),
                    e,
                )
            })?;

            let staging = tempfile::Builder::new()
                .prefix(".ingest-")
                .tempdir_in(&abs_archive_path)
                .map_err(|e| io_error("cannot create staging directory", e))?;
            let stage_path = if use_enclosing_directory {
                let stage_path = staging.path().join(&physical_name);
                fs::create_dir(&stage_path)
                    .map_err(|e| io_error("cannot create staging directory", e))?;
                stage_path
            } else {
                staging.path().to_path_buf()
            };

            for path in &paths {
                let name = path.file_name().ok_or_else(|| {
                    Error::Storage(format!("invalid source path: {}", path.display()))
                })?;
                if use_symlinks {
                    let link_target = if is_sub_path(path, &root, false) {
                        // relative links keep the archive relocatable
                        let base = if use_enclosing_directory {
                            &abs_product_path
                        } else {
                            &abs_archive_path
                        };
                        let (Ok(real_path), Ok(real_base)) = (canonical(path), canonical(base))
                        else {
                            return Err(Error::Storage(format!(
                                "cannot resolve '{}'",
                                path.display()
                            )));
                        };
                        relative_to(&real_path, &real_base)
                    } else {
                        path.clone()
                    };
                    make_symlink(&link_target, &stage_path.join(name))?;
                } else {
                    copy_into(path, &stage_path)?;
                }
            }

            if use_enclosing_directory {
                fs::rename(&stage_path, &abs_product_path)
            } else {
                fs::rename(stage_path.join(&physical_name), &abs_product_path)
            }
            .map_err(|e| {
                io_error(
                    &format!(
                        "unable to transfer product to destination path '{}'",
                        abs_product_path.display()
                    ),
                    e,
                )
            })
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "fs"))]
    async fn get(
        &self,
        archive_path: &str,
        physical_name: &str,
        target_dir: &Path,
        use_enclosing_directory: bool,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let product_path = self.absolute_product_path(archive_path, physical_name);
        let target_dir = target_dir.to_path_buf();
        let physical_name = physical_name.to_string();

        self.blocking(move || {
            if use_enclosing_directory {
                let target = target_dir.join(&physical_name);
                fs::create_dir_all(&target)
                    .map_err(|e| io_error("cannot create target directory", e))?;
                for entry in fs::read_dir(&product_path)
                    .map_err(|e| io_error(&format!("cannot list '{}'", product_path.display()), e))?
                {
                    let entry = entry.map_err(|e| Error::Storage(e.to_string()))?;
                    if use_symlinks {
                        make_symlink(&entry.path(), &target.join(entry.file_name()))?;
                    } else {
                        copy_into(&entry.path(), &target)?;
                    }
                }
                Ok(vec![target])
            } else {
                let target = target_dir.join(&physical_name);
                if use_symlinks {
                    make_symlink(&product_path, &target)?;
                } else {
                    copy_tree(&product_path, &target)?;
                }
                Ok(vec![target])
            }
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "fs"))]
    async fn delete(&self, archive_path: &str, physical_name: &str) -> Result<()> {
        let product_path = self.absolute_product_path(archive_path, physical_name);
        self.blocking(move || {
            if fs::symlink_metadata(&product_path).is_err() {
                // nothing stored is not an error
                return Ok(());
            }
            let parent = product_path
                .parent()
                .ok_or_else(|| Error::Storage("product path has no parent".to_string()))?;
            // move into a scratch directory first so a crashed delete does
            // not leave a half-removed product at its catalogue location
            let scratch = tempfile::Builder::new()
                .prefix(".remove-")
                .tempdir_in(parent)
                .map_err(|e| io_error("cannot create scratch directory", e))?;
            let name = product_path.file_name().unwrap_or_default();
            fs::rename(&product_path, scratch.path().join(name)).map_err(|e| {
                io_error(
                    &format!("unable to remove product '{}'", product_path.display()),
                    e,
                )
            })?;
            scratch
                .close()
                .map_err(|e| io_error("unable to remove product", e))
        })
        .await
    }

    async fn size(&self, archive_path: &str, physical_name: &str) -> Result<u64> {
        let product_path = self.absolute_product_path(archive_path, physical_name);
        self.blocking(move || hash::product_size(&[product_path])).await
    }

    async fn move_to(
        &self,
        archive_path: &str,
        physical_name: &str,
        new_archive_path: &str,
    ) -> Result<()> {
        let product_path = self.absolute_product_path(archive_path, physical_name);
        let new_dir = self.root.join(new_archive_path);
        let target = new_dir.join(physical_name);
        self.blocking(move || {
            fs::create_dir_all(&new_dir)
                .map_err(|e| io_error("cannot create destination path", e))?;
            fs::rename(&product_path, &target)
                .map_err(|e| io_error("unable to move product", e))
        })
        .await
    }

    async fn temp_workspace(&self) -> Result<TempWorkspace> {
        let dir = tempfile::Builder::new()
            .prefix(".muninn-")
            .tempdir_in(&self.root)
            .map_err(|e| io_error("cannot create temporary workspace", e))?;
        Ok(TempWorkspace::new(dir))
    }

    async fn product_hash(
        &self,
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        algorithm: HashAlgorithm,
    ) -> Result<String> {
        let product_path = self.absolute_product_path(archive_path, physical_name);
        self.blocking(move || {
            let paths = if use_enclosing_directory {
                let mut entries: Vec<PathBuf> = fs::read_dir(&product_path)
                    .map_err(|e| io_error(&format!("cannot list '{}'", product_path.display()), e))?
                    .map(|entry| entry.map(|e| e.path()))
                    .collect::<std::io::Result<_>>()
                    .map_err(|e| Error::Storage(e.to_string()))?;
                entries.sort();
                entries
            } else {
                vec![product_path]
            };
            hash::product_hash(&paths, algorithm)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("archive"));
        backend.prepare().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (dir, backend) = backend().await;
        let source = dir.path().join("alpha.dat");
        fs::write(&source, b"hello").unwrap();

        backend
            .put(&[source], "abc/2024", "alpha.dat", false, false)
            .await
            .unwrap();
        assert!(backend.product_exists("abc/2024", "alpha.dat").await.unwrap());
        assert_eq!(backend.size("abc/2024", "alpha.dat").await.unwrap(), 5);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        let paths = backend
            .get("abc/2024", "alpha.dat", &target, false, false)
            .await
            .unwrap();
        assert_eq!(paths, vec![target.join("alpha.dat")]);
        assert_eq!(fs::read(&paths[0]).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn enclosing_directory_wraps_parts() {
        let (dir, backend) = backend().await;
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        fs::write(&a, b"one").unwrap();
        fs::write(&b, b"two").unwrap();

        backend
            .put(&[a, b], "multi", "product", true, false)
            .await
            .unwrap();
        assert_eq!(backend.size("multi", "product").await.unwrap(), 6);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        let paths = backend
            .get("multi", "product", &target, true, false)
            .await
            .unwrap();
        assert_eq!(paths, vec![target.join("product")]);
        assert!(paths[0].join("a.dat").is_file());
        assert!(paths[0].join("b.dat").is_file());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn intra_archive_symlinks_are_relative() {
        let (_dir, backend) = backend().await;
        // source already inside the archive root
        let source_dir = backend.root.join("incoming");
        fs::create_dir_all(&source_dir).unwrap();
        let source = source_dir.join("alpha.dat");
        fs::write(&source, b"hello").unwrap();

        backend
            .put(&[source], "abc", "alpha.dat", false, true)
            .await
            .unwrap();
        let stored = backend.root.join("abc/alpha.dat");
        let link_target = fs::read_link(&stored).unwrap();
        assert!(
            link_target.is_relative(),
            "expected relative link, got {link_target:?}"
        );
        assert_eq!(fs::read(&stored).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn put_in_place_is_a_no_op() {
        let (_dir, backend) = backend().await;
        let product_dir = backend.root.join("abc/2024");
        fs::create_dir_all(&product_dir).unwrap();
        let source = product_dir.join("alpha.dat");
        fs::write(&source, b"hello").unwrap();

        backend
            .put(&[source.clone()], "abc/2024", "alpha.dat", false, false)
            .await
            .unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn current_archive_path_requires_root() {
        let (dir, backend) = backend().await;
        let inside_dir = backend.root.join("abc/2024");
        fs::create_dir_all(&inside_dir).unwrap();
        let inside = inside_dir.join("alpha.dat");
        fs::write(&inside, b"hello").unwrap();
        assert_eq!(
            backend
                .current_archive_path(&[inside], "alpha.dat", false)
                .unwrap(),
            "abc/2024"
        );

        let outside = dir.path().join("other.dat");
        fs::write(&outside, b"x").unwrap();
        assert!(backend
            .current_archive_path(&[outside], "other.dat", false)
            .is_err());
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let (_dir, backend) = backend().await;
        backend.delete("abc", "ghost.dat").await.unwrap();
    }

    #[tokio::test]
    async fn move_to_new_archive_path() {
        let (dir, backend) = backend().await;
        let source = dir.path().join("alpha.dat");
        fs::write(&source, b"hello").unwrap();
        backend
            .put(&[source], "old", "alpha.dat", false, false)
            .await
            .unwrap();

        backend.move_to("old", "alpha.dat", "new/place").await.unwrap();
        assert!(!backend.product_exists("old", "alpha.dat").await.unwrap());
        assert!(backend
            .product_exists("new/place", "alpha.dat")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stored_hash_matches_ingest_hash() {
        let (dir, backend) = backend().await;
        let source = dir.path().join("alpha.dat");
        fs::write(&source, b"hello").unwrap();
        let before = hash::product_hash(&[source.clone()], HashAlgorithm::Md5).unwrap();

        backend
            .put(&[source], "abc", "alpha.dat", false, false)
            .await
            .unwrap();
        let after = backend
            .product_hash("abc", "alpha.dat", false, HashAlgorithm::Md5)
            .await
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(after, "md5:5d41402abc4b2a76b9719d911017c592");
    }
}
