//! OpenStack Swift storage backend.
//!
//! Talks to the Swift HTTP API directly: v1 authentication against the
//! configured auth URL yields a storage URL and token, objects live in a
//! single container under `<archive_path>/<physical_name>` keys.

use crate::backends::objects::{collect_upload_entries, join_key, target_path};
use crate::traits::{StorageBackend, TempWorkspace};
use async_trait::async_trait;
use muninn_core::config::SwiftConfig;
use muninn_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::instrument;

pub struct SwiftBackend {
    http: reqwest::Client,
    config: SwiftConfig,
    session: OnceCell<Session>,
}

#[derive(Clone)]
struct Session {
    storage_url: String,
    token: String,
}

#[derive(serde::Deserialize)]
struct ObjectInfo {
    name: String,
    bytes: u64,
}

fn http_error<E: std::fmt::Display>(context: &str, error: E) -> Error {
    Error::Storage(format!("{context}: {error}"))
}

impl SwiftBackend {
    pub fn new(config: &SwiftConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.clone(),
            session: OnceCell::new(),
        }
    }

    async fn session(&self) -> Result<&Session> {
        self.session
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(&self.config.authurl)
                    .header("X-Auth-User", &self.config.user)
                    .header("X-Auth-Key", &self.config.key)
                    .send()
                    .await
                    .map_err(|e| http_error("swift authentication failed", e))?;
                if !response.status().is_success() {
                    return Err(Error::Storage(format!(
                        "swift authentication failed: {}",
                        response.status()
                    )));
                }
                let header = |name: &str| -> Result<String> {
                    response
                        .headers()
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .map(|value| value.to_string())
                        .ok_or_else(|| {
                            Error::Storage(format!(
                                "swift authentication response lacks {name} header"
                            ))
                        })
                };
                Ok(Session {
                    storage_url: header("X-Storage-Url")?,
                    token: header("X-Auth-Token")?,
                })
            })
            .await
    }

    async fn container_url(&self) -> Result<String> {
        let session = self.session().await?;
        Ok(format!("{}/{}", session.storage_url, self.config.container))
    }

    async fn object_url(&self, key: &str) -> Result<String> {
        Ok(format!("{}/{key}", self.container_url().await?))
    }

    fn product_key(&self, archive_path: &str, physical_name: &str) -> String {
        join_key(&[archive_path, physical_name])
    }

    async fn list_objects(&self, key_prefix: &str) -> Result<Vec<ObjectInfo>> {
        let session = self.session().await?.clone();
        let url = format!(
            "{}?format=json&prefix={key_prefix}",
            self.container_url().await?
        );
        let response = self
            .http
            .get(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| http_error("cannot list container", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "cannot list container: {}",
                response.status()
            )));
        }
        response
            .json::<Vec<ObjectInfo>>()
            .await
            .map_err(|e| http_error("cannot parse container listing", e))
    }

    async fn product_objects(
        &self,
        archive_path: &str,
        physical_name: &str,
    ) -> Result<Vec<ObjectInfo>> {
        let product_key = self.product_key(archive_path, physical_name);
        let nested = format!("{product_key}/");
        let listed = self.list_objects(&product_key).await?;
        Ok(listed
            .into_iter()
            .filter(|object| object.name == product_key || object.name.starts_with(&nested))
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let session = self.session().await?.clone();
        let response = self
            .http
            .delete(self.object_url(key).await?)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| http_error("cannot delete object", e))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "cannot delete object '{key}': {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SwiftBackend {
    fn global_prefix(&self) -> String {
        format!("swift://{}", self.config.container)
    }

    async fn prepare(&self) -> Result<()> {
        let session = self.session().await?.clone();
        let response = self
            .http
            .put(self.container_url().await?)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| http_error("cannot create container", e))?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "cannot create container '{}': {}",
                self.config.container,
                response.status()
            )));
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        let session = self.session().await?.clone();
        let response = self
            .http
            .head(self.container_url().await?)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| http_error("cannot probe container", e))?;
        Ok(response.status().is_success())
    }

    async fn destroy(&self) -> Result<()> {
        for object in self.list_objects("").await? {
            self.delete_object(&object.name).await?;
        }
        let session = self.session().await?.clone();
        let response = self
            .http
            .delete(self.container_url().await?)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| http_error("cannot delete container", e))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "cannot delete container '{}': {}",
                self.config.container,
                response.status()
            )));
        }
        Ok(())
    }

    async fn product_exists(&self, archive_path: &str, physical_name: &str) -> Result<bool> {
        Ok(!self
            .product_objects(archive_path, physical_name)
            .await?
            .is_empty())
    }

    #[instrument(skip(self, paths), fields(backend = "swift"))]
    async fn put(
        &self,
        paths: &[PathBuf],
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<()> {
        let product_key = self.product_key(archive_path, physical_name);
        let (files, _) = collect_upload_entries(paths, &product_key, use_enclosing_directory)?;
        let session = self.session().await?.clone();
        for (path, key) in files {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| http_error(&format!("cannot read '{}'", path.display()), e))?;
            let response = self
                .http
                .put(self.object_url(&key).await?)
                .header("X-Auth-Token", &session.token)
                .body(data)
                .send()
                .await
                .map_err(|e| http_error("cannot store object", e))?;
            if !response.status().is_success() {
                return Err(Error::Storage(format!(
                    "cannot store object '{key}': {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "swift"))]
    async fn get(
        &self,
        archive_path: &str,
        physical_name: &str,
        target_dir: &Path,
        _use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let product_key = self.product_key(archive_path, physical_name);
        let objects = self.product_objects(archive_path, physical_name).await?;
        if objects.is_empty() {
            return Err(Error::Storage(format!(
                "no data found at '{product_key}'"
            )));
        }

        let session = self.session().await?.clone();
        let root = target_dir.join(physical_name);
        for object in &objects {
            let relative = object
                .name
                .strip_prefix(&product_key)
                .unwrap_or_default()
                .trim_start_matches('/');
            let local = if relative.is_empty() {
                root.clone()
            } else {
                target_path(&root, relative)?
            };
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
            }
            let response = self
                .http
                .get(self.object_url(&object.name).await?)
                .header("X-Auth-Token", &session.token)
                .send()
                .await
                .map_err(|e| http_error("cannot retrieve object", e))?;
            if !response.status().is_success() {
                return Err(Error::Storage(format!(
                    "cannot retrieve object '{}': {}",
                    object.name,
                    response.status()
                )));
            }
            let data = response
                .bytes()
                .await
                .map_err(|e| http_error("cannot read object body", e))?;
            tokio::fs::write(&local, data)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(vec![root])
    }

    #[instrument(skip(self), fields(backend = "swift"))]
    async fn delete(&self, archive_path: &str, physical_name: &str) -> Result<()> {
        for object in self.product_objects(archive_path, physical_name).await? {
            self.delete_object(&object.name).await?;
        }
        Ok(())
    }

    async fn size(&self, archive_path: &str, physical_name: &str) -> Result<u64> {
        let objects = self.product_objects(archive_path, physical_name).await?;
        Ok(objects.iter().map(|object| object.bytes).sum())
    }

    async fn move_to(
        &self,
        archive_path: &str,
        physical_name: &str,
        new_archive_path: &str,
    ) -> Result<()> {
        let old_key = self.product_key(archive_path, physical_name);
        let new_key = self.product_key(new_archive_path, physical_name);
        let session = self.session().await?.clone();
        for object in self.product_objects(archive_path, physical_name).await? {
            let target = format!("{new_key}{}", &object.name[old_key.len()..]);
            let response = self
                .http
                .put(self.object_url(&target).await?)
                .header("X-Auth-Token", &session.token)
                .header(
                    "X-Copy-From",
                    format!("/{}/{}", self.config.container, object.name),
                )
                .body(Vec::new())
                .send()
                .await
                .map_err(|e| http_error("cannot copy object", e))?;
            if !response.status().is_success() {
                return Err(Error::Storage(format!(
                    "cannot copy object '{}': {}",
                    object.name,
                    response.status()
                )));
            }
            self.delete_object(&object.name).await?;
        }
        Ok(())
    }

    async fn temp_workspace(&self) -> Result<TempWorkspace> {
        let dir = tempfile::Builder::new()
            .prefix(".muninn-")
            .tempdir()
            .map_err(|e| Error::Storage(format!("cannot create temporary workspace: {e}")))?;
        Ok(TempWorkspace::new(dir))
    }
}
