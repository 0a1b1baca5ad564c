//! S3-compatible storage backend.
//!
//! Products live under `<prefix>/<archive_path>/<physical_name>`. Directory
//! objects (zero-byte keys with a trailing slash) are materialized so the
//! hierarchy is observable with plain listing tools.

use crate::backends::objects::{collect_upload_entries, join_key, target_path};
use crate::traits::{StorageBackend, TempWorkspace};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use muninn_core::config::S3Config;
use muninn_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

fn sdk_error<E: std::fmt::Display>(context: &str, error: E) -> Error {
    Error::Storage(format!("{context}: {error}"))
}

impl S3Backend {
    /// Create a backend from the `[s3]` configuration table.
    ///
    /// Explicit credentials take precedence; without them the ambient AWS
    /// credential chain is used. A configured host enables path-style
    /// addressing for S3-compatible services.
    pub fn new(config: &S3Config) -> Result<Self> {
        if config.access_key.is_some() != config.secret_access_key.is_some() {
            return Err(Error::Config(
                "s3 config requires both access_key and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let (Some(access_key), Some(secret)) =
            (config.access_key.clone(), config.secret_access_key.clone())
        {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key, secret, None, None, "muninn-config",
            ));
        }

        if let Some(host) = &config.host {
            let mut endpoint = if host.starts_with("http://") || host.starts_with("https://") {
                host.clone()
            } else {
                format!("http://{host}")
            };
            if let Some(port) = config.port {
                endpoint = format!("{endpoint}:{port}");
            }
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn product_key(&self, archive_path: &str, physical_name: &str) -> String {
        join_key(&[self.prefix.as_str(), archive_path, physical_name])
    }

    /// All object keys under a prefix, with their sizes.
    async fn list_keys(&self, key_prefix: &str) -> Result<Vec<(String, i64)>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(key_prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| sdk_error("cannot list objects", e))?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push((key.to_string(), object.size().unwrap_or(0)));
                }
            }
            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => return Ok(keys),
            }
        }
    }

    /// Keys making up one product: the exact key or everything nested under
    /// it, including directory markers.
    async fn product_keys(
        &self,
        archive_path: &str,
        physical_name: &str,
    ) -> Result<Vec<(String, i64)>> {
        let product_key = self.product_key(archive_path, physical_name);
        let nested = format!("{product_key}/");
        let listed = self.list_keys(&product_key).await?;
        Ok(listed
            .into_iter()
            .filter(|(key, _)| *key == product_key || key.starts_with(&nested))
            .collect())
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("cannot delete object", e))?;
        Ok(())
    }

    async fn put_marker(&self, key: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(format!("{key}/"))
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| sdk_error("cannot store directory object", e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn global_prefix(&self) -> String {
        let bucket = format!("s3://{}", self.bucket);
        join_key(&[bucket.as_str(), self.prefix.as_str()])
    }

    async fn prepare(&self) -> Result<()> {
        // the bucket is provisioned out of band; make the prefix observable
        if !self.prefix.is_empty() {
            self.put_marker(&self.prefix).await?;
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn destroy(&self) -> Result<()> {
        let keys = self.list_keys(&self.prefix).await?;
        for (key, _) in keys {
            self.delete_key(&key).await?;
        }
        Ok(())
    }

    async fn product_exists(&self, archive_path: &str, physical_name: &str) -> Result<bool> {
        Ok(!self.product_keys(archive_path, physical_name).await?.is_empty())
    }

    #[instrument(skip(self, paths), fields(backend = "s3"))]
    async fn put(
        &self,
        paths: &[PathBuf],
        archive_path: &str,
        physical_name: &str,
        use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<()> {
        let product_key = self.product_key(archive_path, physical_name);
        let (files, directories) =
            collect_upload_entries(paths, &product_key, use_enclosing_directory)?;
        for directory in &directories {
            self.put_marker(directory).await?;
        }
        for (path, key) in files {
            let body = ByteStream::from_path(&path)
                .await
                .map_err(|e| sdk_error(&format!("cannot read '{}'", path.display()), e))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_error("cannot store object", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(
        &self,
        archive_path: &str,
        physical_name: &str,
        target_dir: &Path,
        use_enclosing_directory: bool,
        _use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let product_key = self.product_key(archive_path, physical_name);
        let keys = self.product_keys(archive_path, physical_name).await?;
        if keys.is_empty() {
            return Err(Error::Storage(format!(
                "no data found at '{product_key}'"
            )));
        }

        let root = target_dir.join(physical_name);
        for (key, _) in &keys {
            let relative = key
                .strip_prefix(&product_key)
                .unwrap_or_default()
                .trim_start_matches('/');
            let local = if relative.is_empty() {
                root.clone()
            } else {
                target_path(&root, relative.trim_end_matches('/'))?
            };
            if key.ends_with('/') {
                tokio::fs::create_dir_all(&local)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                continue;
            }
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
            }
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| sdk_error("cannot retrieve object", e))?;
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| sdk_error("cannot read object body", e))?;
            tokio::fs::write(&local, data.into_bytes())
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(vec![root])
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, archive_path: &str, physical_name: &str) -> Result<()> {
        for (key, _) in self.product_keys(archive_path, physical_name).await? {
            self.delete_key(&key).await?;
        }
        Ok(())
    }

    async fn size(&self, archive_path: &str, physical_name: &str) -> Result<u64> {
        let keys = self.product_keys(archive_path, physical_name).await?;
        Ok(keys.iter().map(|(_, size)| (*size).max(0) as u64).sum())
    }

    async fn move_to(
        &self,
        archive_path: &str,
        physical_name: &str,
        new_archive_path: &str,
    ) -> Result<()> {
        let old_key = self.product_key(archive_path, physical_name);
        let new_key = self.product_key(new_archive_path, physical_name);
        for (key, _) in self.product_keys(archive_path, physical_name).await? {
            let target = format!("{new_key}{}", &key[old_key.len()..]);
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(format!("{}/{key}", self.bucket))
                .key(&target)
                .send()
                .await
                .map_err(|e| sdk_error("cannot copy object", e))?;
            self.delete_key(&key).await?;
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
