//! Remote-access credentials.
//!
//! The credentials file is a JSON object mapping a host, URL prefix or
//! `s3://bucket` to a credentials record. Lookup picks the entry with the
//! longest key that prefixes the URL (or matches its host).

use muninn_core::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// One credentials record.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "auth_type")]
pub enum Credentials {
    #[serde(rename = "oauth2")]
    OAuth2 {
        grant_type: String,
        username: String,
        password: String,
        client_id: String,
        client_secret: String,
        token_url: String,
        #[serde(default)]
        auth_args: Option<serde_json::Value>,
    },
    #[serde(rename = "S3")]
    S3 {
        bucket: String,
        access_key: String,
        secret_access_key: String,
        #[serde(default)]
        port: Option<u16>,
    },
    #[serde(rename = "Swift")]
    Swift { user: String, key: String },
    /// Plain username/password (the record carries no `auth_type`).
    #[serde(untagged)]
    Basic { username: String, password: String },
}

/// Credentials per host or URL prefix.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    entries: BTreeMap<String, Credentials>,
}

impl CredentialStore {
    /// Load a credentials file.
    ///
    /// The historical `grand_type` misspelling of `grant_type` is accepted
    /// with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "cannot read credentials file '{}': {e}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut raw: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid credentials file: {e}")))?;

        if let Some(entries) = raw.as_object_mut() {
            for (key, record) in entries.iter_mut() {
                if let Some(record) = record.as_object_mut() {
                    if let Some(value) = record.remove("grand_type") {
                        warn!(
                            entry = key.as_str(),
                            "credentials entry uses the misspelled \"grand_type\"; read as \"grant_type\""
                        );
                        record.entry("grant_type").or_insert(value);
                    }
                }
            }
        }

        let entries: BTreeMap<String, Credentials> = serde_json::from_value(raw)
            .map_err(|e| Error::Config(format!("invalid credentials file: {e}")))?;
        Ok(Self { entries })
    }

    /// Credentials for a URL: the longest key that is a prefix of the URL
    /// or equals its host.
    pub fn for_url(&self, url: &str) -> Option<&Credentials> {
        let host = url
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
            .unwrap_or(url);
        self.entries
            .iter()
            .filter(|(key, _)| url.starts_with(key.as_str()) || *key == host)
            .max_by_key(|(key, _)| key.len())
            .map(|(_, credentials)| credentials)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_and_tagged_records() {
        let store = CredentialStore::parse(
            r#"{
                "example.com": {"username": "u", "password": "p"},
                "https://data.example.com/archive": {
                    "auth_type": "oauth2",
                    "grant_type": "password",
                    "username": "u2",
                    "password": "p2",
                    "client_id": "c",
                    "client_secret": "s",
                    "token_url": "https://auth.example.com/token"
                },
                "s3://my-bucket": {
                    "auth_type": "S3",
                    "bucket": "my-bucket",
                    "access_key": "ak",
                    "secret_access_key": "sk"
                }
            }"#,
        )
        .unwrap();

        assert!(matches!(
            store.for_url("https://example.com/file"),
            Some(Credentials::Basic { .. })
        ));
        // the longest matching prefix wins
        assert!(matches!(
            store.for_url("https://data.example.com/archive/p/file"),
            Some(Credentials::OAuth2 { .. })
        ));
        assert!(matches!(
            store.for_url("s3://my-bucket/key"),
            Some(Credentials::S3 { .. })
        ));
        assert!(store.for_url("ftp://other.host/file").is_none());
    }

    #[test]
    fn grand_type_misspelling_accepted() {
        let store = CredentialStore::parse(
            r#"{
                "h": {
                    "auth_type": "oauth2",
                    "grand_type": "password",
                    "username": "u",
                    "password": "p",
                    "client_id": "c",
                    "client_secret": "s",
                    "token_url": "t"
                }
            }"#,
        )
        .unwrap();
        match store.for_url("h").unwrap() {
            Credentials::OAuth2 { grant_type, .. } => assert_eq!(grant_type, "password"),
            other => panic!("unexpected credentials: {other:?}"),
        }
    }
}
