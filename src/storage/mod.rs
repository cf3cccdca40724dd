//! Object storage layer.
//!
//! Every backend implements [`StorageAdapter`], a uniform
//! put/get/list/delete/copy/move/stat/signed-URL contract.  Keys are opaque
//! path-like strings; no backend is assumed to have real directories, so
//! delimiter listing is emulated where the backend has no native support.
//!
//! Backend selection happens exactly once per configuration through
//! [`build_adapter`], keyed on the [`StorageConfig`] discriminant.

pub mod azure;
pub mod config;
pub mod dropbox;
pub mod ftp;
pub mod gcs;
pub mod gdrive;
pub(crate) mod http;
pub mod instrumented;
pub mod listing;
pub mod local;
pub(crate) mod oauth;
pub mod onedrive;
pub mod rclone;
pub mod resolver;
pub mod s3;
pub mod signing;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use config::{StorageConfig, StorageKind};
pub use resolver::{ConfigSource, FileConfigSource, StorageHealth, StorageResolver};
pub use signing::ProxySigner;

use crate::error::{StorageError, StorageResult};

/// Payloads above this size go through chunked upload sessions on the
/// OAuth-drive backends.
pub const CHUNKED_UPLOAD_THRESHOLD: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One durable object in a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl StorageObject {
    /// Minimal object description (key, size, timestamp).
    pub fn new(key: impl Into<String>, size: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
            etag: None,
            content_type: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub cache_control: Option<String>,
}

/// Half-open byte range `[start, end)`; `end = None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Value for an HTTP `Range` header (inclusive end).
    pub fn http_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Slice an already-downloaded full object.
    pub fn slice(&self, data: Bytes) -> Bytes {
        let len = data.len() as u64;
        let start = self.start.min(len) as usize;
        let end = self.end.unwrap_or(len).clamp(self.start.min(len), len) as usize;
        data.slice(start..end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub range: Option<ByteRange>,
}

impl GetOptions {
    pub fn range(start: u64, end: Option<u64>) -> Self {
        Self {
            range: Some(ByteRange { start, end }),
        }
    }

    /// Apply the range to a full payload fetched by a backend without
    /// native range reads.
    pub(crate) fn apply(&self, data: Bytes) -> Bytes {
        match self.range {
            Some(range) => range.slice(data),
            None => data,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub max_keys: Option<usize>,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// One level of children, `/`-delimited.
    pub fn delimited(mut self) -> Self {
        self.delimiter = Some("/".to_string());
        self
    }

    pub fn max_keys(mut self, max: usize) -> Self {
        self.max_keys = Some(max);
        self
    }

    pub(crate) fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref().filter(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub objects: Vec<StorageObject>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
}

impl ListResult {
    pub fn keys(&self) -> Vec<&str> {
        self.objects.iter().map(|o| o.key.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Uniform object-storage contract implemented by every backend.
///
/// Implementations perform no retries; failures are classified into
/// [`StorageError`] variants and returned as-is.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StorageKind;

    /// Directory that can be used in place of a cache copy.  Only the local
    /// backend in passthrough mode returns `Some`.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Write the full object, overwriting any existing one.
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()>;

    /// Read an object (or a byte range of it).
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes>;

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult>;

    /// Remove an object.  Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()>;

    /// Move an object.  Not atomic unless the backend overrides it with a
    /// native rename.
    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject>;

    /// A URL a client can use to download the object directly.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// A URL a client can use to upload the object directly.
    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the adapter for a configuration.
pub async fn build_adapter(
    config: &StorageConfig,
    signer: &ProxySigner,
) -> StorageResult<Arc<dyn StorageAdapter>> {
    config.validate()?;
    let adapter: Arc<dyn StorageAdapter> = match config {
        StorageConfig::Local(c) => Arc::new(local::LocalStorage::new(c, signer.clone())),
        StorageConfig::S3(c) => Arc::new(s3::S3Storage::connect(c).await?),
        StorageConfig::Gcs(c) => Arc::new(gcs::GcsStorage::new(c)?),
        StorageConfig::Azure(c) => Arc::new(azure::AzureStorage::new(c)?),
        StorageConfig::Dropbox(c) => Arc::new(dropbox::DropboxStorage::new(c)?),
        StorageConfig::Ftp(c) => Arc::new(ftp::FtpStorage::new(c, signer.clone())),
        StorageConfig::Rclone(c) => Arc::new(rclone::RcloneStorage::new(c)),
        StorageConfig::Gdrive(c) => Arc::new(gdrive::GdriveStorage::new(c)?),
        StorageConfig::Onedrive(c) => Arc::new(onedrive::OnedriveStorage::new(c)?),
    };
    tracing::info!(kind = adapter.kind().as_str(), "storage adapter built");
    Ok(adapter)
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

/// Storage prefix of a bare repository, with trailing slash:
/// `repos/{owner}/{name}.git/`.
pub fn repo_prefix(owner: &str, name: &str) -> String {
    format!("repos/{owner}/{name}.git/")
}

/// Storage key of an LFS object.
pub fn lfs_key(oid: &str) -> String {
    format!("lfs/{oid}")
}

/// Reject keys that could escape a backend root.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidConfig("empty object key".into()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidConfig(format!(
            "object key must be relative: {key}"
        )));
    }
    if key.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(StorageError::InvalidConfig(format!(
            "object key contains dot segments: {key}"
        )));
    }
    Ok(())
}

/// Percent-encode each `/`-separated segment, keeping the separators.
pub(crate) fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join an optional backend prefix and a key.
pub(crate) fn join_prefix(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Inverse of [`join_prefix`].
pub(crate) fn strip_prefix<'a>(prefix: &str, full: &'a str) -> &'a str {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return full;
    }
    full.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(full)
}

/// Split a key into its parent "directory" and final segment.
pub(crate) fn split_parent(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", key),
    }
}

/// Directory component of a listing prefix: everything up to the last `/`.
pub(crate) fn prefix_dir(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    }
}
