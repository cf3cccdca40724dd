//! Local-filesystem backend.
//!
//! Keys map to paths under a root directory.  Writes land in a hidden
//! temporary file in the destination directory and are renamed into place,
//! so readers never observe a partially written object.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

use super::config::LocalConfig;
use super::listing::fold_listing;
use super::signing::{ProxyOp, ProxySigner};
use super::{
    prefix_dir, validate_key, GetOptions, ListOptions, ListResult, PutOptions, StorageAdapter,
    StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "local";
const TEMP_PREFIX: &str = ".forgestore-";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
    passthrough: bool,
    signer: ProxySigner,
}

impl LocalStorage {
    pub fn new(config: &LocalConfig, signer: ProxySigner) -> Self {
        Self {
            root: config.base_path.clone(),
            passthrough: config.passthrough,
            signer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(&self, path: &Path, key: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(BACKEND, key, e))?;
        }
        Ok(())
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

fn to_datetime(modified: std::io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    modified.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

/// Write `data` to `path` through a sibling temp file and an atomic rename.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Recursively collect every object under `dir`, keyed relative to `root`.
fn walk_objects(root: &Path, dir: &Path) -> std::io::Result<Vec<StorageObject>> {
    let mut objects = Vec::new();
    if !dir.exists() {
        return Ok(objects);
    }
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_temp_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let meta = entry.metadata().map_err(std::io::Error::other)?;
        objects.push(StorageObject::new(key, meta.len(), to_datetime(meta.modified())));
    }
    Ok(objects)
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn local_root(&self) -> Option<&Path> {
        self.passthrough.then_some(self.root.as_path())
    }

    #[instrument(skip(self, data, _opts), fields(%key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _opts: &PutOptions) -> StorageResult<()> {
        let path = self.path_for(key)?;
        self.ensure_parent(&path, key).await?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &data))
            .await
            .map_err(|e| StorageError::transient(BACKEND, e))?
            .map_err(|e| StorageError::from_io(BACKEND, key, e))?;
        debug!(path = %path.display(), "object written");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(%key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        let io_err = |e| StorageError::from_io(BACKEND, key, e);

        let Some(range) = opts.range else {
            return tokio::fs::read(&path).await.map(Bytes::from).map_err(io_err);
        };

        let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        let start = range.start.min(len);
        let end = range.end.unwrap_or(len).clamp(start, len);
        file.seek(SeekFrom::Start(start)).await.map_err(io_err)?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start)
            .read_to_end(&mut buf)
            .await
            .map_err(io_err)?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, opts), fields(prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let root = self.root.clone();
        let dir = root.join(prefix_dir(&opts.prefix));
        let objects = tokio::task::spawn_blocking(move || walk_objects(&root, &dir))
            .await
            .map_err(|e| StorageError::transient(BACKEND, e))?
            .map_err(|e| StorageError::transient(BACKEND, format!("walk storage root: {e}")))?;
        Ok(fold_listing(objects, opts))
    }

    #[instrument(skip(self), fields(%key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(BACKEND, key, e)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    #[instrument(skip(self), fields(%src, %dst))]
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        self.ensure_parent(&to, dst).await?;
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, src, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(%src, %dst))]
    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        self.ensure_parent(&to, dst).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, src, e))
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let path = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(BACKEND, key, e))?;
        if !meta.is_file() {
            return Err(StorageError::not_found(key));
        }
        Ok(StorageObject::new(key, meta.len(), to_datetime(meta.modified())))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        Ok(self.signer.url(ProxyOp::Get, key, expires_in))
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        Ok(self.signer.url(ProxyOp::Put, key, expires_in))
    }
}
