//! Strategies that can materialise a bare repository into the cache.
//!
//! [`RepoCacheManager::acquire`](super::RepoCacheManager::acquire) tries each
//! source in order and stops at the first one that reports
//! [`SourceOutcome::Ready`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::sync::{copy_dir_sync, download_into, list_snapshot, HEAD};
use crate::coordination::{with_lock, RepoLock};
use crate::error::{RepoError, RepoResult};
use crate::git::{restore_layout, validate_bare_repo};
use crate::metrics::AcquireStatus;
use crate::storage::StorageAdapter;

/// Everything a source needs to know about the repository being acquired.
pub struct SourceContext<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    /// `owner/name`
    pub slug: &'a str,
    /// Cache directory the repository must end up in.
    pub dest: &'a Path,
    /// Storage prefix of the snapshot, with trailing slash.
    pub prefix: &'a str,
    pub storage: Arc<dyn StorageAdapter>,
    pub lock: &'a dyn RepoLock,
    pub concurrency: usize,
}

/// Why a source could not provide the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Absence {
    /// The source has nothing at all for this repository.
    Empty,
    /// Something exists but is not usable yet (e.g. a snapshot without
    /// `HEAD`), or the source failed.
    Incomplete(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Ready(AcquireStatus),
    NotHere(Absence),
}

#[async_trait]
pub trait RepoSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn materialize(&self, ctx: &SourceContext<'_>) -> RepoResult<SourceOutcome>;
}

/// The default ordering: existing cache copy, storage snapshot, mirror.
pub fn default_sources(mirror: Option<PathBuf>) -> Vec<Box<dyn RepoSource>> {
    let mut sources: Vec<Box<dyn RepoSource>> =
        vec![Box::new(ExistingCheckout), Box::new(RemoteSnapshot)];
    if let Some(root) = mirror {
        sources.push(Box::new(LocalMirror { root }));
    }
    sources
}

/// A staging directory beside `dest`, on the same filesystem so the final
/// rename is atomic.
fn staging_dir(dest: &Path) -> RepoResult<tempfile::TempDir> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| RepoError::io_at("create", parent, e))?;
    let stem = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{stem}.staging-"))
        .tempdir_in(parent)
        .map_err(|e| RepoError::io_at("create staging dir in", parent, e))
}

/// Move a fully populated staging directory into place.  Returns `false`
/// when another request won the race and `dest` is already a repository;
/// the staging copy is then discarded by its `TempDir` guard.
///
/// Snapshots carry files only, so the empty directories git requires are
/// recreated first.
async fn promote(staging: tempfile::TempDir, dest: &Path) -> RepoResult<bool> {
    restore_layout(staging.path()).await?;
    if validate_bare_repo(dest).await? {
        return Ok(false);
    }
    // A leftover directory without HEAD is an aborted earlier attempt.
    if tokio::fs::metadata(dest).await.is_ok() {
        tokio::fs::remove_dir_all(dest)
            .await
            .map_err(|e| RepoError::io_at("remove", dest, e))?;
    }
    tokio::fs::rename(staging.path(), dest)
        .await
        .map_err(|e| RepoError::io_at("rename staging dir to", dest, e))?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// ExistingCheckout
// ---------------------------------------------------------------------------

/// The cache directory already holds the repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistingCheckout;

#[async_trait]
impl RepoSource for ExistingCheckout {
    fn name(&self) -> &'static str {
        "existing"
    }

    async fn materialize(&self, ctx: &SourceContext<'_>) -> RepoResult<SourceOutcome> {
        if validate_bare_repo(ctx.dest).await? {
            return Ok(SourceOutcome::Ready(AcquireStatus::Adopted));
        }
        Ok(SourceOutcome::NotHere(Absence::Empty))
    }
}

// ---------------------------------------------------------------------------
// RemoteSnapshot
// ---------------------------------------------------------------------------

/// Download the storage snapshot under the repository prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteSnapshot;

impl RemoteSnapshot {
    async fn fetch(&self, ctx: &SourceContext<'_>) -> RepoResult<SourceOutcome> {
        let objects = list_snapshot(ctx.storage.as_ref(), ctx.prefix).await?;
        if objects.is_empty() {
            return Ok(SourceOutcome::NotHere(Absence::Empty));
        }
        let head_key = format!("{}{HEAD}", ctx.prefix);
        if !objects.iter().any(|o| o.key == head_key) {
            debug!(objects = objects.len(), "snapshot has no HEAD yet");
            return Ok(SourceOutcome::NotHere(Absence::Incomplete(format!(
                "{} objects present but HEAD missing",
                objects.len()
            ))));
        }

        let staging = staging_dir(ctx.dest)?;
        let bytes = download_into(
            Arc::clone(&ctx.storage),
            ctx.prefix,
            &objects,
            staging.path(),
            ctx.concurrency,
        )
        .await?;

        if promote(staging, ctx.dest).await? {
            info!(objects = objects.len(), bytes, "repository downloaded from storage");
            Ok(SourceOutcome::Ready(AcquireStatus::Downloaded))
        } else {
            debug!("repository appeared during download; adopting it");
            Ok(SourceOutcome::Ready(AcquireStatus::Adopted))
        }
    }
}

#[async_trait]
impl RepoSource for RemoteSnapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    #[instrument(skip(self, ctx), fields(repo = %ctx.slug))]
    async fn materialize(&self, ctx: &SourceContext<'_>) -> RepoResult<SourceOutcome> {
        let result = with_lock(ctx.lock, ctx.slug, || self.fetch(ctx)).await;
        match result {
            Err(RepoError::Storage(e)) => {
                warn!(error = %e, "snapshot download failed");
                Ok(SourceOutcome::NotHere(Absence::Incomplete(e.to_string())))
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// LocalMirror
// ---------------------------------------------------------------------------

/// Copy from a directory of bare repositories laid out as
/// `{root}/{owner}/{name}.git`.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    pub root: PathBuf,
}

#[async_trait]
impl RepoSource for LocalMirror {
    fn name(&self) -> &'static str {
        "mirror"
    }

    #[instrument(skip(self, ctx), fields(repo = %ctx.slug, mirror = %self.root.display()))]
    async fn materialize(&self, ctx: &SourceContext<'_>) -> RepoResult<SourceOutcome> {
        let source = self.root.join(ctx.owner).join(format!("{}.git", ctx.name));
        if !validate_bare_repo(&source).await? {
            return Ok(SourceOutcome::NotHere(Absence::Empty));
        }

        let staging = staging_dir(ctx.dest)?;
        let target = staging.path().to_path_buf();
        let from = source.clone();
        tokio::task::spawn_blocking(move || copy_dir_sync(&from, &target))
            .await
            .map_err(|e| RepoError::io("mirror copy panicked", std::io::Error::other(e)))?
            .map_err(|e| RepoError::io_at("copy mirror", &source, e))?;

        if promote(staging, ctx.dest).await? {
            warn!("repository restored from local mirror");
            Ok(SourceOutcome::Ready(AcquireStatus::Mirror))
        } else {
            Ok(SourceOutcome::Ready(AcquireStatus::Adopted))
        }
    }
}
