//! Whole-tree transfers between a local bare repository and its storage
//! prefix (`repos/{owner}/{name}.git/`).
//!
//! Downloads land in a staging directory beside the destination and are
//! renamed into place.  Uploads send `HEAD` last, so a snapshot without
//! `HEAD` is always an upload still in flight.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::error::{RepoError, RepoResult};
use crate::storage::{GetOptions, ListOptions, PutOptions, StorageAdapter, StorageObject};

pub(crate) const HEAD: &str = "HEAD";

/// Every object under `prefix`.  Adapters follow their own pagination
/// inside `list`.
pub(crate) async fn list_snapshot(
    storage: &dyn StorageAdapter,
    prefix: &str,
) -> RepoResult<Vec<StorageObject>> {
    Ok(storage.list(&ListOptions::prefix(prefix)).await?.objects)
}

/// Relative path of `key` under `prefix`, rejecting anything that would
/// escape the repository directory.
fn relative_path(prefix: &str, key: &str) -> RepoResult<PathBuf> {
    let rel = key
        .strip_prefix(prefix)
        .filter(|rel| !rel.is_empty())
        .ok_or_else(|| RepoError::InvalidInput(format!("{key} is outside {prefix}")))?;
    let path = PathBuf::from(rel);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(RepoError::InvalidInput(format!("unsafe snapshot key: {key}")));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Download `objects` into `staging`, at most `concurrency` at a time.
#[instrument(skip(storage, objects), fields(%prefix, objects = objects.len()))]
pub(crate) async fn download_into(
    storage: Arc<dyn StorageAdapter>,
    prefix: &str,
    objects: &[StorageObject],
    staging: &Path,
    concurrency: usize,
) -> RepoResult<u64> {
    let jobs = objects
        .iter()
        .map(|obj| Ok((obj.key.clone(), staging.join(relative_path(prefix, &obj.key)?))))
        .collect::<RepoResult<Vec<_>>>()?;

    let bytes: Vec<u64> = stream::iter(jobs)
        .map(|(key, target)| {
            let storage = Arc::clone(&storage);
            async move {
                let data = storage.get(&key, &GetOptions::default()).await?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| RepoError::io_at("create", parent, e))?;
                }
                tokio::fs::write(&target, &data)
                    .await
                    .map_err(|e| RepoError::io_at("write", &target, e))?;
                Ok::<_, RepoError>(data.len() as u64)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    let total = bytes.iter().sum();
    debug!(bytes = total, "snapshot downloaded");
    Ok(total)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Regular files under `root` as `/`-separated relative paths.
fn local_files(root: &Path) -> RepoResult<Vec<String>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            RepoError::io(
                format!("failed to walk {}", root.display()),
                std::io::Error::other(e),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| RepoError::InvalidInput(e.to_string()))?;
        let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
        files.push(parts.join("/"));
    }
    files.sort();
    Ok(files)
}

async fn upload_file(
    storage: &dyn StorageAdapter,
    root: &Path,
    prefix: &str,
    rel: &str,
) -> RepoResult<u64> {
    let path = root.join(rel);
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| RepoError::io_at("read", &path, e))?;
    let len = data.len() as u64;
    storage
        .put(&format!("{prefix}{rel}"), Bytes::from(data), &PutOptions::default())
        .await?;
    Ok(len)
}

/// Upload every file of the repository at `root`, then `HEAD`, then prune
/// remote objects that no longer exist locally.
#[instrument(skip(storage), fields(root = %root.display(), %prefix))]
pub(crate) async fn upload_tree(
    storage: Arc<dyn StorageAdapter>,
    root: &Path,
    prefix: &str,
    concurrency: usize,
) -> RepoResult<u64> {
    let walk_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || local_files(&walk_root))
        .await
        .map_err(|e| RepoError::io("tree walk panicked", std::io::Error::other(e)))??;
    if !files.iter().any(|f| f == HEAD) {
        return Err(RepoError::InvalidInput(format!(
            "{} has no HEAD, refusing to upload",
            root.display()
        )));
    }

    let body: Vec<String> = files.iter().filter(|f| *f != HEAD).cloned().collect();
    let sent: Vec<u64> = stream::iter(body)
        .map(|rel| {
            let storage = Arc::clone(&storage);
            let root = root.to_path_buf();
            let prefix = prefix.to_string();
            async move { upload_file(storage.as_ref(), &root, &prefix, &rel).await }
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    let head = upload_file(storage.as_ref(), root, prefix, HEAD).await?;
    let total = sent.iter().sum::<u64>() + head;

    // Objects repacked or deleted locally; HEAD is already durable so a
    // failure here only leaves garbage behind.
    let local: HashSet<String> = files.iter().map(|f| format!("{prefix}{f}")).collect();
    match list_snapshot(storage.as_ref(), prefix).await {
        Ok(remote) => {
            for obj in remote.iter().filter(|o| !local.contains(&o.key)) {
                if let Err(e) = storage.delete(&obj.key).await {
                    warn!(key = %obj.key, error = %e, "failed to prune stale snapshot object");
                }
            }
        }
        Err(e) => warn!(error = %e, "skipping snapshot prune"),
    }

    debug!(files = files.len(), bytes = total, "snapshot uploaded");
    Ok(total)
}

// ---------------------------------------------------------------------------
// Local copy
// ---------------------------------------------------------------------------

/// Recursively copy `src` into a new directory `dst`.
pub(crate) fn copy_dir_sync(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::LocalConfig;
    use crate::storage::local::LocalStorage;
    use crate::storage::ProxySigner;

    fn store(dir: &Path) -> Arc<dyn StorageAdapter> {
        Arc::new(LocalStorage::new(
            &LocalConfig {
                base_path: dir.to_path_buf(),
                passthrough: false,
            },
            ProxySigner::new("http://forge.test/api/storage", "k"),
        ))
    }

    #[test]
    fn relative_paths_stay_inside_prefix() {
        let prefix = "repos/a/b.git/";
        assert_eq!(
            relative_path(prefix, "repos/a/b.git/refs/heads/main").unwrap(),
            PathBuf::from("refs/heads/main")
        );
        assert!(relative_path(prefix, "repos/a/b.git/").is_err());
        assert!(relative_path(prefix, "repos/a/c.git/HEAD").is_err());
        assert!(relative_path(prefix, "repos/a/b.git/../x").is_err());
    }

    #[tokio::test]
    async fn upload_then_download_and_prune() {
        let remote = tempfile::tempdir().unwrap();
        let storage = store(remote.path());
        let prefix = "repos/acme/widgets.git/";

        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("refs/heads")).unwrap();
        std::fs::write(repo.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(repo.path().join("refs/heads/main"), "abc\n").unwrap();
        storage
            .put(&format!("{prefix}stale"), Bytes::from_static(b"x"), &PutOptions::default())
            .await
            .unwrap();

        upload_tree(Arc::clone(&storage), repo.path(), prefix, 4).await.unwrap();
        let objects = list_snapshot(storage.as_ref(), prefix).await.unwrap();
        let mut keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["repos/acme/widgets.git/HEAD", "repos/acme/widgets.git/refs/heads/main"]
        );

        let out = tempfile::tempdir().unwrap();
        let bytes = download_into(storage, prefix, &objects, out.path(), 2)
            .await
            .unwrap();
        assert_eq!(bytes, 25);
        assert_eq!(
            std::fs::read_to_string(out.path().join("refs/heads/main")).unwrap(),
            "abc\n"
        );
    }

    /// Records the order of `put` calls over a local backend.
    #[derive(Debug)]
    struct Recording {
        inner: LocalStorage,
        puts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl StorageAdapter for Recording {
        fn kind(&self) -> crate::storage::StorageKind {
            self.inner.kind()
        }
        async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> crate::error::StorageResult<()> {
            self.puts.lock().unwrap().push(key.to_string());
            self.inner.put(key, data, opts).await
        }
        async fn get(&self, key: &str, opts: &GetOptions) -> crate::error::StorageResult<Bytes> {
            self.inner.get(key, opts).await
        }
        async fn list(&self, opts: &ListOptions) -> crate::error::StorageResult<crate::storage::ListResult> {
            self.inner.list(opts).await
        }
        async fn delete(&self, key: &str) -> crate::error::StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn copy(&self, src: &str, dst: &str) -> crate::error::StorageResult<()> {
            self.inner.copy(src, dst).await
        }
        async fn stat(&self, key: &str) -> crate::error::StorageResult<StorageObject> {
            self.inner.stat(key).await
        }
        async fn signed_url(&self, key: &str, ttl: std::time::Duration) -> crate::error::StorageResult<String> {
            self.inner.signed_url(key, ttl).await
        }
        async fn signed_upload_url(&self, key: &str, ttl: std::time::Duration) -> crate::error::StorageResult<String> {
            self.inner.signed_upload_url(key, ttl).await
        }
    }

    #[tokio::test]
    async fn head_is_uploaded_last() {
        let remote = tempfile::tempdir().unwrap();
        let recording = Arc::new(Recording {
            inner: LocalStorage::new(
                &LocalConfig {
                    base_path: remote.path().to_path_buf(),
                    passthrough: false,
                },
                ProxySigner::new("http://forge.test/api/storage", "k"),
            ),
            puts: std::sync::Mutex::new(Vec::new()),
        });

        let repo = tempfile::tempdir().unwrap();
        for dir in ["objects/pack", "refs/heads", "refs/tags", "info"] {
            std::fs::create_dir_all(repo.path().join(dir)).unwrap();
        }
        std::fs::write(repo.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(repo.path().join("config"), "[core]\n").unwrap();
        std::fs::write(repo.path().join("objects/pack/p.pack"), "PACK").unwrap();
        std::fs::write(repo.path().join("refs/heads/main"), "abc\n").unwrap();
        std::fs::write(repo.path().join("info/exclude"), "").unwrap();

        upload_tree(recording.clone(), repo.path(), "repos/a/b.git/", 8)
            .await
            .unwrap();
        let puts = recording.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 5);
        assert_eq!(puts.last().map(String::as_str), Some("repos/a/b.git/HEAD"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn upload_future_can_be_spawned() {
        let remote = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join("objects/ab")).unwrap();
        std::fs::write(repo.path().join("objects/ab/cd"), "obj").unwrap();
        std::fs::write(repo.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let storage = store(remote.path());
        let root = repo.path().to_path_buf();
        let fut = async move { upload_tree(storage, &root, "repos/a/b.git/", 2).await };
        assert_send(&fut);
        let bytes = tokio::spawn(fut).await.unwrap().unwrap();
        assert_eq!(bytes, 24);
    }

    #[tokio::test]
    async fn upload_requires_head() {
        let remote = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("config"), "").unwrap();
        let err = upload_tree(store(remote.path()), repo.path(), "repos/a/b.git/", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput(_)));
    }

    #[test]
    fn copy_dir_copies_nested_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("objects/ab")).unwrap();
        std::fs::write(src.path().join("objects/ab/cd"), "obj").unwrap();
        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy.git");
        copy_dir_sync(src.path(), &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("objects/ab/cd")).unwrap(),
            "obj"
        );
    }
}
