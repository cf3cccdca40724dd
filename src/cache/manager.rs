//! TTL-bounded cache of bare repositories materialised from storage.
//!
//! Repos live under `{root}/{owner}/{name}.git`.  Each repository has one
//! in-memory entry guarded by its own async mutex, so acquire, release and
//! eviction of the same repository are serialised while different
//! repositories proceed in parallel.  Idle entries are flushed (if modified)
//! and deleted by [`RepoCacheManager::cleanup_cache`], normally driven by
//! [`RepoCacheManager::spawn_sweeper`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::sources::{default_sources, Absence, RepoSource, SourceContext, SourceOutcome};
use super::sync::upload_tree;
use crate::config::CacheConfig;
use crate::coordination::{with_lock, LocalRepoLock, RepoLock};
use crate::error::{RepoError, RepoResult};
use crate::git::{remove_repo, validate_bare_repo};
use crate::metrics::{AcquireLabels, AcquireStatus, Metrics};
use crate::storage::{repo_prefix, StorageAdapter, StorageResolver};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Root directory for cached bare repos.
    pub root: PathBuf,
    /// Idle time after which an entry is flushed and evicted.
    pub ttl: Duration,
    pub mirror_path: Option<PathBuf>,
    pub transfer_concurrency: usize,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            root: config.path.clone(),
            ttl: config.ttl(),
            mirror_path: config.mirror_path.clone(),
            transfer_concurrency: config.transfer_concurrency,
        }
    }
}

/// In-memory bookkeeping for one cached repository.
#[derive(Debug)]
pub struct CachedRepository {
    /// `owner/name`
    pub logical_path: String,
    pub local_path: PathBuf,
    pub last_used_at: Instant,
    /// Local changes not yet durable in storage.
    pub modified: bool,
    /// Acquires not yet matched by a release.  Leased entries are never
    /// evicted.
    leases: usize,
    /// The directory has been materialised (or reserved for creation).
    ready: bool,
    /// Removed from the map; holders of a stale handle must look it up again.
    evicted: bool,
}

impl CachedRepository {
    fn new(logical_path: String, local_path: PathBuf) -> Self {
        Self {
            logical_path,
            local_path,
            last_used_at: Instant::now(),
            modified: false,
            leases: 0,
            ready: false,
            evicted: false,
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    fn lease(&mut self) {
        self.leases += 1;
        self.touch();
    }

    /// Whether an acquired use of the repository is still in progress.
    pub fn in_use(&self) -> bool {
        self.leases > 0
    }
}

type Slot = Arc<Mutex<CachedRepository>>;

/// Result of one [`RepoCacheManager::cleanup_cache`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub evicted: usize,
    /// Modified entries uploaded before eviction.
    pub flushed: usize,
    /// Entries kept because their flush failed.
    pub retained: usize,
    /// Entries skipped because an operation held them or they were still
    /// acquired.
    pub busy: usize,
}

/// Validate one `owner` or `name` component of a repository slug.
fn validate_component(kind: &str, value: &str) -> RepoResult<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
        || value.starts_with('-');
    if bad {
        return Err(RepoError::InvalidInput(format!("invalid repository {kind}: {value:?}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RepoCacheManager
// ---------------------------------------------------------------------------

pub struct RepoCacheManager {
    resolver: Arc<StorageResolver>,
    settings: CacheSettings,
    entries: DashMap<String, Slot>,
    sources: Vec<Box<dyn RepoSource>>,
    lock: Arc<dyn RepoLock>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for RepoCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoCacheManager")
            .field("settings", &self.settings)
            .field("entries", &self.entries.len())
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl RepoCacheManager {
    pub fn new(resolver: Arc<StorageResolver>, settings: CacheSettings) -> Self {
        let sources = default_sources(settings.mirror_path.clone());
        Self {
            resolver,
            settings,
            entries: DashMap::new(),
            sources,
            lock: Arc::new(LocalRepoLock),
            metrics: None,
        }
    }

    /// Serialise snapshot transfers across processes.
    pub fn with_repo_lock(mut self, lock: Arc<dyn RepoLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the acquire strategies.
    pub fn with_sources(mut self, sources: Vec<Box<dyn RepoSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Number of tracked repositories.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache directory of a repository: `{root}/{owner}/{name}.git`.
    pub fn repo_path(&self, owner: &str, name: &str) -> PathBuf {
        self.settings.root.join(owner).join(format!("{name}.git"))
    }

    fn record_acquire(&self, status: AcquireStatus) {
        if let Some(m) = &self.metrics {
            m.cache_acquire_total.get_or_create(&AcquireLabels { status }).inc();
        }
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.cache_repos_total.set(self.entries.len() as i64);
        }
    }

    fn slot(&self, slug: &str, owner: &str, name: &str) -> Slot {
        let slot = self
            .entries
            .entry(slug.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CachedRepository::new(
                    slug.to_string(),
                    self.repo_path(owner, name),
                )))
            })
            .clone();
        self.update_gauge();
        slot
    }

    fn forget(&self, slug: &str, slot: &Slot) {
        self.entries.remove_if(slug, |_, current| Arc::ptr_eq(current, slot));
        self.update_gauge();
    }

    /// Passthrough directory, when the active backend exposes one.
    fn passthrough_path(storage: &dyn StorageAdapter, owner: &str, name: &str) -> Option<PathBuf> {
        storage
            .local_root()
            .map(|root| root.join("repos").join(owner).join(format!("{name}.git")))
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Local path of an existing repository, materialising it if needed.
    /// Every successful acquire must be matched by a
    /// [`release`](Self::release); until then the entry is never evicted.
    ///
    /// Fails with [`RepoError::NotInitialized`] when no source knows the
    /// repository and with the retryable [`RepoError::RaceCondition`] when a
    /// snapshot exists but is not complete yet.
    #[instrument(skip(self))]
    pub async fn acquire(&self, owner: &str, name: &str) -> RepoResult<PathBuf> {
        self.acquire_inner(owner, name, false).await
    }

    /// Like [`acquire`](Self::acquire), but a repository unknown everywhere
    /// is reserved instead of rejected: the returned path does not exist yet
    /// and the caller is expected to initialise it and release it modified.
    #[instrument(skip(self))]
    pub async fn acquire_new(&self, owner: &str, name: &str) -> RepoResult<PathBuf> {
        self.acquire_inner(owner, name, true).await
    }

    /// [`acquire`](Self::acquire) that gives up with
    /// [`RepoError::Cancelled`] when `token` fires.
    pub async fn acquire_cancellable(
        &self,
        owner: &str,
        name: &str,
        token: &CancellationToken,
    ) -> RepoResult<PathBuf> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RepoError::Cancelled),
            result = self.acquire(owner, name) => result,
        }
    }

    async fn acquire_inner(&self, owner: &str, name: &str, reserve: bool) -> RepoResult<PathBuf> {
        validate_component("owner", owner)?;
        validate_component("name", name)?;
        let storage = self.resolver.get_storage().await?;

        if let Some(path) = Self::passthrough_path(storage.as_ref(), owner, name) {
            self.record_acquire(AcquireStatus::Passthrough);
            return Ok(path);
        }

        let slug = format!("{owner}/{name}");
        loop {
            let slot = self.slot(&slug, owner, name);
            let mut entry = slot.lock().await;
            if entry.evicted {
                continue;
            }
            let dest = entry.local_path.clone();

            if entry.ready && (entry.modified || validate_bare_repo(&dest).await?) {
                entry.lease();
                self.record_acquire(AcquireStatus::Hot);
                return Ok(dest);
            }

            let prefix = repo_prefix(owner, name);
            let ctx = SourceContext {
                owner,
                name,
                slug: &slug,
                dest: &dest,
                prefix: &prefix,
                storage: Arc::clone(&storage),
                lock: self.lock.as_ref(),
                concurrency: self.settings.transfer_concurrency,
            };

            let mut pending = Vec::new();
            for source in &self.sources {
                match source.materialize(&ctx).await? {
                    SourceOutcome::Ready(status) => {
                        debug!(source = source.name(), ?status, "repository materialised");
                        entry.ready = true;
                        entry.lease();
                        self.record_acquire(status);
                        return Ok(dest);
                    }
                    SourceOutcome::NotHere(Absence::Empty) => {}
                    SourceOutcome::NotHere(Absence::Incomplete(detail)) => {
                        pending.push(format!("{}: {detail}", source.name()));
                    }
                }
            }

            if !pending.is_empty() {
                return Err(RepoError::RaceCondition {
                    repo: slug,
                    detail: pending.join("; "),
                });
            }
            if reserve {
                debug!("repository unknown everywhere; reserved for creation");
                entry.ready = true;
                entry.lease();
                return Ok(dest);
            }
            return Err(RepoError::NotInitialized { repo: slug });
        }
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// End a use of the repository.  When `modified`, the whole tree is
    /// uploaded before returning; a failed upload leaves the entry marked
    /// modified for the sweeper to retry.
    ///
    /// Releasing a repository this cache does not track fails with
    /// [`RepoError::NotAcquired`] when `modified`, since those changes
    /// cannot be saved.
    #[instrument(skip(self))]
    pub async fn release(&self, owner: &str, name: &str, modified: bool) -> RepoResult<()> {
        let storage = self.resolver.get_storage().await?;
        if storage.local_root().is_some() {
            return Ok(());
        }

        let slug = format!("{owner}/{name}");
        let untracked = || {
            if modified {
                Err(RepoError::NotAcquired { repo: slug.clone() })
            } else {
                warn!("release of an untracked repository");
                Ok(())
            }
        };
        let Some(slot) = self.entries.get(&slug).map(|e| e.value().clone()) else {
            return untracked();
        };
        let mut entry = slot.lock().await;
        if entry.evicted {
            return untracked();
        }
        entry.leases = entry.leases.saturating_sub(1);
        entry.touch();
        if modified {
            entry.modified = true;
        }
        if entry.modified {
            self.flush(storage, &mut entry).await?;
        }
        Ok(())
    }

    /// [`release`](Self::release) that gives up with
    /// [`RepoError::Cancelled`] when `token` fires.  An interrupted upload
    /// never leaves a snapshot that looks complete.
    pub async fn release_cancellable(
        &self,
        owner: &str,
        name: &str,
        modified: bool,
        token: &CancellationToken,
    ) -> RepoResult<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RepoError::Cancelled),
            result = self.release(owner, name, modified) => result,
        }
    }

    /// Upload the entry's tree under the repository lock.
    async fn flush(
        &self,
        storage: Arc<dyn StorageAdapter>,
        entry: &mut CachedRepository,
    ) -> RepoResult<()> {
        let Some((owner, name)) = entry.logical_path.split_once('/') else {
            return Err(RepoError::InvalidInput(entry.logical_path.clone()));
        };
        let prefix = repo_prefix(owner, name);
        let root = entry.local_path.clone();
        let concurrency = self.settings.transfer_concurrency;

        let result = with_lock(self.lock.as_ref(), &entry.logical_path, || {
            upload_tree(storage, &root, &prefix, concurrency)
        })
        .await;

        match result {
            Ok(bytes) => {
                entry.modified = false;
                if let Some(m) = &self.metrics {
                    m.cache_flushes_total.inc();
                }
                info!(repo = %entry.logical_path, bytes, "repository flushed to storage");
                Ok(())
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.cache_flush_failures_total.inc();
                }
                warn!(repo = %entry.logical_path, error = %e, "flush failed; entry kept for retry");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Delete the local copy of one entry that is already locked.
    async fn remove_entry(&self, slug: &str, slot: &Slot, entry: &mut CachedRepository) -> RepoResult<()> {
        remove_repo(&entry.local_path).await?;
        entry.evicted = true;
        self.forget(slug, slot);
        if let Some(m) = &self.metrics {
            m.cache_evictions_total.inc();
        }
        Ok(())
    }

    /// Flush (if modified) and delete the local copy of one repository,
    /// waiting for in-flight operations on it.  A repository that is still
    /// acquired is not evicted and yields the retryable [`RepoError::Lock`].
    #[instrument(skip(self))]
    pub async fn evict(&self, owner: &str, name: &str) -> RepoResult<()> {
        let storage = self.resolver.get_storage().await?;
        if storage.local_root().is_some() {
            return Ok(());
        }
        let slug = format!("{owner}/{name}");
        let Some(slot) = self.entries.get(&slug).map(|e| e.value().clone()) else {
            return Ok(());
        };
        let mut entry = slot.lock().await;
        if entry.evicted {
            return Ok(());
        }
        if entry.in_use() {
            return Err(RepoError::Lock(format!(
                "{slug} is acquired by {} operation(s)",
                entry.leases
            )));
        }
        if entry.modified {
            self.flush(storage, &mut entry).await?;
        }
        self.remove_entry(&slug, &slot, &mut entry).await?;
        info!("repository evicted");
        Ok(())
    }

    /// Evict every entry idle for longer than the TTL.  Entries held by an
    /// in-flight operation or acquired and not yet released are skipped;
    /// modified entries are flushed first and kept if the flush fails.
    #[instrument(skip(self))]
    pub async fn cleanup_cache(&self) -> RepoResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let snapshot: Vec<(String, Slot)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(report);
        }
        let storage = self.resolver.get_storage().await?;

        for (slug, slot) in snapshot {
            let Ok(mut entry) = slot.try_lock() else {
                report.busy += 1;
                continue;
            };
            if entry.evicted {
                continue;
            }
            if entry.last_used_at.elapsed() < self.settings.ttl {
                continue;
            }
            if entry.in_use() {
                debug!(repo = %slug, leases = entry.leases, "idle repository still acquired");
                report.busy += 1;
                continue;
            }
            if !entry.ready {
                // Acquire failed before anything was materialised.
                entry.evicted = true;
                self.forget(&slug, &slot);
                continue;
            }
            if entry.modified {
                if self.flush(Arc::clone(&storage), &mut entry).await.is_err() {
                    report.retained += 1;
                    continue;
                }
                report.flushed += 1;
            }
            match self.remove_entry(&slug, &slot, &mut entry).await {
                Ok(()) => {
                    debug!(repo = %slug, "idle repository evicted");
                    report.evicted += 1;
                }
                Err(e) => warn!(repo = %slug, error = %e, "failed to evict idle repository"),
            }
        }

        if report != CleanupReport::default() {
            info!(?report, "cache cleanup finished");
        }
        Ok(report)
    }

    /// Flush every modified entry and stop tracking all of them.  Local
    /// directories are kept and adopted on the next start.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> RepoResult<usize> {
        let snapshot: Vec<(String, Slot)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let storage = self.resolver.get_storage().await?;

        let mut flushed = 0;
        let mut first_error = None;
        for (slug, slot) in snapshot {
            let mut entry = slot.lock().await;
            if entry.modified {
                match self.flush(Arc::clone(&storage), &mut entry).await {
                    Ok(()) => flushed += 1,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            entry.evicted = true;
            self.forget(&slug, &slot);
        }

        info!(flushed, "cache drained");
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Run [`cleanup_cache`](Self::cleanup_cache) every `interval` until
    /// `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup_cache().await {
                            warn!(error = %e, "cache sweep failed");
                        }
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
