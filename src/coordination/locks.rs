use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, instrument, warn};

use crate::error::{RepoError, RepoResult};
use crate::metrics::Metrics;

/// A per-repository mutual-exclusion lock spanning processes.
#[async_trait]
pub trait RepoLock: Send + Sync + fmt::Debug {
    /// Block until the lock for `slug` is held by this process.
    async fn acquire(&self, slug: &str) -> RepoResult<()>;

    /// Release a lock taken by [`acquire`](Self::acquire).
    async fn release(&self, slug: &str) -> RepoResult<()>;
}

/// Run `f` while holding the lock for `slug`.  The lock is released on every
/// exit path; a failed release is logged and does not mask `f`'s result.
pub async fn with_lock<T, F, Fut>(lock: &dyn RepoLock, slug: &str, f: F) -> RepoResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = RepoResult<T>>,
{
    lock.acquire(slug).await?;
    let result = f().await;
    if let Err(e) = lock.release(slug).await {
        warn!(%slug, error = %e, "repository lock release failed, it will expire");
    }
    result
}

// ---------------------------------------------------------------------------
// Single process
// ---------------------------------------------------------------------------

/// No cross-process exclusion; the cache manager's per-repository mutex is
/// the only serialisation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRepoLock;

#[async_trait]
impl RepoLock for LocalRepoLock {
    async fn acquire(&self, _slug: &str) -> RepoResult<()> {
        Ok(())
    }

    async fn release(&self, _slug: &str) -> RepoResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

fn lock_error(err: fred::error::Error) -> RepoError {
    RepoError::Lock(err.to_string())
}

/// Attempt to acquire a distributed lock using SET NX EX.
///
/// Returns `true` if the lock was successfully acquired, `false` if it is
/// already held by another node.
pub async fn acquire_lock(
    pool: &fred::clients::Pool,
    key: &str,
    node_id: &str,
    ttl_secs: u64,
) -> RepoResult<bool> {
    let value = format!("{node_id}:{}", chrono::Utc::now().timestamp());
    let result: Option<String> = pool
        .set(
            key,
            value.as_str(),
            Some(fred::types::Expiration::EX(ttl_secs as i64)),
            Some(fred::types::SetOptions::NX),
            false,
        )
        .await
        .map_err(lock_error)?;
    // SET … NX returns "OK" when the key was set, nil otherwise.
    let acquired = result.is_some();
    debug!(%key, %node_id, acquired, "acquire_lock");
    Ok(acquired)
}

/// Release a lock only if it is still owned by `node_id`.
///
/// The check-and-delete runs as one Lua script so it is atomic.
pub async fn release_lock(pool: &fred::clients::Pool, key: &str, node_id: &str) -> RepoResult<()> {
    let script = r#"
        local val = redis.call('GET', KEYS[1])
        if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#;
    let released: i64 = pool
        .eval(script, vec![key.to_string()], vec![node_id.to_string()])
        .await
        .map_err(lock_error)?;
    if released == 1 {
        debug!(%key, %node_id, "lock released");
    } else {
        warn!(%key, %node_id, "lock release: key missing or owned by another node");
    }
    Ok(())
}

/// Poll until `key` disappears or `timeout` elapses.  Returns `false` on
/// timeout.
pub async fn wait_for_lock(
    pool: &fred::clients::Pool,
    key: &str,
    timeout: Duration,
) -> RepoResult<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(250);

    loop {
        let exists: bool = pool.exists(key).await.map_err(lock_error)?;
        if !exists {
            return Ok(true);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            warn!(%key, ?timeout, "timed out waiting for lock release");
            return Ok(false);
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}

/// Key holding the transfer lock of one repository.
pub fn repo_lock_key(slug: &str) -> String {
    format!("forgestore:lock:repo:{slug}")
}

/// [`RepoLock`] over KeyDB: SET NX EX to take, an owner-checked Lua DEL to
/// release, polling to wait.
pub struct KeyDbRepoLock {
    pool: fred::clients::Pool,
    node_id: String,
    ttl: Duration,
    wait_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for KeyDbRepoLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDbRepoLock")
            .field("node_id", &self.node_id)
            .field("ttl", &self.ttl)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl KeyDbRepoLock {
    pub fn new(
        pool: fred::clients::Pool,
        node_id: impl Into<String>,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            node_id: node_id.into(),
            ttl,
            wait_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl RepoLock for KeyDbRepoLock {
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn acquire(&self, slug: &str) -> RepoResult<()> {
        let key = repo_lock_key(slug);
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            if acquire_lock(&self.pool, &key, &self.node_id, self.ttl.as_secs().max(1)).await? {
                if let Some(m) = &self.metrics {
                    m.lock_acquisitions.inc();
                }
                return Ok(());
            }
            if let Some(m) = &self.metrics {
                m.lock_waits.inc();
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || !wait_for_lock(&self.pool, &key, remaining).await? {
                if let Some(m) = &self.metrics {
                    m.lock_timeouts.inc();
                }
                return Err(RepoError::Lock(format!(
                    "{slug} is held by another node after {:?}",
                    self.wait_timeout
                )));
            }
        }
    }

    async fn release(&self, slug: &str) -> RepoResult<()> {
        release_lock(&self.pool, &repo_lock_key(slug), &self.node_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl RepoLock for Counting {
        async fn acquire(&self, _slug: &str) -> RepoResult<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self, _slug: &str) -> RepoResult<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let lock = Counting::default();
        let result: RepoResult<()> = with_lock(&lock, "acme/widgets", || async {
            Err(RepoError::InvalidInput("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_lock_is_a_passthrough() {
        let value = with_lock(&LocalRepoLock, "acme/widgets", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn lock_keys_are_namespaced() {
        assert_eq!(repo_lock_key("acme/widgets"), "forgestore:lock:repo:acme/widgets");
    }
}
