use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::interfaces::ClientLike;
use serde::Serialize;

use crate::storage::StorageResolver;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub storage: CheckResult,
    pub cache: CheckResult,
    /// Absent when no distributed lock is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub resolver: Arc<StorageResolver>,
    pub cache_root: PathBuf,
    pub keydb: Option<fred::clients::Pool>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_storage(resolver: &StorageResolver) -> CheckResult {
    let health = resolver.check_storage_health().await;
    match health.error {
        None => CheckResult::healthy(health.kind.as_str()),
        Some(e) => CheckResult::unhealthy(format!("{}: {e}", health.kind.as_str())),
    }
}

async fn check_keydb(pool: &fred::clients::Pool) -> CheckResult {
    match pool.ping::<String>(None).await {
        Ok(_) => CheckResult::healthy("PONG"),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

/// The cache root must exist (or be creatable) and accept writes.
async fn check_cache(root: &Path) -> CheckResult {
    let path = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        std::fs::create_dir_all(&path)?;
        tempfile::tempfile_in(&path)?;
        Ok(crate::git::bare_repo::dir_size_sync(&path))
    })
    .await;

    match result {
        Ok(Ok(used)) => CheckResult::healthy(format!("{used} bytes cached")),
        Ok(Err(e)) => CheckResult::unhealthy(format!("{}: {e}", root.display())),
        Err(e) => CheckResult::unhealthy(format!("cache check task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let keydb_ok = checks.keydb.as_ref().map_or(true, |c| c.ok);
    if !checks.storage.ok {
        // Nothing can be materialised or flushed without storage.
        HealthStatus::Unhealthy
    } else if checks.cache.ok && keydb_ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

/// Run every check.
pub async fn run_checks(state: &HealthState) -> HealthResponse {
    let keydb = async {
        match &state.keydb {
            Some(pool) => Some(check_keydb(pool).await),
            None => None,
        }
    };
    let (storage, cache, keydb) = tokio::join!(
        check_storage(&state.resolver),
        check_cache(&state.cache_root),
        keydb,
    );
    let checks = HealthChecks {
        storage,
        cache,
        keydb,
    };
    HealthResponse {
        status: aggregate_status(&checks),
        checks,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let body = run_checks(&state).await;
    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::ProxySigner;

    fn state(storage: &Path, cache: &Path) -> HealthState {
        let env: HashMap<String, String> = [(
            "STORAGE_LOCAL_PATH".to_string(),
            storage.display().to_string(),
        )]
        .into_iter()
        .collect();
        HealthState {
            resolver: Arc::new(
                StorageResolver::new(ProxySigner::new("http://localhost/api/storage", "k"))
                    .with_lookup(move |name| env.get(name).cloned()),
            ),
            cache_root: cache.to_path_buf(),
            keydb: None,
        }
    }

    #[tokio::test]
    async fn healthy_local_setup() {
        let storage = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let resp = run_checks(&state(storage.path(), &cache.path().join("repos"))).await;
        assert_eq!(resp.status, HealthStatus::Ok);
        assert_eq!(resp.checks.storage.detail.as_deref(), Some("local"));
        assert!(resp.checks.keydb.is_none());
    }

    #[tokio::test]
    async fn unusable_cache_root_degrades() {
        let storage = tempfile::tempdir().unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        let resp = run_checks(&state(storage.path(), &file.path().join("repos"))).await;
        assert_eq!(resp.status, HealthStatus::Degraded);
        assert!(!resp.checks.cache.ok);
    }

    #[test]
    fn storage_failure_is_unhealthy() {
        let checks = HealthChecks {
            storage: CheckResult::unhealthy("s3: timeout"),
            cache: CheckResult::healthy("0 bytes cached"),
            keydb: Some(CheckResult::healthy("PONG")),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }
}
