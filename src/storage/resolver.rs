//! Active-backend resolution.
//!
//! The configuration is picked, in order, from:
//!
//! 1. the environment, when environment priority is switched on
//!    (`STORAGE_ENV_PRIORITY=true` or the YAML flag);
//! 2. the persisted record of a [`ConfigSource`];
//! 3. the environment, with its documented defaults.
//!
//! The built adapter is cached against [`StorageConfig::fingerprint`], so an
//! unchanged configuration never rebuilds clients and a changed one replaces
//! the single active adapter.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::config::parse_bool;
use super::instrumented::InstrumentedStorage;
use super::{build_adapter, ListOptions, ProxySigner, StorageAdapter, StorageConfig, StorageKind};
use crate::error::{StorageError, StorageResult};
use crate::metrics::Metrics;

/// Where a persisted storage configuration record lives.  The platform
/// database is one implementation; [`FileConfigSource`] is another.
#[async_trait]
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// The persisted configuration, or `None` when no record exists.
    async fn load(&self) -> StorageResult<Option<StorageConfig>>;
}

/// A JSON file holding one [`StorageConfig`].
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> StorageResult<Option<StorageConfig>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::InvalidConfig(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        StorageConfig::from_json(&raw).map(Some)
    }
}

/// Result of [`StorageResolver::check_storage_health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub healthy: bool,
    #[serde(rename = "type")]
    pub kind: StorageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct Active {
    fingerprint: String,
    adapter: Arc<dyn StorageAdapter>,
}

pub struct StorageResolver {
    source: Option<Arc<dyn ConfigSource>>,
    lookup: Lookup,
    env_priority: bool,
    signer: ProxySigner,
    metrics: Option<Arc<Metrics>>,
    active: Mutex<Option<Active>>,
}

impl fmt::Debug for StorageResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageResolver")
            .field("source", &self.source)
            .field("env_priority", &self.env_priority)
            .finish_non_exhaustive()
    }
}

impl StorageResolver {
    /// A resolver reading the process environment, with no persisted record.
    pub fn new(signer: ProxySigner) -> Self {
        Self {
            source: None,
            lookup: Arc::new(|name| std::env::var(name).ok()),
            env_priority: false,
            signer,
            metrics: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the variable lookup (tests inject a map here).
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Arc::new(lookup);
        self
    }

    pub fn with_env_priority(mut self, env_priority: bool) -> Self {
        self.env_priority = env_priority;
        self
    }

    /// Wrap every built adapter in [`InstrumentedStorage`].
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn env_wins(&self) -> bool {
        self.env_priority
            || (self.lookup)("STORAGE_ENV_PRIORITY")
                .map(|v| parse_bool(&v))
                .unwrap_or(false)
    }

    fn from_env(&self) -> StorageResult<StorageConfig> {
        let lookup = self.lookup.clone();
        StorageConfig::from_lookup(move |name| lookup(name))
    }

    /// The configuration that should be active right now.
    pub async fn resolve_config(&self) -> StorageResult<StorageConfig> {
        if self.env_wins() {
            debug!("environment priority set, using environment storage config");
            return self.from_env();
        }
        if let Some(source) = &self.source {
            match source.load().await {
                Ok(Some(config)) => return Ok(config),
                Ok(None) => debug!("no persisted storage config, using environment"),
                Err(e) => warn!(error = %e, "persisted storage config unreadable, using environment"),
            }
        }
        self.from_env()
    }

    /// The adapter for the current configuration, built on first use and
    /// rebuilt whenever the configuration changes.
    #[instrument(skip(self))]
    pub async fn get_storage(&self) -> StorageResult<Arc<dyn StorageAdapter>> {
        let config = self.resolve_config().await?;
        let fingerprint = config.fingerprint();

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref().filter(|a| a.fingerprint == fingerprint) {
            return Ok(current.adapter.clone());
        }

        let mut adapter = build_adapter(&config, &self.signer).await?;
        if let Some(metrics) = &self.metrics {
            adapter = Arc::new(InstrumentedStorage::new(adapter, metrics.clone()));
        }
        if active.is_some() {
            info!(kind = config.kind().as_str(), "storage configuration changed, adapter replaced");
        }
        *active = Some(Active {
            fingerprint,
            adapter: adapter.clone(),
        });
        Ok(adapter)
    }

    /// Drop the cached adapter; the next [`get_storage`](Self::get_storage)
    /// rebuilds it.
    pub async fn reset_storage(&self) {
        *self.active.lock().await = None;
    }

    /// Probe the active backend with a one-key listing.
    #[instrument(skip(self))]
    pub async fn check_storage_health(&self) -> StorageHealth {
        let kind = match self.resolve_config().await {
            Ok(config) => config.kind(),
            Err(e) => {
                return StorageHealth {
                    healthy: false,
                    kind: StorageKind::Local,
                    error: Some(e.to_string()),
                }
            }
        };
        let listing = async {
            let storage = self.get_storage().await?;
            storage.list(&ListOptions::default().max_keys(1)).await
        };
        match listing.await {
            Ok(_) => StorageHealth {
                healthy: true,
                kind,
                error: None,
            },
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "storage health check failed");
                StorageHealth {
                    healthy: false,
                    kind,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
