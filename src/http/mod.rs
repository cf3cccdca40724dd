//! HTTP surface of the storage engine.
//!
//! Serves health and metrics plus the signed proxy routes that back the
//! `signed_url`/`signed_upload_url` links of the local and FTP adapters.

pub mod handler;

use std::sync::Arc;

use crate::cache::RepoCacheManager;
use crate::health::HealthState;
use crate::metrics::MetricsRegistry;
use crate::storage::{ProxySigner, StorageResolver};

pub use handler::create_router;

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<StorageResolver>,
    pub cache: Arc<RepoCacheManager>,
    pub signer: ProxySigner,
    pub metrics: MetricsRegistry,
    pub keydb: Option<fred::clients::Pool>,
}

impl AppState {
    pub(crate) fn health_state(&self) -> HealthState {
        HealthState {
            resolver: Arc::clone(&self.resolver),
            cache_root: self.cache.settings().root.clone(),
            keydb: self.keydb.clone(),
        }
    }
}
