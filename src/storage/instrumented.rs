//! Metrics decorator around any [`StorageAdapter`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    GetOptions, ListOptions, ListResult, PutOptions, StorageAdapter, StorageKind, StorageObject,
};
use crate::error::StorageResult;
use crate::metrics::{BackendLabels, Metrics, Outcome, StorageLatencyLabels, StorageOp, StorageOpLabels};

/// Counts every call by backend, operation and outcome, records latency and
/// transferred bytes, then delegates to the wrapped adapter.
#[derive(Debug)]
pub struct InstrumentedStorage {
    inner: Arc<dyn StorageAdapter>,
    metrics: Arc<Metrics>,
    backend: String,
}

impl InstrumentedStorage {
    pub fn new(inner: Arc<dyn StorageAdapter>, metrics: Arc<Metrics>) -> Self {
        let backend = inner.kind().to_string();
        Self {
            inner,
            metrics,
            backend,
        }
    }

    async fn observe<T, F>(&self, op: StorageOp, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(e) if e.is_not_found() => Outcome::NotFound,
            Err(_) => Outcome::Error,
        };
        self.metrics
            .storage_operation_duration_seconds
            .get_or_create(&StorageLatencyLabels {
                backend: self.backend.clone(),
                op: op.clone(),
            })
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .storage_operations_total
            .get_or_create(&StorageOpLabels {
                backend: self.backend.clone(),
                op,
                outcome,
            })
            .inc();
        result
    }

    fn backend_labels(&self) -> BackendLabels {
        BackendLabels {
            backend: self.backend.clone(),
        }
    }
}

#[async_trait]
impl StorageAdapter for InstrumentedStorage {
    fn kind(&self) -> StorageKind {
        self.inner.kind()
    }

    fn local_root(&self) -> Option<&Path> {
        self.inner.local_root()
    }

    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        let len = data.len() as u64;
        self.observe(StorageOp::Put, self.inner.put(key, data, opts))
            .await?;
        self.metrics
            .storage_upload_bytes
            .get_or_create(&self.backend_labels())
            .inc_by(len);
        Ok(())
    }

    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let data = self.observe(StorageOp::Get, self.inner.get(key, opts)).await?;
        self.metrics
            .storage_download_bytes
            .get_or_create(&self.backend_labels())
            .inc_by(data.len() as u64);
        Ok(data)
    }

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        self.observe(StorageOp::List, self.inner.list(opts)).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.observe(StorageOp::Delete, self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.observe(StorageOp::Exists, self.inner.exists(key)).await
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.observe(StorageOp::Copy, self.inner.copy(src, dst)).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.observe(StorageOp::Move, self.inner.move_object(src, dst))
            .await
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        self.observe(StorageOp::Stat, self.inner.stat(key)).await
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.observe(StorageOp::SignedUrl, self.inner.signed_url(key, expires_in))
            .await
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.observe(
            StorageOp::SignedUploadUrl,
            self.inner.signed_upload_url(key, expires_in),
        )
        .await
    }
}
