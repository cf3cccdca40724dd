use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StorageOp {
    Put,
    Get,
    List,
    Delete,
    Exists,
    Copy,
    Move,
    Stat,
    SignedUrl,
    SignedUploadUrl,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    NotFound,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StorageOpLabels {
    pub backend: String,
    pub op: StorageOp,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StorageLatencyLabels {
    pub backend: String,
    pub op: StorageOp,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// How `acquire` obtained a repository directory.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AcquireStatus {
    /// Already tracked in the in-memory cache.
    Hot,
    /// Found on disk from an earlier process.
    Adopted,
    Downloaded,
    Mirror,
    Passthrough,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AcquireLabels {
    pub status: AcquireStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by forgestore.
pub struct Metrics {
    // -- storage --
    pub storage_operations_total: Family<StorageOpLabels, Counter>,
    pub storage_operation_duration_seconds: Family<StorageLatencyLabels, Histogram>,
    pub storage_upload_bytes: Family<BackendLabels, Counter>,
    pub storage_download_bytes: Family<BackendLabels, Counter>,

    // -- cache --
    pub cache_acquire_total: Family<AcquireLabels, Counter>,
    pub cache_evictions_total: Counter,
    pub cache_flushes_total: Counter,
    pub cache_flush_failures_total: Counter,
    pub cache_repos_total: Gauge,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- git --
    pub git_plumbing_failures: Family<CommandLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let storage_operations_total = Family::<StorageOpLabels, Counter>::default();
        registry.register(
            "forgestore_storage_operations",
            "Storage adapter operations by backend, operation and outcome",
            storage_operations_total.clone(),
        );

        let storage_operation_duration_seconds =
            Family::<StorageLatencyLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "forgestore_storage_operation_duration_seconds",
            "Storage adapter operation latency in seconds",
            storage_operation_duration_seconds.clone(),
        );

        let storage_upload_bytes = Family::<BackendLabels, Counter>::default();
        registry.register(
            "forgestore_storage_upload_bytes",
            "Total bytes written to the storage backend",
            storage_upload_bytes.clone(),
        );

        let storage_download_bytes = Family::<BackendLabels, Counter>::default();
        registry.register(
            "forgestore_storage_download_bytes",
            "Total bytes read from the storage backend",
            storage_download_bytes.clone(),
        );

        let cache_acquire_total = Family::<AcquireLabels, Counter>::default();
        registry.register(
            "forgestore_cache_acquire",
            "Repository acquisitions by how the directory was obtained",
            cache_acquire_total.clone(),
        );

        let cache_evictions_total = Counter::default();
        registry.register(
            "forgestore_cache_evictions",
            "Repositories evicted from the local cache",
            cache_evictions_total.clone(),
        );

        let cache_flushes_total = Counter::default();
        registry.register(
            "forgestore_cache_flushes",
            "Repository snapshots uploaded to storage",
            cache_flushes_total.clone(),
        );

        let cache_flush_failures_total = Counter::default();
        registry.register(
            "forgestore_cache_flush_failures",
            "Repository snapshot uploads that failed and were kept for retry",
            cache_flush_failures_total.clone(),
        );

        let cache_repos_total: Gauge = Gauge::default();
        registry.register(
            "forgestore_cache_repos",
            "Number of repos currently tracked by the local cache",
            cache_repos_total.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "forgestore_lock_acquisitions",
            "Distributed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "forgestore_lock_waits",
            "Distributed lock wait events",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "forgestore_lock_timeouts",
            "Distributed lock timeout events",
            lock_timeouts.clone(),
        );

        let git_plumbing_failures = Family::<CommandLabels, Counter>::default();
        registry.register(
            "forgestore_git_plumbing_failures",
            "Failed git plumbing invocations by subcommand",
            git_plumbing_failures.clone(),
        );

        Self {
            storage_operations_total,
            storage_operation_duration_seconds,
            storage_upload_bytes,
            storage_download_bytes,
            cache_acquire_total,
            cache_evictions_total,
            cache_flushes_total,
            cache_flush_failures_total,
            cache_repos_total,
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            git_plumbing_failures,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by the resolver,
/// cache manager and HTTP state.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}
