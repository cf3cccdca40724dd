//! Local cache of bare repositories backed by the active storage adapter.
//!
//! [`RepoCacheManager`] maps `(owner, name)` to a directory on disk, pulling
//! whole-tree snapshots from storage on first use and pushing them back when
//! a caller releases the repository as modified.

pub mod manager;
pub mod sources;
mod sync;

pub use manager::{CacheSettings, CachedRepository, CleanupReport, RepoCacheManager};
pub use sources::{
    Absence, ExistingCheckout, LocalMirror, RemoteSnapshot, RepoSource, SourceContext, SourceOutcome,
};
