//! Cross-process coordination backed by KeyDB (Redis-compatible).
//!
//! Only one thing is coordinated: the snapshot transfer of a repository.
//! Processes sharing one storage backend take a per-repository lock around
//! the download and upload of a tree so a first push is never interleaved
//! with another process's download.

pub mod locks;
pub mod redis;

pub use locks::{with_lock, KeyDbRepoLock, LocalRepoLock, RepoLock};

/// Identifier of this process in lock values.
///
/// `FORGESTORE_NODE_ID` wins; otherwise the host name plus the process id.
pub fn node_id() -> String {
    if let Some(id) = std::env::var("FORGESTORE_NODE_ID")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        return id;
    }
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}
