//! Error taxonomy shared by the storage adapters, the repository cache, and
//! the git mutation engine.
//!
//! Adapters never retry; they classify failures so callers can decide.
//! [`RepoError::is_retryable`] is the single place that encodes which
//! failures a request handler should surface as "try again".

use thiserror::Error;

/// Failure raised by a [`StorageAdapter`](crate::storage::StorageAdapter).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key does not exist in the backend.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Credentials were rejected or lack permission.
    #[error("{backend} authentication failed: {message}")]
    AuthFailure {
        backend: &'static str,
        message: String,
    },

    /// Network or backend failure; safe to retry at the caller's discretion.
    #[error("{backend} I/O error: {message}")]
    Transient {
        backend: &'static str,
        message: String,
    },

    /// The storage configuration is incomplete or malformed.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// The backend has no way to perform the requested operation.
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
}

impl StorageError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn transient(backend: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            backend,
            message: message.to_string(),
        }
    }

    pub fn auth(backend: &'static str, message: impl std::fmt::Display) -> Self {
        Self::AuthFailure {
            backend,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classify a local I/O error; `NotFound` keeps its meaning.
    pub fn from_io(backend: &'static str, key: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(key),
            std::io::ErrorKind::PermissionDenied => Self::auth(backend, err),
            _ => Self::transient(backend, format!("{key}: {err}")),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Failure raised by the cache manager or the mutation engine.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Nothing exists for this repository anywhere; the caller should
    /// initialise it rather than report an error.
    #[error("repository {repo} has not been initialised")]
    NotInitialized { repo: String },

    /// The repository is not (fully) visible in storage yet, most likely
    /// because a concurrent initial upload is still landing.
    #[error("repository {repo} not found, it may still be uploading: {detail}")]
    RaceCondition { repo: String, detail: String },

    /// `release` named a repository this cache does not track (never
    /// acquired here, or already evicted), so modified work cannot be saved.
    #[error("repository {repo} is not acquired in this cache")]
    NotAcquired { repo: String },

    /// A git subprocess exited non-zero.
    #[error("git {command} failed ({status}): {stderr}")]
    Plumbing {
        command: String,
        status: String,
        stderr: String,
    },

    /// `merge-tree` reported conflicts; no ref was updated.
    #[error("merge conflict in {}", paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A distributed or local repository lock could not be obtained.
    #[error("repository lock unavailable: {0}")]
    Lock(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RepoError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::io(format!("failed to {action} {}", path.display()), source)
    }

    /// Whether a caller should present this as a transient "try again".
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RaceCondition { .. } | Self::Lock(_) | Self::Cancelled => true,
            Self::Storage(StorageError::Transient { .. }) => true,
            _ => false,
        }
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
