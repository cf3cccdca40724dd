//! forgestore: the cloud-synchronised bare-repository storage engine of a
//! self-hosted forge.
//!
//! - [`storage`]: one object-storage contract over nine backends, plus the
//!   resolver that picks the active one.
//! - [`cache`]: materialises bare repositories from storage snapshots and
//!   flushes them back.
//! - [`git`]: plumbing-only mutations of bare repositories.
//! - [`hooks`], [`lfs`]: push callbacks and LFS batch resolution.

pub mod cache;
pub mod config;
pub mod coordination;
pub mod error;
pub mod git;
pub mod health;
pub mod hooks;
pub mod http;
pub mod lfs;
pub mod metrics;
pub mod storage;

pub use error::{RepoError, RepoResult, StorageError, StorageResult};
