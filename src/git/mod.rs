//! Bare-repository mutation engine.
//!
//! All work happens through git plumbing on bare repositories, executed via
//! the [`CommandExecutor`] port.  Nothing here ever checks out a working
//! tree of the served repository.

pub mod bare_repo;
pub mod commands;
pub mod plumbing;
pub mod seed;

pub use bare_repo::{remove_repo, repo_size_bytes, restore_layout, validate_bare_repo, InitOptions};
pub use commands::{CommandExecutor, CommandOutput, GitCli, GitEngine, Invocation};
pub use plumbing::{validate_repo_path, Author, BranchInfo, CommitFileRequest, MergeOutcome};
pub use seed::{GitignoreTemplate, License, SeedOptions};
