//! Bare repository lifecycle: initialisation (optionally seeded), validation,
//! sizing and removal.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use super::commands::{GitEngine, Invocation};
use super::plumbing::Author;
use super::seed::{seed_files, SeedOptions};
use crate::error::{RepoError, RepoResult};

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub default_branch: String,
    pub seed: SeedOptions,
    /// Author of the seed commit.
    pub author: Author,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            seed: SeedOptions::default(),
            author: Author::new("Forge", "forge@localhost"),
        }
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

impl GitEngine {
    /// Initialise a bare repository at `path`, optionally committing seed
    /// files on the default branch.
    ///
    /// An existing repository (one with `HEAD`) is left untouched.  The seed
    /// is committed in a throwaway non-bare worktree and pushed into the new
    /// repository; `HEAD` always ends up pointing at the default branch.
    #[instrument(skip(self, opts), fields(path = %path.display(), branch = %opts.default_branch))]
    pub async fn init_bare_repo(&self, path: &Path, opts: &InitOptions) -> RepoResult<()> {
        self.validate_branch_name(&opts.default_branch).await?;
        if validate_bare_repo(path).await? {
            debug!("bare repo already exists; skipping init");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RepoError::io_at("create", parent, e))?;
        }
        self.run(Invocation::new(["init", "--bare", "-q"]).arg(path))
            .await?;

        if !opts.seed.is_empty() {
            self.seed(path, opts).await?;
        }

        let head = format!("refs/heads/{}", opts.default_branch);
        self.run(Invocation::in_repo(path).args(["symbolic-ref", "HEAD", head.as_str()]))
            .await?;
        info!("bare repo initialised");
        Ok(())
    }

    async fn seed(&self, path: &Path, opts: &InitOptions) -> RepoResult<()> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let owner = path
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Removed on drop, whatever happens below.
        let work = tempfile::Builder::new()
            .prefix("forgestore-seed-")
            .tempdir()
            .map_err(|e| RepoError::io("failed to create seed worktree", e))?;
        let work_dir = work.path();

        self.run(Invocation::new(["init", "-q"]).arg(work_dir)).await?;
        for (file, contents) in seed_files(&name, &owner, &opts.seed) {
            let target = work_dir.join(file);
            tokio::fs::write(&target, contents)
                .await
                .map_err(|e| RepoError::io_at("write", &target, e))?;
        }

        let author = &opts.author;
        self.run(Invocation::in_repo(work_dir).args(["add", "-A"]))
            .await?;
        self.run(
            author.apply(
                Invocation::in_repo(work_dir)
                    .args(["-c", "commit.gpgsign=false"])
                    .args(["commit", "-q", "--no-verify", "-m", "Initial commit"]),
            ),
        )
        .await?;
        self.run(Invocation::in_repo(work_dir).args(["branch", "-M", opts.default_branch.as_str()]))
            .await?;
        let refspec = format!("{0}:refs/heads/{0}", opts.default_branch);
        self.run(
            Invocation::in_repo(work_dir)
                .args(["push", "-q"])
                .arg(path)
                .arg(refspec),
        )
        .await?;
        debug!(files = seed_files(&name, &owner, &opts.seed).len(), "seed committed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Directories git expects in every repository.  Object stores and ref
/// namespaces may be empty, and empty directories do not survive a
/// storage snapshot.
const LAYOUT_DIRS: [&str; 4] = ["objects/info", "objects/pack", "refs/heads", "refs/tags"];

/// Whether `path` is a directory git will open as a repository: a `HEAD`
/// file next to `objects/` and `refs/` directories.
pub async fn validate_bare_repo(path: &Path) -> RepoResult<bool> {
    if !is_dir(path).await {
        return Ok(false);
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !head_exists {
        debug!(path = %path.display(), "HEAD file not found; not a bare repo");
        return Ok(false);
    }

    for dir in ["objects", "refs"] {
        if !is_dir(&path.join(dir)).await {
            warn!(path = %path.display(), missing = dir, "HEAD exists but the repository layout is incomplete");
            return Ok(false);
        }
    }
    Ok(true)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Recreate the empty directories of a bare repository layout under `path`.
pub async fn restore_layout(path: &Path) -> RepoResult<()> {
    for dir in LAYOUT_DIRS {
        let target = path.join(dir);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| RepoError::io_at("create", &target, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Recursively delete the repository directory; a missing path is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn remove_repo(path: &Path) -> RepoResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("repo directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepoError::io_at("remove", path, e)),
    }
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Total size in bytes of the regular files under `path`; symlinks are not
/// followed and a missing path is empty.
pub async fn repo_size_bytes(path: &Path) -> RepoResult<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .map_err(|e| RepoError::io("size walk panicked", std::io::Error::other(e)))
}

pub(crate) fn dir_size_sync(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::seed::{GitignoreTemplate, License};

    #[tokio::test]
    async fn validate_nonexistent_path() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!validate_bare_repo(&tmp.path().join("missing.git")).await.unwrap());
    }

    #[tokio::test]
    async fn head_without_layout_is_not_a_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("widgets.git");
        std::fs::create_dir_all(repo.join("info")).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(repo.join("config"), "[core]\n\tbare = true\n").unwrap();
        assert!(!validate_bare_repo(&repo).await.unwrap());

        restore_layout(&repo).await.unwrap();
        assert!(validate_bare_repo(&repo).await.unwrap());
        assert!(GitEngine::default().list_branches(&repo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_nonexistent_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        remove_repo(&tmp.path().join("missing.git")).await.unwrap();
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "aaa").unwrap();
        std::fs::write(sub.join("b.txt"), "bbbbb").unwrap();
        assert_eq!(dir_size_sync(tmp.path()), 8);
        assert_eq!(dir_size_sync(&tmp.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn init_without_seed_points_head_at_default_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("acme").join("widgets.git");
        let git = GitEngine::default();
        let opts = InitOptions {
            default_branch: "trunk".into(),
            ..InitOptions::default()
        };
        git.init_bare_repo(&repo, &opts).await.unwrap();

        assert!(validate_bare_repo(&repo).await.unwrap());
        let head = std::fs::read_to_string(repo.join("HEAD")).unwrap();
        assert_eq!(head.trim(), "ref: refs/heads/trunk");
        assert!(git.list_branches(&repo).await.unwrap().is_empty());

        // Second init is a no-op.
        git.init_bare_repo(&repo, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn seeded_init_commits_templates() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("acme").join("widgets.git");
        let git = GitEngine::default();
        let opts = InitOptions {
            seed: SeedOptions {
                readme: Some("Widget factory".into()),
                gitignore: Some(GitignoreTemplate::Rust),
                license: Some(License::Isc),
                license_holder: None,
            },
            ..InitOptions::default()
        };
        git.init_bare_repo(&repo, &opts).await.unwrap();

        let branches = git.list_branches(&repo).await.unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].name, "main");

        let readme = git.read_file(&repo, "main", "README.md").await.unwrap().unwrap();
        assert_eq!(readme, b"# widgets\n\nWidget factory\n");
        let license = git.read_file(&repo, "main", "LICENSE").await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&license).contains("acme"));
        assert!(git.read_file(&repo, "main", ".gitignore").await.unwrap().is_some());
        assert!(repo_size_bytes(&repo).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn rejects_invalid_default_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = InitOptions {
            default_branch: "bad..name".into(),
            ..InitOptions::default()
        };
        let err = GitEngine::default()
            .init_bare_repo(&tmp.path().join("x.git"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput(_)));
    }
}
