//! Server-side mutations through git plumbing: single-file commits, merges
//! and branch management, with no working tree.
//!
//! Every ref update is a compare-and-swap against the value read at the
//! start of the operation, so a concurrent push between read and write
//! fails the update instead of being overwritten.

use std::path::{Component, Path};

use tracing::{debug, instrument};

use super::commands::{GitEngine, Invocation};
use crate::error::{RepoError, RepoResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identity used for both author and committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
    /// Git date (`"1700000000 +0000"` or RFC 2822); "now" when `None`.
    pub date: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            date: None,
        }
    }

    pub fn at(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    /// Set author and committer environment on an invocation.
    pub(crate) fn apply(&self, invocation: Invocation) -> Invocation {
        let mut inv = invocation
            .env("GIT_AUTHOR_NAME", &self.name)
            .env("GIT_AUTHOR_EMAIL", &self.email)
            .env("GIT_COMMITTER_NAME", &self.name)
            .env("GIT_COMMITTER_EMAIL", &self.email);
        if let Some(date) = &self.date {
            inv = inv
                .env("GIT_AUTHOR_DATE", date)
                .env("GIT_COMMITTER_DATE", date);
        }
        inv
    }
}

#[derive(Debug, Clone)]
pub struct CommitFileRequest {
    pub branch: String,
    /// Repository-relative path of the file to create or replace.
    pub path: String,
    pub content: Vec<u8>,
    pub message: String,
    pub author: Author,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub commit: String,
    pub tree: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub commit: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A repository-relative file path: no absolute paths, no `..`, no `.git`
/// component.
pub fn validate_repo_path(path: &str) -> RepoResult<()> {
    let invalid = |why: &str| Err(RepoError::InvalidInput(format!("invalid path {path:?}: {why}")));
    if path.is_empty() || path.ends_with('/') {
        return invalid("must name a file");
    }
    if path.contains('\0') || path.contains('\\') {
        return invalid("contains a forbidden character");
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) if part.eq_ignore_ascii_case(".git") => {
                return invalid("must not touch .git")
            }
            Component::Normal(_) => {}
            _ => return invalid("must be relative without . or .. components"),
        }
    }
    Ok(())
}

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

/// Whether an `update-ref` failure means the ref moved under us.
fn is_ref_race(stderr: &str) -> bool {
    stderr.contains("but expected")
        || stderr.contains("cannot lock ref")
        || stderr.contains("reference already exists")
}

impl GitEngine {
    /// Reject names `git check-ref-format --branch` does not accept.
    pub async fn validate_branch_name(&self, name: &str) -> RepoResult<()> {
        if name.is_empty() || name.starts_with('-') {
            return Err(RepoError::InvalidInput(format!("invalid branch name {name:?}")));
        }
        let output = self
            .output(Invocation::new(["check-ref-format", "--branch", name]))
            .await?;
        if !output.success() {
            return Err(RepoError::InvalidInput(format!("invalid branch name {name:?}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Commit id a revision resolves to, `None` when it does not exist.
    pub async fn resolve_ref(&self, repo: &Path, rev: &str) -> RepoResult<Option<String>> {
        if rev.is_empty() || rev.starts_with('-') {
            return Ok(None);
        }
        let output = self
            .output(
                Invocation::in_repo(repo)
                    .args(["rev-parse", "--verify", "--quiet"])
                    .arg(format!("{rev}^{{commit}}")),
            )
            .await?;
        match output.code {
            Some(0) => Ok(Some(output.stdout_trimmed())),
            Some(1) => Ok(None),
            _ => Err(self.plumbing_error(&Invocation::new(["rev-parse"]), &output)),
        }
    }

    async fn resolve_branch(&self, repo: &Path, branch: &str) -> RepoResult<Option<String>> {
        self.resolve_ref(repo, &branch_ref(branch)).await
    }

    /// Branch the repository's `HEAD` points at.
    pub async fn default_branch(&self, repo: &Path) -> RepoResult<Option<String>> {
        let output = self
            .output(Invocation::in_repo(repo).args(["symbolic-ref", "--quiet", "--short", "HEAD"]))
            .await?;
        Ok(output.success().then(|| output.stdout_trimmed()))
    }

    pub async fn list_branches(&self, repo: &Path) -> RepoResult<Vec<BranchInfo>> {
        let text = self
            .run_text(Invocation::in_repo(repo).args([
                "for-each-ref",
                "--format=%(refname:short)%00%(objectname)",
                "refs/heads",
            ]))
            .await?;
        Ok(text
            .lines()
            .filter_map(|line| line.split_once('\0'))
            .map(|(name, commit)| BranchInfo {
                name: name.to_string(),
                commit: commit.to_string(),
            })
            .collect())
    }

    /// Contents of `path` at `rev`; `None` when the revision or path does
    /// not exist or is not a file.
    pub async fn read_file(&self, repo: &Path, rev: &str, path: &str) -> RepoResult<Option<Vec<u8>>> {
        validate_repo_path(path)?;
        if rev.is_empty() || rev.starts_with('-') {
            return Ok(None);
        }
        let spec = format!("{rev}:{path}");
        let output = self
            .output(
                Invocation::in_repo(repo)
                    .args(["rev-parse", "--verify", "--quiet"])
                    .arg(&spec),
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let oid = output.stdout_trimmed();
        let kind = self
            .run_text(Invocation::in_repo(repo).args(["cat-file", "-t", oid.as_str()]))
            .await?;
        if kind != "blob" {
            return Ok(None);
        }
        let blob = self
            .run(Invocation::in_repo(repo).args(["cat-file", "blob", oid.as_str()]))
            .await?;
        Ok(Some(blob.stdout))
    }

    // -----------------------------------------------------------------------
    // Ref updates
    // -----------------------------------------------------------------------

    /// `update-ref <ref> <new> <old>`; a moved ref becomes
    /// [`RepoError::RaceCondition`].
    async fn update_ref_cas(
        &self,
        repo: &Path,
        refname: &str,
        new: &str,
        old: Option<&str>,
    ) -> RepoResult<()> {
        // All zeroes asserts the ref does not exist yet.
        let zero = "0".repeat(new.len());
        let old = old.unwrap_or(&zero);
        let inv = Invocation::in_repo(repo).args(["update-ref", refname, new, old]);
        let output = self.output(inv.clone()).await?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr_trimmed();
        if is_ref_race(&stderr) {
            return Err(RepoError::RaceCondition {
                repo: repo.display().to_string(),
                detail: format!("{refname} changed concurrently: {stderr}"),
            });
        }
        Err(self.plumbing_error(&inv, &output))
    }

    // -----------------------------------------------------------------------
    // Commit a single file
    // -----------------------------------------------------------------------

    /// Create or replace one file on a branch and return the new commit id.
    ///
    /// Works on a private index file in a temporary directory, so concurrent
    /// commits never share staging state.  An unborn branch gets a root
    /// commit.
    #[instrument(skip(self, req), fields(repo = %repo.display(), branch = %req.branch, path = %req.path))]
    pub async fn commit_file(&self, repo: &Path, req: &CommitFileRequest) -> RepoResult<String> {
        self.validate_branch_name(&req.branch).await?;
        validate_repo_path(&req.path)?;

        let parent = self.resolve_branch(repo, &req.branch).await?;

        let index_dir = tempfile::Builder::new()
            .prefix("forgestore-index-")
            .tempdir()
            .map_err(|e| RepoError::io("failed to create temporary index", e))?;
        let index = index_dir.path().join("index");
        let with_index = |inv: Invocation| inv.env("GIT_INDEX_FILE", &index);

        if let Some(parent) = &parent {
            self.run(with_index(
                Invocation::in_repo(repo).args(["read-tree", parent.as_str()]),
            ))
            .await?;
        }

        let blob = self
            .run_text(
                Invocation::in_repo(repo)
                    .args(["hash-object", "-w", "--stdin"])
                    .stdin(req.content.clone()),
            )
            .await?;
        let cacheinfo = format!("100644,{blob},{}", req.path);
        self.run(with_index(Invocation::in_repo(repo).args([
            "update-index",
            "--add",
            "--cacheinfo",
            cacheinfo.as_str(),
        ])))
        .await?;
        let tree = self
            .run_text(with_index(Invocation::in_repo(repo).arg("write-tree")))
            .await?;

        let mut commit_tree = Invocation::in_repo(repo).args(["commit-tree", tree.as_str()]);
        if let Some(parent) = &parent {
            commit_tree = commit_tree.args(["-p", parent.as_str()]);
        }
        let commit = self
            .run_text(
                req.author
                    .apply(commit_tree)
                    .stdin(req.message.clone().into_bytes()),
            )
            .await?;

        self.update_ref_cas(repo, &branch_ref(&req.branch), &commit, parent.as_deref())
            .await?;
        debug!(%commit, "file committed");
        Ok(commit)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge `head` into branch `base` with a two-parent merge commit.
    ///
    /// Conflicts are never committed: they come back as
    /// [`RepoError::MergeConflict`] listing the paths, and no ref changes.
    #[instrument(skip(self, message, author), fields(repo = %repo.display(), %base, %head))]
    pub async fn merge_branch(
        &self,
        repo: &Path,
        base: &str,
        head: &str,
        message: &str,
        author: &Author,
    ) -> RepoResult<MergeOutcome> {
        let base_commit = self
            .resolve_branch(repo, base)
            .await?
            .ok_or_else(|| RepoError::InvalidInput(format!("unknown base branch {base}")))?;
        let head_commit = match self.resolve_branch(repo, head).await? {
            Some(commit) => commit,
            None => self
                .resolve_ref(repo, head)
                .await?
                .ok_or_else(|| RepoError::InvalidInput(format!("unknown revision {head}")))?,
        };

        let inv = Invocation::in_repo(repo).args([
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            base_commit.as_str(),
            head_commit.as_str(),
        ]);
        let output = self.output(inv.clone()).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut lines = stdout.lines();
        let tree = lines.next().unwrap_or_default().trim().to_string();
        match output.code {
            Some(0) => {}
            Some(1) => {
                let mut paths: Vec<String> = lines
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                paths.dedup();
                return Err(RepoError::MergeConflict { paths });
            }
            _ => return Err(self.plumbing_error(&inv, &output)),
        }

        let commit = self
            .run_text(
                author
                    .apply(Invocation::in_repo(repo).args([
                        "commit-tree",
                        tree.as_str(),
                        "-p",
                        base_commit.as_str(),
                        "-p",
                        head_commit.as_str(),
                    ]))
                    .stdin(message.as_bytes().to_vec()),
            )
            .await?;
        self.update_ref_cas(repo, &branch_ref(base), &commit, Some(&base_commit))
            .await?;
        debug!(%commit, %tree, "merge committed");
        Ok(MergeOutcome { commit, tree })
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    #[instrument(skip(self), fields(repo = %repo.display()))]
    pub async fn create_branch(&self, repo: &Path, name: &str, start_point: &str) -> RepoResult<String> {
        self.validate_branch_name(name).await?;
        if self.resolve_branch(repo, name).await?.is_some() {
            return Err(RepoError::InvalidInput(format!("branch {name} already exists")));
        }
        let commit = self
            .resolve_ref(repo, start_point)
            .await?
            .ok_or_else(|| RepoError::InvalidInput(format!("unknown revision {start_point}")))?;
        self.update_ref_cas(repo, &branch_ref(name), &commit, None)
            .await?;
        Ok(commit)
    }

    /// Delete a branch.  The branch `HEAD` points at cannot be deleted.
    #[instrument(skip(self), fields(repo = %repo.display()))]
    pub async fn delete_branch(&self, repo: &Path, name: &str) -> RepoResult<()> {
        self.validate_branch_name(name).await?;
        if self.default_branch(repo).await?.as_deref() == Some(name) {
            return Err(RepoError::InvalidInput(format!(
                "cannot delete the default branch {name}"
            )));
        }
        let current = self
            .resolve_branch(repo, name)
            .await?
            .ok_or_else(|| RepoError::InvalidInput(format!("unknown branch {name}")))?;
        let refname = branch_ref(name);
        let inv = Invocation::in_repo(repo).args(["update-ref", "-d", refname.as_str(), current.as_str()]);
        let output = self.output(inv.clone()).await?;
        if !output.success() {
            let stderr = output.stderr_trimmed();
            if is_ref_race(&stderr) {
                return Err(RepoError::RaceCondition {
                    repo: repo.display().to_string(),
                    detail: format!("{refname} changed concurrently: {stderr}"),
                });
            }
            return Err(self.plumbing_error(&inv, &output));
        }
        Ok(())
    }
}
