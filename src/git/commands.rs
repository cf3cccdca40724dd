//! Git invocation through a [`CommandExecutor`] port.
//!
//! Everything the mutation engine does is a git plumbing command.  The
//! executor trait is the seam between "which command" and "how it is run":
//! production code uses [`GitCli`] (the system `git` binary via
//! [`tokio::process::Command`]); tests can substitute a recording executor.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{RepoError, RepoResult};
use crate::metrics::{CommandLabels, Metrics};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One git invocation: arguments, extra environment, working directory and
/// optional stdin payload.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `git -C <repo> ...`
    pub fn in_repo(repo: &Path) -> Self {
        Self::new([OsStr::new("-C"), repo.as_os_str()])
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// The git subcommand, skipping global `-C <dir>` / `-c <k=v>` options.
    pub fn subcommand(&self) -> String {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            match arg.to_str() {
                Some("-C" | "-c") => {
                    args.next();
                }
                Some(a) if a.starts_with('-') => {}
                Some(a) => return a.to_string(),
                None => return arg.to_string_lossy().into_owned(),
            }
        }
        String::from("git")
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout as UTF-8 with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Run the invocation to completion.  A non-zero exit is not an error at
    /// this level; only a failure to spawn or communicate is.
    async fn execute(&self, invocation: &Invocation) -> RepoResult<CommandOutput>;
}

/// Runs the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for GitCli {
    async fn execute(&self, invocation: &Invocation) -> RepoResult<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&invocation.args);

        // Inherited repository overrides (e.g. when running inside a hook)
        // must not redirect our commands.
        cmd.env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let subcommand = invocation.subcommand();
        debug!(%subcommand, "spawning git");

        let mut child = cmd
            .spawn()
            .map_err(|e| RepoError::io(format!("failed to spawn git {subcommand}"), e))?;
        if let (Some(data), Some(mut pipe)) = (&invocation.stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|e| RepoError::io(format!("failed to write git {subcommand} stdin"), e))?;
            drop(pipe);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RepoError::io(format!("git {subcommand} failed"), e))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The bare-repository mutation engine.  Operations are spread over
/// [`bare_repo`](super::bare_repo) and [`plumbing`](super::plumbing).
#[derive(Clone)]
pub struct GitEngine {
    executor: Arc<dyn CommandExecutor>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for GitEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitEngine")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Default for GitEngine {
    fn default() -> Self {
        Self::new(Arc::new(GitCli::default()))
    }
}

impl GitEngine {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run and return the raw output, whatever the exit status.
    pub async fn output(&self, invocation: Invocation) -> RepoResult<CommandOutput> {
        self.executor.execute(&invocation).await
    }

    /// Run and require a zero exit; anything else becomes
    /// [`RepoError::Plumbing`].
    pub async fn run(&self, invocation: Invocation) -> RepoResult<CommandOutput> {
        let output = self.executor.execute(&invocation).await?;
        if output.success() {
            return Ok(output);
        }
        Err(self.plumbing_error(&invocation, &output))
    }

    /// [`run`](Self::run) returning trimmed stdout.
    pub async fn run_text(&self, invocation: Invocation) -> RepoResult<String> {
        Ok(self.run(invocation).await?.stdout_trimmed())
    }

    pub(crate) fn plumbing_error(&self, invocation: &Invocation, output: &CommandOutput) -> RepoError {
        let command = invocation.subcommand();
        if let Some(m) = &self.metrics {
            m.git_plumbing_failures
                .get_or_create(&CommandLabels {
                    command: command.clone(),
                })
                .inc();
        }
        let stderr = output.stderr_trimmed();
        warn!(%command, status = %output.status(), %stderr, "git command failed");
        RepoError::Plumbing {
            command,
            status: output.status(),
            stderr,
        }
    }
}
