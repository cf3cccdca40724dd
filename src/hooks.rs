//! Server-side hook scripts that call back into the forge.
//!
//! `pre-receive` posts every ref update to
//! `{site_url}/api/internal/hooks/pre-receive?repo=...` and rejects the push
//! unless the forge answers 200.  `post-receive` posts to the matching
//! endpoint and never blocks the push.
//!
//! The shared secret never lands in the scripts, which are part of the
//! repository snapshot in storage.  They read it at run time from the
//! environment variable named in [`HookConfig::secret_env`], which git
//! passes through from the process serving the push.

use std::path::Path;

use tracing::{debug, instrument};

use crate::error::{RepoError, RepoResult};

#[derive(Debug, Clone)]
pub struct HookConfig {
    /// Public base URL of the forge.
    pub site_url: String,
    /// Environment variable holding the value sent as `X-Hook-Secret`.
    pub secret_env: String,
    /// Repository identifier passed in the `repo` query parameter.
    pub repo_path_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreReceive,
    PostReceive,
}

impl HookKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PreReceive => "pre-receive",
            Self::PostReceive => "post-receive",
        }
    }
}

/// Quote a value for a POSIX shell single-quoted string.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A POSIX shell variable name.
fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Callback URL for one hook.
pub fn hook_url(config: &HookConfig, kind: HookKind) -> String {
    format!(
        "{}/api/internal/hooks/{}?repo={}",
        config.site_url.trim_end_matches('/'),
        kind.file_name(),
        urlencoding::encode(&config.repo_path_label)
    )
}

/// Render the script for one hook.  `config.secret_env` must be a valid
/// shell variable name.
pub fn render_hook(config: &HookConfig, kind: HookKind) -> String {
    let header = format!(
        "#!/bin/sh\n\
         # Installed by forgestore. Changes are overwritten on the next install.\n\
         HOOK_URL={url}\n\
         HOOK_SECRET=\"${{{env}-}}\"\n",
        url = sh_quote(&hook_url(config, kind)),
        env = config.secret_env,
    );

    let guard = match kind {
        HookKind::PreReceive => format!(
            "if [ -z \"$HOOK_SECRET\" ]; then\n\
             \x20 echo \"push rejected: {env} is not set on the server\" >&2\n\
             \x20 exit 1\n\
             fi\n",
            env = config.secret_env,
        ),
        HookKind::PostReceive => "[ -n \"$HOOK_SECRET\" ] || exit 0\n".to_string(),
    };

    let read_loop = concat!(
        "\n",
        "while read -r oldrev newrev refname; do\n",
        "  payload=$(printf '{\"oldrev\":\"%s\",\"newrev\":\"%s\",\"refname\":\"%s\"}' \"$oldrev\" \"$newrev\" \"$refname\")\n",
    );

    let body = match kind {
        HookKind::PreReceive => concat!(
            "  response=$(curl -sS -X POST -H 'Content-Type: application/json' \\\n",
            "    -H \"X-Hook-Secret: $HOOK_SECRET\" --data \"$payload\" \\\n",
            "    -w '\\n%{http_code}' \"$HOOK_URL\") || {\n",
            "    echo \"push rejected: forge unreachable\" >&2\n",
            "    exit 1\n",
            "  }\n",
            "  status=$(printf '%s\\n' \"$response\" | tail -n 1)\n",
            "  if [ \"$status\" != \"200\" ]; then\n",
            "    printf '%s\\n' \"$response\" | sed '$d' >&2\n",
            "    exit 1\n",
            "  fi\n",
            "done\n",
            "exit 0\n",
        ),
        HookKind::PostReceive => concat!(
            "  curl -sS -X POST -H 'Content-Type: application/json' \\\n",
            "    -H \"X-Hook-Secret: $HOOK_SECRET\" --data \"$payload\" \\\n",
            "    -o /dev/null \"$HOOK_URL\" >/dev/null 2>&1 || true\n",
            "done\n",
            "exit 0\n",
        ),
    };
    header + &guard + read_loop + body
}

/// Write `hooks/pre-receive` and `hooks/post-receive` (mode 0755) into the
/// bare repository at `repo_path`, replacing existing scripts.
#[instrument(skip(config), fields(repo = %config.repo_path_label, path = %repo_path.display()))]
pub async fn install_hooks(repo_path: &Path, config: &HookConfig) -> RepoResult<()> {
    if !is_shell_identifier(&config.secret_env) {
        return Err(RepoError::InvalidInput(format!(
            "hook secret variable is not a shell identifier: {:?}",
            config.secret_env
        )));
    }
    let dir = repo_path.join("hooks");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| RepoError::io_at("create", &dir, e))?;

    for kind in [HookKind::PreReceive, HookKind::PostReceive] {
        let path = dir.join(kind.file_name());
        tokio::fs::write(&path, render_hook(config, kind))
            .await
            .map_err(|e| RepoError::io_at("write", &path, e))?;
        set_executable(&path).await?;
    }
    debug!("hooks installed");
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> RepoResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| RepoError::io_at("chmod", path, e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> RepoResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn config(site: &str) -> HookConfig {
        HookConfig {
            site_url: site.to_string(),
            secret_env: "FORGE_HOOK_SECRET".to_string(),
            repo_path_label: "acme/widgets".to_string(),
        }
    }

    #[test]
    fn url_and_quoting() {
        let cfg = config("https://forge.example.com/");
        assert_eq!(
            hook_url(&cfg, HookKind::PreReceive),
            "https://forge.example.com/api/internal/hooks/pre-receive?repo=acme%2Fwidgets"
        );
        let script = render_hook(&cfg, HookKind::PostReceive);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("HOOK_SECRET=\"${FORGE_HOOK_SECRET-}\"\n"));
        assert!(script.contains("|| true"));
    }

    #[tokio::test]
    async fn installed_scripts_do_not_embed_the_secret() {
        let repo = tempfile::tempdir().unwrap();
        install_hooks(repo.path(), &config("http://localhost:3000")).await.unwrap();
        for name in ["pre-receive", "post-receive"] {
            let script = std::fs::read_to_string(repo.path().join("hooks").join(name)).unwrap();
            assert!(script.contains("$HOOK_SECRET"));
            assert!(!script.contains("it's-secret"));
        }
    }

    #[tokio::test]
    async fn rejects_unusable_secret_variable() {
        let repo = tempfile::tempdir().unwrap();
        for bad in ["", "1SECRET", "FORGE-SECRET", "X}; rm -rf /"] {
            let cfg = HookConfig {
                secret_env: bad.to_string(),
                ..config("http://localhost:3000")
            };
            assert!(matches!(
                install_hooks(repo.path(), &cfg).await,
                Err(RepoError::InvalidInput(_))
            ));
        }
        assert!(!repo.path().join("hooks/pre-receive").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installs_executable_scripts() {
        use std::os::unix::fs::PermissionsExt;

        let repo = tempfile::tempdir().unwrap();
        install_hooks(repo.path(), &config("http://localhost:3000")).await.unwrap();
        for name in ["pre-receive", "post-receive"] {
            let meta = std::fs::metadata(repo.path().join("hooks").join(name)).unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
    }

    type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

    async fn fake_forge(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/api/internal/hooks/{kind}",
                post(
                    move |State(seen): State<Seen>,
                          Query(q): Query<std::collections::HashMap<String, String>>,
                          headers: HeaderMap,
                          body: String| async move {
                        let secret = headers
                            .get("x-hook-secret")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push((q["repo"].clone(), secret, body));
                        (status, "protected branch")
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    async fn run_hook(path: &Path, secret: Option<&str>, stdin: &str) -> std::process::Output {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg(path);
        match secret {
            Some(value) => cmd.env("FORGE_HOOK_SECRET", value),
            None => cmd.env_remove("FORGE_HOOK_SECRET"),
        };
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let mut pipe = child.stdin.take().unwrap();
        pipe.write_all(stdin.as_bytes()).await.unwrap();
        drop(pipe);
        child.wait_with_output().await.unwrap()
    }

    fn curl_available() -> bool {
        std::process::Command::new("curl")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn pre_receive_blocks_unless_forge_accepts() {
        if !curl_available() {
            return;
        }
        let line = "0000000000000000000000000000000000000000 1111111111111111111111111111111111111111 refs/heads/main\n";

        let (site, seen) = fake_forge(StatusCode::OK).await;
        let repo = tempfile::tempdir().unwrap();
        install_hooks(repo.path(), &config(&site)).await.unwrap();
        let out = run_hook(&repo.path().join("hooks/pre-receive"), Some("it's-secret"), line).await;
        assert!(out.status.success());
        let calls = seen.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "acme/widgets");
        assert_eq!(calls[0].1, "it's-secret");
        let payload: serde_json::Value = serde_json::from_str(&calls[0].2).unwrap();
        assert_eq!(payload["refname"], "refs/heads/main");

        let (site, _) = fake_forge(StatusCode::FORBIDDEN).await;
        let repo = tempfile::tempdir().unwrap();
        install_hooks(repo.path(), &config(&site)).await.unwrap();
        let out = run_hook(&repo.path().join("hooks/pre-receive"), Some("it's-secret"), line).await;
        assert!(!out.status.success());
        assert!(String::from_utf8_lossy(&out.stderr).contains("protected branch"));

        let out = run_hook(&repo.path().join("hooks/post-receive"), Some("it's-secret"), line).await;
        assert!(out.status.success());
    }

    #[tokio::test]
    async fn missing_secret_rejects_push_without_calling_forge() {
        let line = "0000000000000000000000000000000000000000 1111111111111111111111111111111111111111 refs/heads/main\n";
        let (site, seen) = fake_forge(StatusCode::OK).await;
        let repo = tempfile::tempdir().unwrap();
        install_hooks(repo.path(), &config(&site)).await.unwrap();

        let out = run_hook(&repo.path().join("hooks/pre-receive"), None, line).await;
        assert!(!out.status.success());
        assert!(String::from_utf8_lossy(&out.stderr).contains("FORGE_HOOK_SECRET is not set"));

        let out = run_hook(&repo.path().join("hooks/post-receive"), Some(""), line).await;
        assert!(out.status.success());
        assert!(seen.lock().unwrap().is_empty());
    }
}
