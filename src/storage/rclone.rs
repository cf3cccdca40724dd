//! rclone backend.
//!
//! Every operation shells out to the `rclone` binary against
//! `remote:base/key`, which makes any remote rclone supports usable as
//! repository storage.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::config::RcloneConfig;
use super::http::parse_rfc3339;
use super::listing::fold_listing;
use super::{
    prefix_dir, validate_key, GetOptions, ListOptions, ListResult, PutOptions, StorageAdapter,
    StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "rclone";

/// rclone exit codes for "directory not found" and "file not found".
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

#[derive(Debug)]
pub struct RcloneStorage {
    binary: String,
    remote: String,
    base: String,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonEntry {
    path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<String>,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Classify a failed rclone invocation.
pub(crate) fn classify_exit(key: &str, code: Option<i32>, stderr: &str) -> StorageError {
    let lower = stderr.to_ascii_lowercase();
    match code {
        Some(EXIT_DIR_NOT_FOUND | EXIT_FILE_NOT_FOUND) => StorageError::not_found(key),
        _ if lower.contains("object not found") || lower.contains("directory not found") => {
            StorageError::not_found(key)
        }
        _ if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("permission denied") =>
        {
            StorageError::auth(BACKEND, stderr.trim())
        }
        _ => StorageError::transient(
            BACKEND,
            format!("{key}: exit {}: {}", code.unwrap_or(-1), stderr.trim()),
        ),
    }
}

impl RcloneStorage {
    pub fn new(config: &RcloneConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            remote: config.remote.trim_end_matches(':').to_string(),
            base: config.base_path.trim_matches('/').to_string(),
            config_path: config.config_path.clone(),
        }
    }

    /// `remote:base/path` for a key or directory.
    pub(crate) fn target(&self, path: &str) -> String {
        match (self.base.as_str(), path) {
            ("", p) => format!("{}:{p}", self.remote),
            (base, "") => format!("{}:{base}", self.remote),
            (base, p) => format!("{}:{base}/{p}", self.remote),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, key: &str, args: &[&str], stdin: Option<Bytes>) -> StorageResult<Output> {
        let mut cmd = self.command(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        debug!(args = ?args, "spawning rclone");

        let mut child = cmd
            .spawn()
            .map_err(|e| StorageError::transient(BACKEND, format!("spawn {}: {e}", self.binary)))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&data)
                .await
                .map_err(|e| StorageError::transient(BACKEND, format!("write to rclone: {e}")))?;
            drop(pipe);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StorageError::transient(BACKEND, format!("wait for rclone: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(key, output.status.code(), &stderr));
        }
        Ok(output)
    }

    fn to_object(key: String, entry: &LsJsonEntry) -> StorageObject {
        let mut object = StorageObject::new(
            key,
            entry.size.max(0) as u64,
            entry
                .mod_time
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or_else(Utc::now),
        );
        object.content_type = entry.mime_type.clone();
        object
    }
}

#[async_trait]
impl StorageAdapter for RcloneStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Rclone
    }

    #[instrument(skip(self, data, _opts), fields(remote = %self.remote, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _opts: &PutOptions) -> StorageResult<()> {
        validate_key(key)?;
        let target = self.target(key);
        self.run(key, &["rcat", &target], Some(data)).await?;
        Ok(())
    }

    #[instrument(skip(self, opts), fields(remote = %self.remote, %key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        validate_key(key)?;
        let target = self.target(key);
        let mut args = vec!["cat".to_string(), target];
        if let Some(range) = opts.range {
            args.push("--offset".into());
            args.push(range.start.to_string());
            if let Some(end) = range.end {
                args.push("--count".into());
                args.push(end.saturating_sub(range.start).to_string());
            }
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(key, &args, None).await?;
        Ok(Bytes::from(output.stdout))
    }

    #[instrument(skip(self, opts), fields(remote = %self.remote, prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let dir = prefix_dir(&opts.prefix);
        let target = self.target(dir);
        let output = match self
            .run(
                &opts.prefix,
                &["lsjson", "-R", "--files-only", "--no-mimetype", &target],
                None,
            )
            .await
        {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(ListResult::default()),
            Err(e) => return Err(e),
        };
        let entries: Vec<LsJsonEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| StorageError::transient(BACKEND, format!("decode lsjson: {e}")))?;

        let objects = entries.iter().filter(|e| !e.is_dir).map(|entry| {
            let key = if dir.is_empty() {
                entry.path.clone()
            } else {
                format!("{dir}/{}", entry.path)
            };
            Self::to_object(key, entry)
        });
        Ok(fold_listing(objects, opts))
    }

    #[instrument(skip(self), fields(remote = %self.remote, %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let target = self.target(key);
        match self.run(key, &["deletefile", &target], None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        validate_key(src)?;
        validate_key(dst)?;
        let (from, to) = (self.target(src), self.target(dst));
        self.run(src, &["copyto", &from, &to], None).await?;
        Ok(())
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        validate_key(src)?;
        validate_key(dst)?;
        let (from, to) = (self.target(src), self.target(dst));
        self.run(src, &["moveto", &from, &to], None).await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        validate_key(key)?;
        let target = self.target(key);
        let output = self.run(key, &["lsjson", "--stat", &target], None).await?;
        let entry: LsJsonEntry = serde_json::from_slice(&output.stdout)
            .map_err(|e| StorageError::transient(BACKEND, format!("decode lsjson: {e}")))?;
        if entry.is_dir {
            return Err(StorageError::not_found(key));
        }
        Ok(Self::to_object(key.to_string(), &entry))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        let target = self.target(key);
        let expire = format!("{}s", expires_in.as_secs());
        let output = self
            .run(key, &["link", "--expire", &expire, &target], None)
            .await?;
        let link = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if link.is_empty() {
            return Err(StorageError::Unsupported {
                backend: BACKEND,
                operation: "public links on this remote",
            });
        }
        Ok(link)
    }

    async fn signed_upload_url(&self, _key: &str, _expires_in: Duration) -> StorageResult<String> {
        Err(StorageError::Unsupported {
            backend: BACKEND,
            operation: "signed upload URLs",
        })
    }
}
