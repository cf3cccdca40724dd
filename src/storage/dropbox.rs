//! Dropbox API v2.
//!
//! Keys map to paths under `root_path`.  Payloads above 4 MiB go through an
//! upload session (start, append, finish).  Dropbox has no native range
//! reads through this adapter, so ranged gets download and slice.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::config::DropboxConfig;
use super::http::{build_client, parse_rfc3339, read_bytes, read_json, send_error, status_error};
use super::listing::fold_entries;
use super::oauth::RefreshTokenAuth;
use super::{
    prefix_dir, validate_key, GetOptions, ListOptions, ListResult, PutOptions, StorageAdapter,
    StorageKind, StorageObject, CHUNKED_UPLOAD_THRESHOLD,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "dropbox";
const LIST_LIMIT: u32 = 2000;

#[derive(Debug)]
pub struct DropboxStorage {
    client: reqwest::Client,
    api_base: String,
    content_base: String,
    /// Normalised root: empty or `/segment[/segment..]`.
    root: String,
    auth: RefreshTokenAuth,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    server_modified: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TemporaryLink {
    link: String,
}

/// JSON for the `Dropbox-API-Arg` header.  HTTP headers must be ASCII, so
/// every non-ASCII character is written as a `\uXXXX` escape.
pub(crate) fn api_arg(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

fn normalise_root(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

impl DropboxStorage {
    pub fn new(config: &DropboxConfig) -> StorageResult<Self> {
        let client = build_client(BACKEND, true)?;
        let api_base = config.api_base.trim_end_matches('/').to_string();
        let auth = RefreshTokenAuth::new(
            BACKEND,
            client.clone(),
            format!("{api_base}/oauth2/token"),
            config.app_key.clone(),
            Some(config.app_secret.clone()),
            config.refresh_token.clone(),
        );
        Ok(Self {
            client,
            api_base,
            content_base: config.content_base.trim_end_matches('/').to_string(),
            root: normalise_root(&config.root_path),
            auth,
        })
    }

    fn path_for(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.root, key))
    }

    fn dir_path(&self, dir: &str) -> String {
        match (self.root.as_str(), dir) {
            (root, "") => root.to_string(),
            (root, dir) => format!("{root}/{dir}"),
        }
    }

    fn key_of(&self, path: &str) -> Option<String> {
        let rest = if self.root.is_empty() {
            path
        } else {
            path.strip_prefix(self.root.as_str())?
        };
        rest.strip_prefix('/').map(str::to_owned)
    }

    /// Classify a Dropbox response: endpoint errors arrive as 409 with an
    /// `error_summary` such as `path/not_found/..`.
    async fn check(&self, key: &str, resp: Response) -> StorageResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            if body.contains("not_found") {
                return Err(StorageError::not_found(key));
            }
            return Err(StorageError::transient(
                BACKEND,
                format!("{key}: {}", body.trim()),
            ));
        }
        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        Err(status_error(BACKEND, key, status, &body))
    }

    /// RPC endpoint with a JSON body.
    async fn rpc(&self, endpoint: &str, key: &str, arg: Value) -> StorageResult<Response> {
        let token = self.auth.access_token().await?;
        let resp = self
            .client
            .post(format!("{}/2/{endpoint}", self.api_base))
            .bearer_auth(token)
            .json(&arg)
            .send()
            .await
            .map_err(|e| send_error(BACKEND, e))?;
        self.check(key, resp).await
    }

    /// Content endpoint: argument in the header, payload in the body.
    async fn content(
        &self,
        endpoint: &str,
        key: &str,
        arg: Value,
        body: Option<Bytes>,
    ) -> StorageResult<Response> {
        let token = self.auth.access_token().await?;
        let mut builder = self
            .client
            .post(format!("{}/2/{endpoint}", self.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", api_arg(&arg));
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/octet-stream")
                .body(body);
        }
        let resp = builder.send().await.map_err(|e| send_error(BACKEND, e))?;
        self.check(key, resp).await
    }

    async fn upload_session(&self, key: &str, path: &str, data: Bytes) -> StorageResult<()> {
        let chunk = CHUNKED_UPLOAD_THRESHOLD;
        let first = data.slice(..chunk.min(data.len()));
        let resp = self
            .content(
                "files/upload_session/start",
                key,
                json!({"close": false}),
                Some(first),
            )
            .await?;
        let session: SessionStart = read_json(BACKEND, resp).await?;

        let mut offset = chunk.min(data.len());
        while data.len() - offset > chunk {
            let part = data.slice(offset..offset + chunk);
            self.content(
                "files/upload_session/append_v2",
                key,
                json!({
                    "cursor": {"session_id": session.session_id, "offset": offset},
                    "close": false,
                }),
                Some(part),
            )
            .await?;
            offset += chunk;
        }

        self.content(
            "files/upload_session/finish",
            key,
            json!({
                "cursor": {"session_id": session.session_id, "offset": offset},
                "commit": {"path": path, "mode": "overwrite", "mute": true},
            }),
            Some(data.slice(offset..)),
        )
        .await?;
        debug!(chunks = data.len().div_ceil(chunk), "upload session finished");
        Ok(())
    }

    fn to_object(&self, meta: &Metadata) -> Option<StorageObject> {
        if meta.tag != "file" {
            return None;
        }
        let key = self.key_of(meta.path_display.as_deref()?)?;
        let mut object = StorageObject::new(
            key,
            meta.size.unwrap_or(0),
            meta.server_modified
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or_else(Utc::now),
        );
        object.etag = meta.content_hash.clone();
        Some(object)
    }

    /// Delete `key`, treating a missing object as success.
    async fn delete_quiet(&self, key: &str, path: &str) -> StorageResult<()> {
        match self.rpc("files/delete_v2", key, json!({"path": path})).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn relocate(&self, endpoint: &str, src: &str, dst: &str) -> StorageResult<()> {
        let from = self.path_for(src)?;
        let to = self.path_for(dst)?;
        // Dropbox refuses to overwrite; clear the destination first.
        self.delete_quiet(dst, &to).await?;
        self.rpc(
            endpoint,
            src,
            json!({"from_path": from, "to_path": to, "autorename": false}),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for DropboxStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Dropbox
    }

    #[instrument(skip(self, data, _opts), fields(%key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, _opts: &PutOptions) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if data.len() > CHUNKED_UPLOAD_THRESHOLD {
            return self.upload_session(key, &path, data).await;
        }
        self.content(
            "files/upload",
            key,
            json!({"path": path, "mode": "overwrite", "mute": true}),
            Some(data),
        )
        .await?;
        debug!("file uploaded");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(%key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let path = self.path_for(key)?;
        let resp = self
            .content("files/download", key, json!({"path": path}), None)
            .await?;
        Ok(opts.apply(read_bytes(BACKEND, resp).await?))
    }

    /// Recursive listing for flat requests; a single folder level when a
    /// delimiter is given.
    #[instrument(skip(self, opts), fields(prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let dir = prefix_dir(&opts.prefix);
        let recursive = opts.delimiter().is_none();
        let first = self
            .rpc(
                "files/list_folder",
                &opts.prefix,
                json!({"path": self.dir_path(dir), "recursive": recursive, "limit": LIST_LIMIT}),
            )
            .await;
        let mut page: ListFolderPage = match first {
            Ok(resp) => read_json(BACKEND, resp).await?,
            Err(e) if e.is_not_found() => return Ok(ListResult::default()),
            Err(e) => return Err(e),
        };

        let mut objects = Vec::new();
        let mut folders = Vec::new();
        loop {
            for entry in &page.entries {
                match entry.tag.as_str() {
                    "file" => objects.extend(self.to_object(entry)),
                    "folder" => folders.extend(
                        entry
                            .path_display
                            .as_deref()
                            .and_then(|p| self.key_of(p))
                            .map(|k| format!("{k}/")),
                    ),
                    _ => {}
                }
            }
            if !page.has_more {
                break;
            }
            let resp = self
                .rpc(
                    "files/list_folder/continue",
                    &opts.prefix,
                    json!({"cursor": page.cursor}),
                )
                .await?;
            page = read_json(BACKEND, resp).await?;
        }

        Ok(fold_entries(objects, folders, opts))
    }

    #[instrument(skip(self), fields(%key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        self.delete_quiet(key, &path).await
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.relocate("files/copy_v2", src, dst).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.relocate("files/move_v2", src, dst).await
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let path = self.path_for(key)?;
        let resp = self
            .rpc("files/get_metadata", key, json!({"path": path}))
            .await?;
        let meta: Metadata = read_json(BACKEND, resp).await?;
        self.to_object(&meta)
            .ok_or_else(|| StorageError::not_found(key))
    }

    /// Temporary links are valid for four hours regardless of `expires_in`.
    async fn signed_url(&self, key: &str, _expires_in: Duration) -> StorageResult<String> {
        let path = self.path_for(key)?;
        let resp = self
            .rpc("files/get_temporary_link", key, json!({"path": path}))
            .await?;
        let link: TemporaryLink = read_json(BACKEND, resp).await?;
        Ok(link.link)
    }

    async fn signed_upload_url(&self, _key: &str, _expires_in: Duration) -> StorageResult<String> {
        Err(StorageError::Unsupported {
            backend: BACKEND,
            operation: "signed upload URLs",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{DefaultBodyLimit, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Fake {
        files: BTreeMap<String, Vec<u8>>,
        sessions: HashMap<String, Vec<u8>>,
        session_calls: usize,
    }

    type Shared = Arc<Mutex<Fake>>;

    fn arg(headers: &HeaderMap) -> Value {
        let raw = headers["Dropbox-API-Arg"].to_str().unwrap();
        serde_json::from_str(raw).unwrap()
    }

    fn not_found() -> AxumResponse {
        (
            axum::http::StatusCode::CONFLICT,
            Json(json!({"error_summary": "path/not_found/.."})),
        )
            .into_response()
    }

    async fn token() -> Json<Value> {
        Json(json!({"access_token": "tok", "expires_in": 14400, "token_type": "bearer"}))
    }

    async fn upload(State(s): State<Shared>, headers: HeaderMap, body: Bytes) -> Json<Value> {
        let path = arg(&headers)["path"].as_str().unwrap().to_string();
        s.lock().unwrap().files.insert(path.clone(), body.to_vec());
        Json(json!({".tag": "file", "path_display": path, "size": body.len()}))
    }

    async fn session_start(State(s): State<Shared>, body: Bytes) -> Json<Value> {
        let mut fake = s.lock().unwrap();
        fake.session_calls += 1;
        let id = format!("s{}", fake.sessions.len());
        fake.sessions.insert(id.clone(), body.to_vec());
        Json(json!({"session_id": id}))
    }

    async fn session_append(State(s): State<Shared>, headers: HeaderMap, body: Bytes) -> Json<Value> {
        let a = arg(&headers);
        let id = a["cursor"]["session_id"].as_str().unwrap().to_string();
        let offset = a["cursor"]["offset"].as_u64().unwrap() as usize;
        let mut fake = s.lock().unwrap();
        fake.session_calls += 1;
        let buf = fake.sessions.get_mut(&id).unwrap();
        assert_eq!(buf.len(), offset);
        buf.extend_from_slice(&body);
        Json(Value::Null)
    }

    async fn session_finish(State(s): State<Shared>, headers: HeaderMap, body: Bytes) -> Json<Value> {
        let a = arg(&headers);
        let id = a["cursor"]["session_id"].as_str().unwrap().to_string();
        let path = a["commit"]["path"].as_str().unwrap().to_string();
        let mut fake = s.lock().unwrap();
        fake.session_calls += 1;
        let mut buf = fake.sessions.remove(&id).unwrap();
        assert_eq!(buf.len() as u64, a["cursor"]["offset"].as_u64().unwrap());
        buf.extend_from_slice(&body);
        fake.files.insert(path.clone(), buf);
        Json(json!({".tag": "file", "path_display": path}))
    }

    async fn download(State(s): State<Shared>, headers: HeaderMap) -> AxumResponse {
        let path = arg(&headers)["path"].as_str().unwrap().to_string();
        match s.lock().unwrap().files.get(&path) {
            Some(data) => data.clone().into_response(),
            None => not_found(),
        }
    }

    async fn list_folder(State(s): State<Shared>, Json(body): Json<Value>) -> AxumResponse {
        let dir = body["path"].as_str().unwrap().to_string();
        let recursive = body["recursive"].as_bool().unwrap();
        let fake = s.lock().unwrap();
        let base = format!("{dir}/");
        let mut entries = Vec::new();
        let mut folders = std::collections::BTreeSet::new();
        for (path, data) in fake.files.iter().filter(|(p, _)| p.starts_with(&base)) {
            let rest = &path[base.len()..];
            match rest.split_once('/') {
                Some((folder, _)) if !recursive => {
                    folders.insert(format!("{base}{folder}"));
                }
                _ => entries.push(json!({
                    ".tag": "file",
                    "path_display": path,
                    "size": data.len(),
                    "server_modified": "2024-01-01T00:00:00Z",
                })),
            }
        }
        if entries.is_empty() && folders.is_empty() {
            return not_found();
        }
        for folder in folders {
            entries.push(json!({".tag": "folder", "path_display": folder}));
        }
        Json(json!({"entries": entries, "cursor": "c", "has_more": false})).into_response()
    }

    async fn fake_dropbox() -> (DropboxStorage, Shared) {
        let shared: Shared = Arc::default();
        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/2/files/upload", post(upload))
            .route("/2/files/upload_session/start", post(session_start))
            .route("/2/files/upload_session/append_v2", post(session_append))
            .route("/2/files/upload_session/finish", post(session_finish))
            .route("/2/files/download", post(download))
            .route("/2/files/list_folder", post(list_folder))
            .layer(DefaultBodyLimit::disable())
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let base = format!("http://{addr}");
        let store = DropboxStorage::new(&DropboxConfig {
            app_key: "k".into(),
            app_secret: "s".into(),
            refresh_token: "r".into(),
            root_path: "/forge".into(),
            api_base: base.clone(),
            content_base: base,
        })
        .unwrap();
        (store, shared)
    }

    #[tokio::test]
    async fn large_payload_round_trips_through_upload_session() {
        let (store, shared) = fake_dropbox().await;
        let payload: Vec<u8> = (0..(9 * 1024 * 1024 + 17)).map(|i| (i % 253) as u8).collect();
        store
            .put("lfs/big", Bytes::from(payload.clone()), &PutOptions::default())
            .await
            .unwrap();
        // start + one append + finish
        assert_eq!(shared.lock().unwrap().session_calls, 3);

        let back = store.get("lfs/big", &GetOptions::default()).await.unwrap();
        assert_eq!(&back[..], &payload[..]);

        let ranged = store.get("lfs/big", &GetOptions::range(10, Some(20))).await.unwrap();
        assert_eq!(&ranged[..], &payload[10..20]);
    }

    #[tokio::test]
    async fn small_payload_and_missing_key() {
        let (store, shared) = fake_dropbox().await;
        store
            .put("repos/a/b.git/HEAD", Bytes::from_static(b"ref"), &PutOptions::default())
            .await
            .unwrap();
        assert!(shared.lock().unwrap().files.contains_key("/forge/repos/a/b.git/HEAD"));
        let err = store.get("repos/a/b.git/nope", &GetOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn prefix_listing_walks_folders() {
        let (store, _shared) = fake_dropbox().await;
        for key in [
            "repos/acme/w.git/HEAD",
            "repos/acme/w.git/objects/ab/cd",
            "repos/acme/z.git/HEAD",
        ] {
            store
                .put(key, Bytes::from_static(b"x"), &PutOptions::default())
                .await
                .unwrap();
        }

        let flat = store.list(&ListOptions::prefix("repos/acme/w.git/")).await.unwrap();
        assert_eq!(
            flat.keys(),
            vec!["repos/acme/w.git/HEAD", "repos/acme/w.git/objects/ab/cd"]
        );

        let level = store
            .list(&ListOptions::prefix("repos/acme/").delimited())
            .await
            .unwrap();
        assert!(level.objects.is_empty());
        assert_eq!(level.prefixes, vec!["repos/acme/w.git/", "repos/acme/z.git/"]);

        let missing = store.list(&ListOptions::prefix("repos/none/")).await.unwrap();
        assert!(missing.objects.is_empty());
    }

    #[test]
    fn api_arg_escapes_non_ascii() {
        assert_eq!(
            api_arg(&json!({"path": "/forge/ré"})),
            r#"{"path":"/forge/r\u00e9"}"#
        );
    }
}
