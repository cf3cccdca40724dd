//! Google Drive v3.
//!
//! Drive has no paths, only files with parent folder ids.  Keys are mapped
//! onto a folder tree rooted at `googleFolderId`; folder ids are cached per
//! directory path once resolved.  Payloads above 4 MiB use a resumable
//! upload session in 4 MiB chunks (a multiple of the 256 KiB granularity
//! Drive requires).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::config::GdriveConfig;
use super::http::{
    build_client, check, multipart_related, parse_rfc3339, read_bytes, read_json, send_error,
};
use super::listing::fold_entries;
use super::oauth::RefreshTokenAuth;
use super::{
    prefix_dir, split_parent, validate_key, GetOptions, ListOptions, ListResult, PutOptions,
    StorageAdapter, StorageKind, StorageObject, CHUNKED_UPLOAD_THRESHOLD,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "gdrive";
const SCOPE: &str = "https://www.googleapis.com/auth/drive";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,md5Checksum,parents";

#[derive(Debug)]
pub struct GdriveStorage {
    client: reqwest::Client,
    api_base: String,
    root_folder: String,
    auth: RefreshTokenAuth,
    /// Directory path (relative to the root, no trailing slash) to folder id.
    folders: DashMap<String, String>,
    /// Serialises folder creation so concurrent puts do not create
    /// duplicate folders with the same name.
    create_lock: Mutex<()>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Quote a value for a Drive `q` expression.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `(start, end_exclusive)` chunks covering `total` bytes.
pub(crate) fn chunk_ranges(total: usize, chunk: usize) -> Vec<(usize, usize)> {
    (0..total)
        .step_by(chunk.max(1))
        .map(|start| (start, (start + chunk).min(total)))
        .collect()
}

impl GdriveStorage {
    pub fn new(config: &GdriveConfig) -> StorageResult<Self> {
        let client = build_client(BACKEND, false)?;
        let auth = RefreshTokenAuth::new(
            BACKEND,
            client.clone(),
            config.token_url.clone(),
            config.google_client_id.clone(),
            Some(config.google_client_secret.clone()),
            config.google_refresh_token.clone(),
        )
        .with_scope(SCOPE);
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            root_folder: config.google_folder_id.clone(),
            auth,
            folders: DashMap::new(),
            create_lock: Mutex::new(()),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.api_base)
    }

    async fn send(&self, key: &str, builder: RequestBuilder) -> StorageResult<Response> {
        let token = self.auth.access_token().await?;
        let resp = builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| send_error(BACKEND, e))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        check(BACKEND, key, resp).await
    }

    /// Children of a folder, optionally restricted to one name.
    async fn children(&self, parent: &str, name: Option<&str>) -> StorageResult<Vec<DriveFile>> {
        let mut q = format!("{} in parents and trashed = false", quote(parent));
        if let Some(name) = name {
            q.push_str(&format!(" and name = {}", quote(name)));
        }
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q.clone()),
                ("fields", fields.clone()),
                ("pageSize", "1000".to_string()),
                ("supportsAllDrives", "true".to_string()),
                ("includeItemsFromAllDrives", "true".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let resp = self
                .send(parent, self.client.get(self.files_url()).query(&query))
                .await?;
            let page: FileList = read_json(BACKEND, resp).await?;
            out.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(out),
            }
        }
    }

    async fn create_folder(&self, parent: &str, name: &str) -> StorageResult<String> {
        let resp = self
            .send(
                name,
                self.client
                    .post(self.files_url())
                    .query(&[("fields", "id"), ("supportsAllDrives", "true")])
                    .json(&json!({"name": name, "mimeType": FOLDER_MIME, "parents": [parent]})),
            )
            .await?;
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created = read_json(BACKEND, resp).await?;
        debug!(%name, id = %created.id, "folder created");
        Ok(created.id)
    }

    /// Folder id for a directory path, creating missing folders when
    /// `create` is set.  `None` when the folder does not exist.
    async fn resolve_dir(&self, dir: &str, create: bool) -> StorageResult<Option<String>> {
        if dir.is_empty() {
            return Ok(Some(self.root_folder.clone()));
        }
        if let Some(id) = self.folders.get(dir) {
            return Ok(Some(id.clone()));
        }

        let _guard = if create {
            Some(self.create_lock.lock().await)
        } else {
            None
        };
        let mut parent = self.root_folder.clone();
        let mut path = String::new();
        for segment in dir.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);
            if let Some(id) = self.folders.get(&path) {
                parent = id.clone();
                continue;
            }
            let existing = self
                .children(&parent, Some(segment))
                .await?
                .into_iter()
                .find(DriveFile::is_folder);
            let id = match existing {
                Some(folder) => folder.id,
                None if create => self.create_folder(&parent, segment).await?,
                None => return Ok(None),
            };
            self.folders.insert(path.clone(), id.clone());
            parent = id;
        }
        Ok(Some(parent))
    }

    /// The non-folder file stored under `key`, with its parent folder id.
    async fn find_file(&self, key: &str) -> StorageResult<Option<(DriveFile, String)>> {
        validate_key(key)?;
        let (dir, name) = split_parent(key);
        let Some(parent) = self.resolve_dir(dir, false).await? else {
            return Ok(None);
        };
        let file = self
            .children(&parent, Some(name))
            .await?
            .into_iter()
            .find(|f| !f.is_folder());
        Ok(file.map(|f| (f, parent)))
    }

    async fn require_file(&self, key: &str) -> StorageResult<(DriveFile, String)> {
        self.find_file(key)
            .await?
            .ok_or_else(|| StorageError::not_found(key))
    }

    fn to_object(key: String, file: &DriveFile) -> StorageObject {
        let mut object = StorageObject::new(
            key,
            file.size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            file.modified_time
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or_else(Utc::now),
        );
        object.etag = file.md5_checksum.clone();
        object.content_type = Some(file.mime_type.clone());
        object
    }

    async fn upload_resumable(
        &self,
        key: &str,
        existing: Option<&str>,
        metadata: serde_json::Value,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        let (method, url) = match existing {
            Some(id) => (Method::PATCH, format!("{}/{id}", self.upload_url())),
            None => (Method::POST, self.upload_url()),
        };
        let resp = self
            .send(
                key,
                self.client
                    .request(method, url)
                    .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
                    .header("X-Upload-Content-Type", content_type)
                    .header("X-Upload-Content-Length", data.len())
                    .json(&metadata),
            )
            .await?;
        let session = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::transient(BACKEND, "resumable upload without Location"))?
            .to_string();

        let total = data.len();
        for (start, end) in chunk_ranges(total, CHUNKED_UPLOAD_THRESHOLD) {
            let token = self.auth.access_token().await?;
            let resp = self
                .client
                .put(&session)
                .bearer_auth(token)
                .header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, total))
                .body(data.slice(start..end))
                .send()
                .await
                .map_err(|e| send_error(BACKEND, e))?;
            // 308 Resume Incomplete acknowledges an intermediate chunk.
            if resp.status() == StatusCode::PERMANENT_REDIRECT && end < total {
                continue;
            }
            check(BACKEND, key, resp).await?;
        }
        debug!(chunks = total.div_ceil(CHUNKED_UPLOAD_THRESHOLD), "resumable upload finished");
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for GdriveStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Gdrive
    }

    #[instrument(skip(self, data, opts), fields(%key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        validate_key(key)?;
        let (dir, name) = split_parent(key);
        let parent = self
            .resolve_dir(dir, true)
            .await?
            .ok_or_else(|| StorageError::transient(BACKEND, format!("cannot create {dir}")))?;
        let existing = self
            .children(&parent, Some(name))
            .await?
            .into_iter()
            .find(|f| !f.is_folder());
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into());
        // Parents can only be set on creation.
        let metadata = match &existing {
            Some(_) => json!({"name": name}),
            None => json!({"name": name, "parents": [parent]}),
        };

        if data.len() > CHUNKED_UPLOAD_THRESHOLD {
            return self
                .upload_resumable(
                    key,
                    existing.as_ref().map(|f| f.id.as_str()),
                    metadata,
                    data,
                    &content_type,
                )
                .await;
        }

        let (body, multipart_type) = multipart_related(&metadata, &data, &content_type);
        let builder = match &existing {
            Some(file) => self.client.patch(format!("{}/{}", self.upload_url(), file.id)),
            None => self.client.post(self.upload_url()),
        };
        self.send(
            key,
            builder
                .query(&[("uploadType", "multipart"), ("supportsAllDrives", "true")])
                .header("Content-Type", multipart_type)
                .body(body),
        )
        .await?;
        debug!("file uploaded");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(%key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let (file, _) = self.require_file(key).await?;
        let resp = self
            .send(
                key,
                self.client
                    .get(format!("{}/{}", self.files_url(), file.id))
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")]),
            )
            .await?;
        Ok(opts.apply(read_bytes(BACKEND, resp).await?))
    }

    #[instrument(skip(self, opts), fields(prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let start = prefix_dir(&opts.prefix).to_string();
        let Some(start_id) = self.resolve_dir(&start, false).await? else {
            return Ok(ListResult::default());
        };
        let one_level = opts.delimiter().is_some();

        let mut objects = Vec::new();
        let mut folders = Vec::new();
        let mut queue = VecDeque::from([(start, start_id)]);
        while let Some((dir, id)) = queue.pop_front() {
            for child in self.children(&id, None).await? {
                let key = if dir.is_empty() {
                    child.name.clone()
                } else {
                    format!("{dir}/{}", child.name)
                };
                if child.is_folder() {
                    self.folders.insert(key.clone(), child.id.clone());
                    let as_prefix = format!("{key}/");
                    if one_level {
                        folders.push(as_prefix);
                    } else if as_prefix.starts_with(&opts.prefix) || opts.prefix.starts_with(&as_prefix) {
                        queue.push_back((key, child.id));
                    }
                } else {
                    objects.push(Self::to_object(key, &child));
                }
            }
        }
        Ok(fold_entries(objects, folders, opts))
    }

    #[instrument(skip(self), fields(%key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let Some((file, _)) = self.find_file(key).await? else {
            return Ok(());
        };
        match self
            .send(
                key,
                self.client
                    .delete(format!("{}/{}", self.files_url(), file.id))
                    .query(&[("supportsAllDrives", "true")]),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let (file, _) = self.require_file(src).await?;
        validate_key(dst)?;
        self.delete(dst).await?;
        let (dir, name) = split_parent(dst);
        let parent = self
            .resolve_dir(dir, true)
            .await?
            .ok_or_else(|| StorageError::transient(BACKEND, format!("cannot create {dir}")))?;
        self.send(
            src,
            self.client
                .post(format!("{}/{}/copy", self.files_url(), file.id))
                .query(&[("supportsAllDrives", "true")])
                .json(&json!({"name": name, "parents": [parent]})),
        )
        .await?;
        Ok(())
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        let (file, old_parent) = self.require_file(src).await?;
        validate_key(dst)?;
        if let Some((existing, _)) = self.find_file(dst).await? {
            if existing.id != file.id {
                self.delete(dst).await?;
            }
        }
        let (dir, name) = split_parent(dst);
        let parent = self
            .resolve_dir(dir, true)
            .await?
            .ok_or_else(|| StorageError::transient(BACKEND, format!("cannot create {dir}")))?;
        let remove = if file.parents.is_empty() {
            old_parent
        } else {
            file.parents.join(",")
        };
        self.send(
            src,
            self.client
                .patch(format!("{}/{}", self.files_url(), file.id))
                .query(&[
                    ("addParents", parent.as_str()),
                    ("removeParents", remove.as_str()),
                    ("supportsAllDrives", "true"),
                ])
                .json(&json!({"name": name})),
        )
        .await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let (file, _) = self.require_file(key).await?;
        Ok(Self::to_object(key.to_string(), &file))
    }

    /// Grants "anyone with the link" read access and returns the download
    /// link; Drive share links do not expire.
    async fn signed_url(&self, key: &str, _expires_in: Duration) -> StorageResult<String> {
        let (file, _) = self.require_file(key).await?;
        self.send(
            key,
            self.client
                .post(format!("{}/{}/permissions", self.files_url(), file.id))
                .query(&[("supportsAllDrives", "true")])
                .json(&json!({"role": "reader", "type": "anyone"})),
        )
        .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Link {
            web_content_link: Option<String>,
        }
        let resp = self
            .send(
                key,
                self.client
                    .get(format!("{}/{}", self.files_url(), file.id))
                    .query(&[("fields", "webContentLink"), ("supportsAllDrives", "true")]),
            )
            .await?;
        let link: Link = read_json(BACKEND, resp).await?;
        link.web_content_link.ok_or(StorageError::Unsupported {
            backend: BACKEND,
            operation: "download links for this file",
        })
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
    use crate::storage::http::testing::{serve, split_multipart};
    use axum::extract::{DefaultBodyLimit, Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, patch, post, put};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn query_values_are_escaped() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it\'s'");
        assert_eq!(quote(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn chunking_covers_payload() {
        assert_eq!(chunk_ranges(10, 4), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(chunk_ranges(8, 4), vec![(0, 4), (4, 8)]);
        assert!(chunk_ranges(0, 4).is_empty());
        assert_eq!(CHUNKED_UPLOAD_THRESHOLD % (256 * 1024), 0);
    }

    #[test]
    fn file_list_decodes() {
        let list: FileList = serde_json::from_str(
            r#"{"files":[{"id":"1","name":"HEAD","mimeType":"application/octet-stream","size":"21"},
                         {"id":"2","name":"objects","mimeType":"application/vnd.google-apps.folder"}]}"#,
        )
        .unwrap();
        assert!(!list.files[0].is_folder());
        assert!(list.files[1].is_folder());
        let object = GdriveStorage::to_object("repos/a.git/HEAD".into(), &list.files[0]);
        assert_eq!(object.size, 21);
    }

    const ROOT: &str = "rootid";
    const FAKE_PAGE: usize = 2;

    #[derive(Clone)]
    struct FakeFile {
        name: String,
        parent: String,
        mime: String,
        data: Vec<u8>,
    }

    struct Session {
        metadata: Value,
        existing: Option<String>,
        buf: Vec<u8>,
    }

    #[derive(Default)]
    struct Fake {
        base: String,
        files: BTreeMap<String, FakeFile>,
        next_id: usize,
        sessions: HashMap<String, Session>,
        chunk_puts: usize,
    }

    impl Fake {
        fn insert(&mut self, file: FakeFile) -> String {
            self.next_id += 1;
            let id = format!("f{:03}", self.next_id);
            self.files.insert(id.clone(), file);
            id
        }

        fn folders(&self) -> usize {
            self.files.values().filter(|f| f.mime == FOLDER_MIME).count()
        }

        /// Store an upload, creating the file or replacing its content.
        fn store(&mut self, existing: Option<String>, metadata: &Value, data: Vec<u8>) -> Value {
            let name = metadata["name"].as_str().unwrap().to_string();
            let id = match existing {
                Some(id) => {
                    let file = self.files.get_mut(&id).unwrap();
                    file.name = name;
                    file.data = data;
                    id
                }
                None => self.insert(FakeFile {
                    name,
                    parent: metadata["parents"][0].as_str().unwrap().to_string(),
                    mime: "application/octet-stream".into(),
                    data,
                }),
            };
            resource(&id, &self.files[&id])
        }
    }

    type Shared = Arc<StdMutex<Fake>>;

    fn resource(id: &str, file: &FakeFile) -> Value {
        let mut out = serde_json::json!({
            "id": id,
            "name": file.name,
            "mimeType": file.mime,
            "modifiedTime": "2024-01-01T00:00:00Z",
            "parents": [file.parent],
        });
        if file.mime != FOLDER_MIME {
            out["size"] = file.data.len().to_string().into();
            out["md5Checksum"] = format!("m{}", file.data.len()).into();
        }
        out
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer drive-token")
    }

    /// `'{parent}' in parents and trashed = false[ and name = '{name}']`
    fn parse_q(q: &str) -> (String, Option<String>) {
        let parent = q
            .strip_prefix('\'')
            .and_then(|r| r.split_once("' in parents"))
            .map(|(p, _)| p.to_string())
            .unwrap();
        let name = q
            .split_once(" and name = '")
            .map(|(_, n)| n.trim_end_matches('\'').to_string());
        (parent, name)
    }

    async fn token() -> Json<Value> {
        Json(serde_json::json!({"access_token": "drive-token", "expires_in": 3600}))
    }

    async fn list_files(
        State(s): State<Shared>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let (parent, name) = parse_q(&q["q"]);
        let offset: usize = q.get("pageToken").map_or(0, |t| t.parse().unwrap());
        let fake = s.lock().unwrap();
        let mut matching: Vec<(&String, &FakeFile)> = fake
            .files
            .iter()
            .filter(|(_, f)| f.parent == parent && name.as_ref().map_or(true, |n| *n == f.name))
            .collect();
        matching.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        let end = (offset + FAKE_PAGE).min(matching.len());
        let files: Vec<Value> = matching[offset.min(end)..end]
            .iter()
            .map(|(id, f)| resource(id, f))
            .collect();
        let mut page = serde_json::json!({"files": files});
        if end < matching.len() {
            page["nextPageToken"] = end.to_string().into();
        }
        Json(page).into_response()
    }

    async fn create_folder(
        State(s): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        if !authorized(&headers) || body["mimeType"] != FOLDER_MIME {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let id = s.lock().unwrap().insert(FakeFile {
            name: body["name"].as_str().unwrap().to_string(),
            parent: body["parents"][0].as_str().unwrap().to_string(),
            mime: FOLDER_MIME.into(),
            data: Vec::new(),
        });
        Json(serde_json::json!({"id": id})).into_response()
    }

    async fn file(
        State(s): State<Shared>,
        Path(id): Path<String>,
        Query(q): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let fake = s.lock().unwrap();
        let Some(file) = fake.files.get(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if q.get("alt").map(String::as_str) == Some("media") {
            return file.data.clone().into_response();
        }
        if q.get("fields").map(String::as_str) == Some("webContentLink") {
            let link = format!("{}/dl/{id}", fake.base);
            return Json(serde_json::json!({"webContentLink": link})).into_response();
        }
        Json(resource(&id, file)).into_response()
    }

    async fn delete_file(State(s): State<Shared>, Path(id): Path<String>) -> StatusCode {
        match s.lock().unwrap().files.remove(&id) {
            Some(_) => StatusCode::NO_CONTENT,
            None => StatusCode::NOT_FOUND,
        }
    }

    async fn update_file(
        State(s): State<Shared>,
        Path(id): Path<String>,
        Query(q): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        let mut fake = s.lock().unwrap();
        let Some(file) = fake.files.get_mut(&id) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        assert_eq!(q["removeParents"], file.parent);
        file.parent = q["addParents"].clone();
        file.name = body["name"].as_str().unwrap().to_string();
        Json(resource(&id, file)).into_response()
    }

    async fn copy_file(
        State(s): State<Shared>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        let mut fake = s.lock().unwrap();
        let Some(mut copy) = fake.files.get(&id).cloned() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        copy.name = body["name"].as_str().unwrap().to_string();
        copy.parent = body["parents"][0].as_str().unwrap().to_string();
        let new_id = fake.insert(copy);
        Json(resource(&new_id, &fake.files[&new_id])).into_response()
    }

    async fn share(Path(_id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["type"], "anyone");
        Json(serde_json::json!({"id": "anyoneWithLink"}))
    }

    async fn upload(
        s: Shared,
        existing: Option<String>,
        q: HashMap<String, String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let mut fake = s.lock().unwrap();
        match q["uploadType"].as_str() {
            "multipart" => {
                let content_type = headers["content-type"].to_str().unwrap();
                let (metadata, data) = split_multipart(content_type, &body);
                Json(fake.store(existing, &metadata, data)).into_response()
            }
            "resumable" => {
                assert!(headers.contains_key("x-upload-content-length"));
                let sid = format!("s{}", fake.sessions.len());
                let metadata = serde_json::from_slice(&body).unwrap();
                fake.sessions.insert(
                    sid.clone(),
                    Session {
                        metadata,
                        existing,
                        buf: Vec::new(),
                    },
                );
                let location = format!("{}/upload/session/{sid}", fake.base);
                ([("location", location)], "").into_response()
            }
            _ => StatusCode::BAD_REQUEST.into_response(),
        }
    }

    async fn upload_new(
        State(s): State<Shared>,
        Query(q): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        upload(s, None, q, headers, body).await
    }

    async fn upload_existing(
        State(s): State<Shared>,
        Path(id): Path<String>,
        Query(q): Query<HashMap<String, String>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        upload(s, Some(id), q, headers, body).await
    }

    /// One chunk of a resumable session: `Content-Range: bytes a-b/total`.
    async fn session_chunk(
        State(s): State<Shared>,
        Path(sid): Path<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        let range = headers["content-range"].to_str().unwrap();
        let (span, total) = range.strip_prefix("bytes ").unwrap().split_once('/').unwrap();
        let start: usize = span.split_once('-').unwrap().0.parse().unwrap();
        let total: usize = total.parse().unwrap();

        let mut fake = s.lock().unwrap();
        fake.chunk_puts += 1;
        let session = fake.sessions.get_mut(&sid).unwrap();
        assert_eq!(session.buf.len(), start);
        session.buf.extend_from_slice(&body);
        if session.buf.len() < total {
            let received = format!("bytes=0-{}", session.buf.len() - 1);
            return (StatusCode::PERMANENT_REDIRECT, [("range", received)]).into_response();
        }
        let session = fake.sessions.remove(&sid).unwrap();
        Json(fake.store(session.existing, &session.metadata, session.buf)).into_response()
    }

    async fn fake_drive() -> (GdriveStorage, Shared, String) {
        let shared: Shared = Arc::default();
        let app = Router::new()
            .route("/token", post(token))
            .route("/drive/v3/files", get(list_files).post(create_folder))
            .route(
                "/drive/v3/files/{id}",
                get(file).delete(delete_file).patch(update_file),
            )
            .route("/drive/v3/files/{id}/copy", post(copy_file))
            .route("/drive/v3/files/{id}/permissions", post(share))
            .route("/upload/drive/v3/files", post(upload_new))
            .route("/upload/drive/v3/files/{id}", patch(upload_existing))
            .route("/upload/session/{sid}", put(session_chunk))
            .layer(DefaultBodyLimit::disable())
            .with_state(shared.clone());
        let base = serve(app).await;
        shared.lock().unwrap().base = base.clone();

        let store = GdriveStorage::new(&GdriveConfig {
            google_client_id: "id".into(),
            google_client_secret: "secret".into(),
            google_refresh_token: "rt".into(),
            google_folder_id: ROOT.into(),
            api_base: base.clone(),
            token_url: format!("{base}/token"),
        })
        .unwrap();
        (store, shared, base)
    }

    #[tokio::test]
    async fn large_payload_uses_resumable_session() {
        let (store, shared, _) = fake_drive().await;
        let payload: Vec<u8> = (0..(9 * 1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        store
            .put("lfs/big", Bytes::from(payload.clone()), &PutOptions::default())
            .await
            .unwrap();
        {
            let fake = shared.lock().unwrap();
            // Two 308 acknowledgements and the final chunk.
            assert_eq!(fake.chunk_puts, 3);
            assert!(fake.sessions.is_empty());
        }

        let back = store.get("lfs/big", &GetOptions::default()).await.unwrap();
        assert_eq!(&back[..], &payload[..]);
        let ranged = store.get("lfs/big", &GetOptions::range(10, Some(20))).await.unwrap();
        assert_eq!(&ranged[..], &payload[10..20]);

        // Overwriting keeps a single file.
        store
            .put("lfs/big", Bytes::from_static(b"small"), &PutOptions::default())
            .await
            .unwrap();
        let fake = shared.lock().unwrap();
        let files: Vec<_> = fake.files.values().filter(|f| f.name == "big").collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data, b"small");
    }

    #[tokio::test]
    async fn put_get_list_round_trip() {
        let (store, shared, _) = fake_drive().await;
        for key in [
            "repos/acme/w.git/HEAD",
            "repos/acme/w.git/objects/ab/cd",
            "repos/acme/notes.txt",
            "repos/acme/z.git/HEAD",
        ] {
            store
                .put(key, Bytes::from(key.as_bytes().to_vec()), &PutOptions::default())
                .await
                .unwrap();
        }
        // repos, acme, w.git, objects, ab, z.git
        assert_eq!(shared.lock().unwrap().folders(), 6);

        let head = store.get("repos/acme/w.git/HEAD", &GetOptions::default()).await.unwrap();
        assert_eq!(&head[..], b"repos/acme/w.git/HEAD");
        let meta = store.stat("repos/acme/w.git/HEAD").await.unwrap();
        assert_eq!(meta.size, 21);
        assert_eq!(meta.etag.as_deref(), Some("m21"));

        let flat = store.list(&ListOptions::prefix("repos/acme/w.git/")).await.unwrap();
        assert_eq!(
            flat.keys(),
            vec!["repos/acme/w.git/HEAD", "repos/acme/w.git/objects/ab/cd"]
        );

        let level = store
            .list(&ListOptions::prefix("repos/acme/").delimited())
            .await
            .unwrap();
        assert_eq!(level.keys(), vec!["repos/acme/notes.txt"]);
        assert_eq!(level.prefixes, vec!["repos/acme/w.git/", "repos/acme/z.git/"]);

        let missing = store.list(&ListOptions::prefix("repos/none/")).await.unwrap();
        assert!(missing.objects.is_empty());
        let err = store.get("repos/none/HEAD", &GetOptions::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn copy_move_delete_and_share_link() {
        let (store, shared, base) = fake_drive().await;
        store
            .put("lfs/src", Bytes::from_static(b"payload"), &PutOptions::default())
            .await
            .unwrap();

        store.copy("lfs/src", "lfs/copy").await.unwrap();
        store.move_object("lfs/copy", "archive/moved").await.unwrap();
        assert!(!store.exists("lfs/copy").await.unwrap());
        assert_eq!(
            &store.get("archive/moved", &GetOptions::default()).await.unwrap()[..],
            b"payload"
        );

        store.delete("lfs/src").await.unwrap();
        store.delete("lfs/src").await.unwrap();
        assert!(!store.exists("lfs/src").await.unwrap());

        let link = store.signed_url("archive/moved", Duration::from_secs(60)).await.unwrap();
        assert!(link.starts_with(&format!("{base}/dl/")));
        assert!(store
            .signed_upload_url("archive/moved", Duration::from_secs(60))
            .await
            .is_err());

        let fake = shared.lock().unwrap();
        let names: Vec<&str> = fake
            .files
            .values()
            .filter(|f| f.mime != FOLDER_MIME)
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["moved"]);
    }
}
