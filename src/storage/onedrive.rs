//! OneDrive through Microsoft Graph.
//!
//! Items are addressed by path (`root:/{folder}/{key}:`) below the configured
//! root folder, so no id cache is needed.  Uploads above 4 MiB go through an
//! upload session whose chunks are a multiple of 320 KiB.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::config::OnedriveConfig;
use super::http::{build_client, check, parse_rfc3339, read_bytes, read_json, send_error};
use super::listing::fold_entries;
use super::oauth::RefreshTokenAuth;
use super::{
    encode_path, prefix_dir, split_parent, validate_key, GetOptions, ListOptions, ListResult,
    PutOptions, StorageAdapter, StorageKind, StorageObject, CHUNKED_UPLOAD_THRESHOLD,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "onedrive";
const SCOPE: &str = "offline_access Files.ReadWrite.All";

/// Twelve 320 KiB units, just under 4 MiB.
pub(crate) const UPLOAD_CHUNK: usize = 12 * 320 * 1024;

#[derive(Debug)]
pub struct OnedriveStorage {
    client: reqwest::Client,
    /// `{graph}/me/drive` or `{graph}/drives/{id}`.
    drive_url: String,
    /// Same drive as a Graph resource path, for `parentReference`.
    drive_ref: String,
    folder: String,
    auth: RefreshTokenAuth,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_date_time: Option<String>,
    #[serde(default, rename = "eTag")]
    e_tag: Option<String>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default)]
    file: Option<FileFacet>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Children {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl OnedriveStorage {
    pub fn new(config: &OnedriveConfig) -> StorageResult<Self> {
        let client = build_client(BACKEND, true)?;
        let graph = config.graph_base.trim_end_matches('/');
        let drive_ref = match &config.drive_id {
            Some(id) => format!("/drives/{id}"),
            None => "/drive".to_string(),
        };
        let drive_url = match &config.drive_id {
            Some(id) => format!("{graph}/drives/{id}"),
            None => format!("{graph}/me/drive"),
        };
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            config.login_base.trim_end_matches('/'),
            config.tenant
        );
        let auth = RefreshTokenAuth::new(
            BACKEND,
            client.clone(),
            token_url,
            config.client_id.clone(),
            config.client_secret.clone(),
            config.refresh_token.clone(),
        )
        .with_scope(SCOPE);
        Ok(Self {
            client,
            drive_url,
            drive_ref,
            folder: config.folder_path.trim_matches('/').to_string(),
            auth,
        })
    }

    /// Drive-relative path of a key or directory.
    pub(crate) fn drive_path(&self, path: &str) -> String {
        match (self.folder.as_str(), path) {
            (folder, "") => folder.to_string(),
            ("", p) => p.to_string(),
            (folder, p) => format!("{folder}/{p}"),
        }
    }

    /// URL of the item for a key or directory, with an optional action suffix.
    pub(crate) fn item_url(&self, path: &str, action: &str) -> String {
        self.raw_url(&self.drive_path(path), action)
    }

    /// Like [`Self::item_url`] for a path already relative to the drive root.
    fn raw_url(&self, path: &str, action: &str) -> String {
        match (path.is_empty(), action) {
            (true, "") => format!("{}/root", self.drive_url),
            (true, action) => format!("{}/root/{action}", self.drive_url),
            (false, "") => format!("{}/root:/{}", self.drive_url, encode_path(path)),
            (false, action) => format!("{}/root:/{}:/{action}", self.drive_url, encode_path(path)),
        }
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

    async fn item(&self, key: &str) -> StorageResult<DriveItem> {
        let resp = self.send(key, self.client.get(self.item_url(key, ""))).await?;
        let item: DriveItem = read_json(BACKEND, resp).await?;
        if item.folder.is_some() {
            return Err(StorageError::not_found(key));
        }
        Ok(item)
    }

    /// Create every folder on a drive-relative path; existing folders are fine.
    async fn ensure_dir(&self, dir: &str) -> StorageResult<()> {
        let mut parent = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            let resp = self
                .send(
                    dir,
                    self.client.post(self.raw_url(&parent, "children")).json(&json!({
                        "name": segment,
                        "folder": {},
                        "@microsoft.graph.conflictBehavior": "fail",
                    })),
                )
                .await;
            match resp {
                Ok(_) => {}
                Err(StorageError::Transient { message, .. }) if message.contains("409") => {}
                Err(e) => return Err(e),
            }
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(segment);
        }
        Ok(())
    }

    async fn children(&self, dir: &str) -> StorageResult<Vec<DriveItem>> {
        let mut out = Vec::new();
        let mut next = Some(format!(
            "{}?$top=1000&$select=name,size,lastModifiedDateTime,eTag,folder,file",
            self.item_url(dir, "children")
        ));
        while let Some(url) = next.take() {
            let resp = self.send(dir, self.client.get(url)).await?;
            let page: Children = read_json(BACKEND, resp).await?;
            out.extend(page.value);
            next = page.next_link;
        }
        Ok(out)
    }

    fn to_object(key: String, item: &DriveItem) -> StorageObject {
        let mut object = StorageObject::new(
            key,
            item.size,
            item.last_modified_date_time
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or_else(Utc::now),
        );
        object.etag = item.e_tag.clone();
        object.content_type = item.file.as_ref().and_then(|f| f.mime_type.clone());
        object
    }

    async fn upload_session(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let resp = self
            .send(
                key,
                self.client
                    .post(self.item_url(key, "createUploadSession"))
                    .json(&json!({"item": {"@microsoft.graph.conflictBehavior": "replace"}})),
            )
            .await?;
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Session {
            upload_url: String,
        }
        let session: Session = read_json(BACKEND, resp).await?;

        let total = data.len();
        let mut start = 0;
        while start < total {
            let end = (start + UPLOAD_CHUNK).min(total);
            // The session URL is pre-authenticated; a bearer token is rejected.
            let resp = self
                .client
                .put(&session.upload_url)
                .header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, total))
                .body(data.slice(start..end))
                .send()
                .await
                .map_err(|e| send_error(BACKEND, e))?;
            check(BACKEND, key, resp).await?;
            start = end;
        }
        debug!(chunks = total.div_ceil(UPLOAD_CHUNK), "upload session finished");
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for OnedriveStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Onedrive
    }

    #[instrument(skip(self, data, opts), fields(%key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        validate_key(key)?;
        if data.len() > CHUNKED_UPLOAD_THRESHOLD {
            return self.upload_session(key, data).await;
        }
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into());
        self.send(
            key,
            self.client
                .put(self.item_url(key, "content"))
                .header("Content-Type", content_type)
                .body(data),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, opts), fields(%key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        validate_key(key)?;
        let resp = self
            .send(key, self.client.get(self.item_url(key, "content")))
            .await?;
        Ok(opts.apply(read_bytes(BACKEND, resp).await?))
    }

    #[instrument(skip(self, opts), fields(prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let start = prefix_dir(&opts.prefix).to_string();
        let one_level = opts.delimiter().is_some();

        let mut objects = Vec::new();
        let mut folders = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(dir) = queue.pop_front() {
            let items = match self.children(&dir).await {
                Ok(items) => items,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            for item in items {
                let key = if dir.is_empty() {
                    item.name.clone()
                } else {
                    format!("{dir}/{}", item.name)
                };
                if item.folder.is_none() {
                    objects.push(Self::to_object(key, &item));
                    continue;
                }
                let as_prefix = format!("{key}/");
                if one_level {
                    folders.push(as_prefix);
                } else if as_prefix.starts_with(&opts.prefix) || opts.prefix.starts_with(&as_prefix) {
                    queue.push_back(key);
                }
            }
        }
        Ok(fold_entries(objects, folders, opts))
    }

    #[instrument(skip(self), fields(%key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        match self.send(key, self.client.delete(self.item_url(key, ""))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Graph copies are asynchronous jobs; a download and re-upload gives a
    /// completed copy on return.
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let data = self.get(src, &GetOptions::default()).await?;
        self.put(dst, data, &PutOptions::default()).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> StorageResult<()> {
        validate_key(src)?;
        validate_key(dst)?;
        self.item(src).await?;
        let (dir, name) = split_parent(dst);
        let parent = self.drive_path(dir);
        self.ensure_dir(&parent).await?;
        self.send(
            src,
            self.client
                .patch(self.item_url(src, ""))
                .query(&[("@microsoft.graph.conflictBehavior", "replace")])
                .json(&json!({
                    "name": name,
                    "parentReference": {"path": format!("{}/root:/{parent}", self.drive_ref)},
                })),
        )
        .await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        validate_key(key)?;
        let item = self.item(key).await?;
        Ok(Self::to_object(key.to_string(), &item))
    }

    /// Anonymous view link; Graph sharing links carry no expiry on
    /// personal drives.
    async fn signed_url(&self, key: &str, _expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Link {
            web_url: String,
        }
        #[derive(Deserialize)]
        struct Permission {
            link: Link,
        }
        let resp = self
            .send(
                key,
                self.client
                    .post(self.item_url(key, "createLink"))
                    .json(&json!({"type": "view", "scope": "anonymous"})),
            )
            .await?;
        let permission: Permission = read_json(BACKEND, resp).await?;
        Ok(permission.link.web_url)
    }

    async fn signed_upload_url(&self, _key: &str, _expires_in: Duration) -> StorageResult<String> {
        Err(StorageError::Unsupported {
            backend: BACKEND,
            operation: "signed upload URLs",
        })
    }
}
