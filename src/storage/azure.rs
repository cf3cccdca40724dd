//! Azure Blob Storage over the REST API.
//!
//! Requests are authorised with SharedKey (HMAC-SHA256 over the canonical
//! request with the account key).  Download URLs are service SAS tokens
//! signed with the same key.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, Response};
use sha2::Sha256;
use tracing::{debug, instrument};

use super::config::AzureConfig;
use super::http::{build_client, check, parse_http_date, read_bytes, send_error};
use super::{
    encode_path, join_prefix, strip_prefix, GetOptions, ListOptions, ListResult, PutOptions,
    StorageAdapter, StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "azure";
const API_VERSION: &str = "2021-08-06";
const SAS_VERSION: &str = "2020-12-06";
const COPY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const COPY_POLL_ATTEMPTS: u32 = 120;

type HmacSha256 = Hmac<Sha256>;

pub struct AzureStorage {
    client: reqwest::Client,
    account: String,
    key: Vec<u8>,
    container: String,
    endpoint: String,
    prefix: String,
}

impl std::fmt::Debug for AzureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureStorage")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// One request to be signed and sent.
struct BlobRequest<'a> {
    method: Method,
    /// Blob key (already prefixed), or `None` for container-level calls.
    blob: Option<&'a str>,
    query: BTreeMap<String, String>,
    ms_headers: BTreeMap<String, String>,
    content_type: Option<String>,
    body: Option<Bytes>,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, blob: Option<&'a str>) -> Self {
        Self {
            method,
            blob,
            query: BTreeMap::new(),
            ms_headers: BTreeMap::new(),
            content_type: None,
            body: None,
        }
    }

    fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.ms_headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// SharedKey string-to-sign for the Blob service.
///
/// `Date` and `Range` stay empty because `x-ms-date` and `x-ms-range` are
/// always used instead.
pub(crate) fn shared_key_string_to_sign(
    method: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &BTreeMap<String, String>,
    account: &str,
    encoded_path: &str,
    query: &BTreeMap<String, String>,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    let mut out = format!("{method}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n");
    for (name, value) in ms_headers {
        out.push_str(&format!("{name}:{}\n", value.trim()));
    }
    out.push_str(&format!("/{account}{encoded_path}"));
    for (name, value) in query {
        out.push_str(&format!("\n{}:{}", name.to_ascii_lowercase(), value));
    }
    out
}

/// Service SAS string-to-sign (version 2020-12-06, blob resource).
pub(crate) fn sas_string_to_sign(
    permissions: &str,
    expiry: &str,
    account: &str,
    container: &str,
    blob: &str,
) -> String {
    [
        permissions,
        "",
        expiry,
        &format!("/blob/{account}/{container}/{blob}"),
        "",
        "",
        "",
        SAS_VERSION,
        "b",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
    ]
    .join("\n")
}

impl AzureStorage {
    pub fn new(config: &AzureConfig) -> StorageResult<Self> {
        let key = BASE64
            .decode(config.account_key.trim())
            .map_err(|e| StorageError::InvalidConfig(format!("AZURE_STORAGE_KEY: {e}")))?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account_name));
        Ok(Self {
            client: build_client(BACKEND, true)?,
            account: config.account_name.clone(),
            key,
            container: config.container.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            prefix: config.prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        join_prefix(&self.prefix, key)
    }

    /// Path component relative to the endpoint, percent-encoded.
    fn resource_path(&self, blob: Option<&str>) -> String {
        match blob {
            Some(blob) => format!("/{}/{}", self.container, encode_path(blob)),
            None => format!("/{}", self.container),
        }
    }

    /// Path prefix of the endpoint itself (non-empty for emulators such as
    /// Azurite, which address `http://host/{account}`).
    fn endpoint_path(&self) -> String {
        url::Url::parse(&self.endpoint)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    fn hmac(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(message.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn send(&self, req: BlobRequest<'_>, key_for_errors: &str) -> StorageResult<Response> {
        let path = self.resource_path(req.blob);
        let mut ms_headers = req.ms_headers;
        ms_headers.insert(
            "x-ms-date".into(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        ms_headers.insert("x-ms-version".into(), API_VERSION.into());

        let content_length = req.body.as_ref().map_or(0, Bytes::len);
        let content_type = req.content_type.clone().unwrap_or_default();
        let string_to_sign = shared_key_string_to_sign(
            req.method.as_str(),
            content_length,
            &content_type,
            &ms_headers,
            &self.account,
            &format!("{}{}", self.endpoint_path(), path),
            &req.query,
        );
        let authorization = format!("SharedKey {}:{}", self.account, self.hmac(&string_to_sign));

        let mut url = format!("{}{}", self.endpoint, path);
        if !req.query.is_empty() {
            let qs = req
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{qs}");
        }

        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .header("Authorization", authorization);
        for (name, value) in &ms_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ct) = req.content_type {
            builder = builder.header("Content-Type", ct);
        }
        match req.body {
            Some(body) => builder = builder.body(body),
            None if req.method == Method::PUT => builder = builder.header("Content-Length", "0"),
            None => {}
        }

        let resp = builder.send().await.map_err(|e| send_error(BACKEND, e))?;
        check(BACKEND, key_for_errors, resp).await
    }

    fn object_from_headers(key: &str, resp: &Response) -> StorageObject {
        let headers = resp.headers();
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let mut object = StorageObject::new(
            key,
            text("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            text("last-modified")
                .and_then(|v| parse_http_date(&v))
                .unwrap_or_else(Utc::now),
        );
        object.etag = text("etag");
        object.content_type = text("content-type");
        let metadata: HashMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().strip_prefix("x-ms-meta-")?;
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        if !metadata.is_empty() {
            object.metadata = Some(metadata);
        }
        object
    }

    async fn wait_for_copy(&self, full_dst: &str, dst: &str) -> StorageResult<()> {
        for _ in 0..COPY_POLL_ATTEMPTS {
            tokio::time::sleep(COPY_POLL_INTERVAL).await;
            let resp = self
                .send(BlobRequest::new(Method::HEAD, Some(full_dst)), dst)
                .await?;
            let status = resp
                .headers()
                .get("x-ms-copy-status")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("success");
            match status {
                "success" => return Ok(()),
                "pending" => continue,
                other => {
                    return Err(StorageError::transient(
                        BACKEND,
                        format!("copy to {dst} ended with status {other}"),
                    ))
                }
            }
        }
        Err(StorageError::transient(
            BACKEND,
            format!("copy to {dst} still pending"),
        ))
    }

    fn sas_url(&self, key: &str, permissions: &str, expires_in: Duration) -> String {
        let full = self.full_key(key);
        let expiry = (Utc::now() + chrono::Duration::seconds(expires_in.as_secs() as i64))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let signature = self.hmac(&sas_string_to_sign(
            permissions,
            &expiry,
            &self.account,
            &self.container,
            &full,
        ));
        format!(
            "{}{}?sv={}&sr=b&sp={}&se={}&sig={}",
            self.endpoint,
            self.resource_path(Some(&full)),
            SAS_VERSION,
            permissions,
            urlencoding::encode(&expiry),
            urlencoding::encode(&signature)
        )
    }
}

#[async_trait]
impl StorageAdapter for AzureStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Azure
    }

    #[instrument(skip(self, data, opts), fields(container = %self.container, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        let full = self.full_key(key);
        let mut req = BlobRequest::new(Method::PUT, Some(&full)).header("x-ms-blob-type", "BlockBlob");
        if let Some(cc) = &opts.cache_control {
            req = req.header("x-ms-blob-cache-control", cc.clone());
        }
        for (name, value) in opts.metadata.iter().flatten() {
            req = req.header(&format!("x-ms-meta-{name}"), value.clone());
        }
        req.content_type = Some(
            opts.content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
        );
        req.body = Some(data);
        self.send(req, key).await?;
        debug!("blob uploaded");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(container = %self.container, %key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let full = self.full_key(key);
        let mut req = BlobRequest::new(Method::GET, Some(&full));
        if let Some(range) = opts.range {
            req = req.header("x-ms-range", range.http_header());
        }
        match self.send(req, key).await {
            Ok(resp) => read_bytes(BACKEND, resp).await,
            // Range starting past the end of the blob.
            Err(StorageError::Transient { message, .. })
                if opts.range.is_some() && message.contains("416") =>
            {
                Ok(Bytes::new())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, opts), fields(container = %self.container, prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let mut result = ListResult::default();
        let mut marker: Option<String> = None;
        let full_prefix = match (self.prefix.trim_matches('/'), opts.prefix.as_str()) {
            ("", p) => p.to_string(),
            (base, "") => format!("{base}/"),
            (base, p) => format!("{base}/{p}"),
        };

        loop {
            let collected = result.objects.len() + result.prefixes.len();
            let remaining = opts.max_keys.map(|max| max.saturating_sub(collected));
            if remaining == Some(0) {
                result.is_truncated = true;
                break;
            }

            let mut req = BlobRequest::new(Method::GET, None)
                .query("restype", "container")
                .query("comp", "list")
                .query("prefix", full_prefix.clone());
            if let Some(d) = opts.delimiter() {
                req = req.query("delimiter", d);
            }
            if let Some(r) = remaining {
                req = req.query("maxresults", r.min(5000).to_string());
            }
            if let Some(m) = marker.take() {
                req = req.query("marker", m);
            }

            let resp = self.send(req, &opts.prefix).await?;
            let body = resp.text().await.map_err(|e| send_error(BACKEND, e))?;
            let page = xml::parse_list(&body).map_err(|e| {
                StorageError::transient(BACKEND, format!("malformed List Blobs response: {e}"))
            })?;
            marker = page.next_marker().map(str::to_owned);

            for item in page.blobs.items {
                match item {
                    xml::BlobItem::Blob(blob) => {
                        let props = blob.properties;
                        let mut object = StorageObject::new(
                            strip_prefix(&self.prefix, &blob.name),
                            props.content_length,
                            props
                                .last_modified
                                .as_deref()
                                .and_then(parse_http_date)
                                .unwrap_or_else(Utc::now),
                        );
                        object.etag = props.etag;
                        object.content_type = props.content_type.filter(|c| !c.is_empty());
                        result.objects.push(object);
                    }
                    xml::BlobItem::BlobPrefix(p) => result
                        .prefixes
                        .push(strip_prefix(&self.prefix, &p.name).to_string()),
                }
            }

            if marker.is_none() {
                break;
            }
        }

        result.objects.sort_by(|a, b| a.key.cmp(&b.key));
        result.prefixes.sort();
        Ok(result)
    }

    #[instrument(skip(self), fields(container = %self.container, %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let full = self.full_key(key);
        match self
            .send(BlobRequest::new(Method::DELETE, Some(&full)), key)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(container = %self.container, %src, %dst))]
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let full_src = self.full_key(src);
        let full_dst = self.full_key(dst);
        let source_url = format!("{}{}", self.endpoint, self.resource_path(Some(&full_src)));
        let resp = self
            .send(
                BlobRequest::new(Method::PUT, Some(&full_dst)).header("x-ms-copy-source", source_url),
                src,
            )
            .await?;
        let pending = resp
            .headers()
            .get("x-ms-copy-status")
            .and_then(|v| v.to_str().ok())
            == Some("pending");
        if pending {
            self.wait_for_copy(&full_dst, dst).await?;
        }
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let full = self.full_key(key);
        let resp = self
            .send(BlobRequest::new(Method::HEAD, Some(&full)), key)
            .await?;
        Ok(Self::object_from_headers(key, &resp))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        Ok(self.sas_url(key, "r", expires_in))
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        Ok(self.sas_url(key, "cw", expires_in))
    }
}

/// The `EnumerationResults` document returned by List Blobs.  Elements the
/// adapter does not read are ignored.
mod xml {
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListPage {
        #[serde(default)]
        pub blobs: Blobs,
        #[serde(default)]
        next_marker: Option<String>,
    }

    impl ListPage {
        /// Continuation marker, absent on the last page.
        pub fn next_marker(&self) -> Option<&str> {
            self.next_marker.as_deref().filter(|m| !m.is_empty())
        }
    }

    /// `Blob` and `BlobPrefix` interleave in key order.
    #[derive(Debug, Default, Deserialize)]
    pub(super) struct Blobs {
        #[serde(rename = "$value", default)]
        pub items: Vec<BlobItem>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) enum BlobItem {
        Blob(BlobEntry),
        BlobPrefix(BlobPrefix),
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct BlobEntry {
        pub name: String,
        #[serde(default)]
        pub properties: Properties,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct BlobPrefix {
        pub name: String,
    }

    #[derive(Debug, Default, Deserialize)]
    pub(super) struct Properties {
        #[serde(rename = "Last-Modified", default)]
        pub last_modified: Option<String>,
        #[serde(rename = "Etag", default)]
        pub etag: Option<String>,
        #[serde(rename = "Content-Length", default)]
        pub content_length: u64,
        #[serde(rename = "Content-Type", default)]
        pub content_type: Option<String>,
    }

    pub(super) fn parse_list(doc: &str) -> Result<ListPage, quick_xml::de::DeError> {
        quick_xml::de::from_str(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::http::testing::{apply_range, serve};
    use axum::extract::{Path as UrlPath, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{any, get};
    use axum::Router;
    use std::sync::{Arc, Mutex};

    const LIST_PAGE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="forge">
  <Prefix>repos/acme/</Prefix>
  <Delimiter>/</Delimiter>
  <Blobs>
    <Blob>
      <Name>repos/acme/readme&amp;notes.txt</Name>
      <Properties>
        <Last-Modified>Tue, 15 Nov 1994 08:12:31 GMT</Last-Modified>
        <Etag>0x8D</Etag>
        <Content-Length>42</Content-Length>
        <Content-Type>text/plain</Content-Type>
      </Properties>
    </Blob>
    <BlobPrefix><Name>repos/acme/w.git/</Name></BlobPrefix>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;

    fn split(page: xml::ListPage) -> (Vec<xml::BlobEntry>, Vec<String>) {
        let mut blobs = Vec::new();
        let mut prefixes = Vec::new();
        for item in page.blobs.items {
            match item {
                xml::BlobItem::Blob(b) => blobs.push(b),
                xml::BlobItem::BlobPrefix(p) => prefixes.push(p.name),
            }
        }
        (blobs, prefixes)
    }

    #[test]
    fn parses_list_blobs_page() {
        let page = xml::parse_list(LIST_PAGE).unwrap();
        assert_eq!(page.next_marker(), None);
        let (blobs, prefixes) = split(page);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].name, "repos/acme/readme&notes.txt");
        assert_eq!(blobs[0].properties.content_length, 42);
        assert_eq!(blobs[0].properties.etag.as_deref(), Some("0x8D"));
        assert_eq!(prefixes, vec!["repos/acme/w.git/"]);
    }

    #[test]
    fn list_page_decodes_character_references_and_cdata() {
        let doc = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="forge">
  <Blobs>
    <BlobPrefix><Name>repos/caf&#233;/</Name></BlobPrefix>
    <Blob><Name><![CDATA[repos/a<b>.txt]]></Name><Properties><Content-Length>7</Content-Length><Content-Type /></Properties></Blob>
  </Blobs>
  <NextMarker>2!72!bWFya2Vy</NextMarker>
</EnumerationResults>"#;
        let page = xml::parse_list(doc).unwrap();
        assert_eq!(page.next_marker(), Some("2!72!bWFya2Vy"));
        let (blobs, prefixes) = split(page);
        assert_eq!(prefixes, vec!["repos/café/"]);
        assert_eq!(blobs[0].name, "repos/a<b>.txt");
        assert_eq!(blobs[0].properties.content_length, 7);
        assert!(blobs[0].properties.content_type.as_deref().unwrap_or("").is_empty());
    }

    #[test]
    fn truncated_list_page_is_an_error() {
        assert!(xml::parse_list("<EnumerationResults><Blobs><Blob><Name>x</Name>").is_err());
    }

    #[test]
    fn shared_key_canonical_form() {
        let mut headers = BTreeMap::new();
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        headers.insert("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string());
        headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());
        let mut query = BTreeMap::new();
        query.insert("restype".to_string(), "container".to_string());
        query.insert("comp".to_string(), "list".to_string());

        let s = shared_key_string_to_sign("PUT", 5, "text/plain", &headers, "acct", "/forge/a%20b", &query);
        let expected = "PUT\n\n\n5\n\ntext/plain\n\n\n\n\n\n\n\
x-ms-blob-type:BlockBlob\n\
x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
x-ms-version:2021-08-06\n\
/acct/forge/a%20b\n\
comp:list\n\
restype:container";
        assert_eq!(s, expected);

        let empty = shared_key_string_to_sign("GET", 0, "", &BTreeMap::new(), "acct", "/c", &BTreeMap::new());
        assert_eq!(empty, "GET\n\n\n\n\n\n\n\n\n\n\n\n/acct/c");
    }

    #[test]
    fn sas_has_sixteen_fields() {
        let s = sas_string_to_sign("r", "2024-01-01T00:00:00Z", "acct", "forge", "lfs/abc");
        assert_eq!(s.split('\n').count(), 16);
        assert!(s.starts_with("r\n\n2024-01-01T00:00:00Z\n/blob/acct/forge/lfs/abc\n"));
    }

    #[tokio::test]
    async fn sas_url_shape() {
        let store = AzureStorage::new(&AzureConfig {
            account_name: "acct".into(),
            account_key: BASE64.encode(b"key"),
            container: "forge".into(),
            endpoint: None,
            prefix: String::new(),
        })
        .unwrap();
        let url = store.signed_url("lfs/abc", Duration::from_secs(60)).await.unwrap();
        assert!(url.starts_with("https://acct.blob.core.windows.net/forge/lfs/abc?sv=2020-12-06&sr=b&sp=r&se="));
        assert!(url.contains("&sig="));
    }

    const FAKE_PAGE: usize = 2;

    #[derive(Default)]
    struct Fake {
        blobs: BTreeMap<String, (Vec<u8>, Option<String>)>,
        list_calls: usize,
    }

    type Shared = Arc<Mutex<Fake>>;

    fn escape(s: &str) -> String {
        s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }

    fn signed(headers: &HeaderMap) -> bool {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        auth.starts_with("SharedKey devacct:")
            && headers.contains_key("x-ms-date")
            && headers.get("x-ms-version").and_then(|v| v.to_str().ok()) == Some(API_VERSION)
    }

    fn blob_xml(key: &str, data: &[u8], content_type: Option<&str>) -> String {
        format!(
            "<Blob><Name>{}</Name><Properties>\
             <Last-Modified>Mon, 01 Jan 2024 00:00:00 GMT</Last-Modified>\
             <Etag>0x{:X}</Etag><Content-Length>{}</Content-Length>\
             <Content-Type>{}</Content-Type></Properties></Blob>",
            escape(key),
            data.len(),
            data.len(),
            content_type.unwrap_or_default()
        )
    }

    async fn list_blobs(
        State(s): State<Shared>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> AxumResponse {
        if !signed(&headers) || q.get("comp").map(String::as_str) != Some("list") {
            return StatusCode::FORBIDDEN.into_response();
        }
        let prefix = q.get("prefix").cloned().unwrap_or_default();
        let delimiter = q.get("delimiter").cloned();
        let limit = q
            .get("maxresults")
            .and_then(|m| m.parse().ok())
            .unwrap_or(FAKE_PAGE)
            .min(FAKE_PAGE);
        let marker = q.get("marker").cloned().unwrap_or_default();

        let mut fake = s.lock().unwrap();
        fake.list_calls += 1;

        // (first key covered, element)
        let mut items: Vec<(String, String)> = Vec::new();
        let mut last_group: Option<String> = None;
        for (key, (data, ct)) in fake
            .blobs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            let rest = &key[prefix.len()..];
            if let Some(idx) = delimiter.as_deref().and_then(|d| rest.find(d)) {
                let group = format!("{prefix}{}/", &rest[..idx]);
                if last_group.as_deref() != Some(group.as_str()) {
                    items.push((
                        key.clone(),
                        format!("<BlobPrefix><Name>{}</Name></BlobPrefix>", escape(&group)),
                    ));
                    last_group = Some(group);
                }
                continue;
            }
            items.push((key.clone(), blob_xml(key, data, ct.as_deref())));
        }

        let start = items
            .iter()
            .position(|(first, _)| *first >= marker)
            .unwrap_or(items.len());
        let end = (start + limit).min(items.len());
        let next = items.get(end).map(|(first, _)| first.clone()).unwrap_or_default();
        let body: String = items[start..end].iter().map(|(_, xml)| xml.as_str()).collect();
        let doc = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <EnumerationResults ContainerName=\"forge\"><Prefix>{}</Prefix>\
             <Blobs>{body}</Blobs><NextMarker>{}</NextMarker></EnumerationResults>",
            escape(&prefix),
            escape(&next)
        );
        ([("content-type", "application/xml")], doc).into_response()
    }

    async fn blob(
        State(s): State<Shared>,
        method: Method,
        UrlPath(key): UrlPath<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        if !signed(&headers) {
            return StatusCode::FORBIDDEN.into_response();
        }
        let mut fake = s.lock().unwrap();
        match method {
            Method::PUT => {
                if let Some(source) = headers.get("x-ms-copy-source") {
                    let url = url::Url::parse(source.to_str().unwrap()).unwrap();
                    let src = url.path().strip_prefix("/devacct/forge/").unwrap();
                    let src = urlencoding::decode(src).unwrap().into_owned();
                    let Some(entry) = fake.blobs.get(&src).cloned() else {
                        return StatusCode::NOT_FOUND.into_response();
                    };
                    fake.blobs.insert(key, entry);
                    return (StatusCode::ACCEPTED, [("x-ms-copy-status", "success")]).into_response();
                }
                if headers.get("x-ms-blob-type").and_then(|v| v.to_str().ok()) != Some("BlockBlob") {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                let ct = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                fake.blobs.insert(key, (body.to_vec(), ct));
                StatusCode::CREATED.into_response()
            }
            Method::GET | Method::HEAD => {
                let Some((data, ct)) = fake.blobs.get(&key) else {
                    return StatusCode::NOT_FOUND.into_response();
                };
                let range = headers.get("x-ms-range").and_then(|v| v.to_str().ok());
                let data = apply_range(range, data);
                let headers = [
                    ("etag", format!("0x{:X}", data.len())),
                    ("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
                    (
                        "content-type",
                        ct.clone().unwrap_or_else(|| "application/octet-stream".into()),
                    ),
                ];
                (StatusCode::OK, headers, data).into_response()
            }
            Method::DELETE => match fake.blobs.remove(&key) {
                Some(_) => StatusCode::ACCEPTED.into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    /// Azurite-style endpoint: `http://host/{account}`, blobs stored under
    /// the `tenant` prefix.
    async fn fake_azure() -> (AzureStorage, Shared) {
        let shared: Shared = Arc::default();
        let app = Router::new()
            .route("/devacct/forge", get(list_blobs))
            .route("/devacct/forge/{*key}", any(blob))
            .with_state(shared.clone());
        let base = serve(app).await;

        let store = AzureStorage::new(&AzureConfig {
            account_name: "devacct".into(),
            account_key: BASE64.encode(b"key"),
            container: "forge".into(),
            endpoint: Some(format!("{base}/devacct")),
            prefix: "tenant".into(),
        })
        .unwrap();
        (store, shared)
    }

    #[tokio::test]
    async fn put_get_list_round_trip() {
        let (store, shared) = fake_azure().await;
        let keys = [
            "repos/acme/w.git/HEAD",
            "repos/acme/w.git/objects/ab/cd",
            "repos/acme/w.git/refs/heads/main",
            "repos/acme/z.git/HEAD",
            "repos/acme/notes&todo.txt",
        ];
        for key in keys {
            store
                .put(key, Bytes::from(key.as_bytes().to_vec()), &PutOptions::default())
                .await
                .unwrap();
        }
        assert!(shared
            .lock()
            .unwrap()
            .blobs
            .contains_key("tenant/repos/acme/w.git/HEAD"));

        let head = store.get("repos/acme/w.git/HEAD", &GetOptions::default()).await.unwrap();
        assert_eq!(&head[..], b"repos/acme/w.git/HEAD");
        let ranged = store
            .get("repos/acme/w.git/HEAD", &GetOptions::range(6, Some(10)))
            .await
            .unwrap();
        assert_eq!(&ranged[..], b"acme");

        let flat = store.list(&ListOptions::prefix("repos/acme/w.git/")).await.unwrap();
        assert_eq!(
            flat.keys(),
            vec![
                "repos/acme/w.git/HEAD",
                "repos/acme/w.git/objects/ab/cd",
                "repos/acme/w.git/refs/heads/main",
            ]
        );
        assert_eq!(flat.objects[0].size, 21);
        // Three blobs at two per page.
        assert_eq!(shared.lock().unwrap().list_calls, 2);

        let level = store
            .list(&ListOptions::prefix("repos/acme/").delimited())
            .await
            .unwrap();
        assert_eq!(level.keys(), vec!["repos/acme/notes&todo.txt"]);
        assert_eq!(level.prefixes, vec!["repos/acme/w.git/", "repos/acme/z.git/"]);

        let capped = store
            .list(&ListOptions::prefix("repos/").max_keys(3))
            .await
            .unwrap();
        assert_eq!(capped.objects.len(), 3);
        assert!(capped.is_truncated);
    }

    #[tokio::test]
    async fn stat_copy_move_and_delete() {
        let (store, shared) = fake_azure().await;
        let opts = PutOptions {
            content_type: Some("text/plain".into()),
            ..PutOptions::default()
        };
        store
            .put("lfs/src", Bytes::from_static(b"payload"), &opts)
            .await
            .unwrap();

        let meta = store.stat("lfs/src").await.unwrap();
        assert_eq!(meta.key, "lfs/src");
        assert_eq!(meta.etag.as_deref(), Some("0x7"));
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));

        store.copy("lfs/src", "lfs/copy").await.unwrap();
        store.move_object("lfs/copy", "lfs/moved").await.unwrap();
        assert!(!store.exists("lfs/copy").await.unwrap());
        let moved = store.get("lfs/moved", &GetOptions::default()).await.unwrap();
        assert_eq!(&moved[..], b"payload");

        store.delete("lfs/src").await.unwrap();
        store.delete("lfs/src").await.unwrap();
        assert!(store
            .get("lfs/src", &GetOptions::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            shared.lock().unwrap().blobs.keys().collect::<Vec<_>>(),
            vec!["tenant/lfs/moved"]
        );
    }
}
