//! Google Cloud Storage over the JSON API.
//!
//! Authentication uses a service-account key: bearer tokens come from the
//! JWT grant and signed URLs are V4 (`GOOG4-RSA-SHA256`) signatures made
//! with the same RSA key.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::config::GcsConfig;
use super::http::{
    build_client, check, multipart_related, parse_rfc3339, read_bytes, read_json, send_error,
};
use super::oauth::{ServiceAccountAuth, ServiceAccountKey};
use super::{
    encode_path, join_prefix, strip_prefix, GetOptions, ListOptions, ListResult, PutOptions,
    StorageAdapter, StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "gcs";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
/// V4 signatures are valid for at most seven days.
const MAX_SIGNED_URL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug)]
pub struct GcsStorage {
    client: reqwest::Client,
    bucket: String,
    prefix: String,
    api_base: String,
    auth: ServiceAccountAuth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Pieces of a V4 signed URL computed before the RSA signature.
#[derive(Debug)]
pub(crate) struct V4Signing {
    pub canonical_query: String,
    pub string_to_sign: String,
}

/// Build the canonical query and string-to-sign of a V4 signed URL.
pub(crate) fn v4_signing(
    method: &str,
    host: &str,
    bucket: &str,
    object: &str,
    client_email: &str,
    now: DateTime<Utc>,
    expires_secs: u64,
) -> V4Signing {
    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/auto/storage/goog4_request");
    let credential = format!("{client_email}/{scope}");

    // Parameters are already in sorted order.
    let canonical_query = [
        ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
        ("X-Goog-Credential", credential),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", expires_secs.to_string()),
        ("X-Goog-SignedHeaders", "host".to_string()),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&");

    let canonical_request = format!(
        "{method}\n/{bucket}/{}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD",
        encode_path(object)
    );
    let string_to_sign = format!(
        "GOOG4-RSA-SHA256\n{datetime}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    V4Signing {
        canonical_query,
        string_to_sign,
    }
}

impl GcsStorage {
    pub fn new(config: &GcsConfig) -> StorageResult<Self> {
        let raw = match (&config.credentials_json, &config.credentials_path) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                StorageError::InvalidConfig(format!(
                    "read GCS credentials {}: {e}",
                    path.display()
                ))
            })?,
            (None, None) => {
                return Err(StorageError::InvalidConfig(
                    "GCS credentials are required".into(),
                ))
            }
        };
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| StorageError::InvalidConfig(format!("GCS credentials: {e}")))?;
        let client = build_client(BACKEND, true)?;
        Ok(Self {
            auth: ServiceAccountAuth::new(key, SCOPE, client.clone())?,
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        join_prefix(&self.prefix, key)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base,
            self.bucket,
            urlencoding::encode(&self.full_key(key))
        )
    }

    async fn authed(&self, builder: RequestBuilder) -> StorageResult<RequestBuilder> {
        Ok(builder.bearer_auth(self.auth.access_token().await?))
    }

    async fn execute(&self, key: &str, builder: RequestBuilder) -> StorageResult<reqwest::Response> {
        let resp = self
            .authed(builder)
            .await?
            .send()
            .await
            .map_err(|e| send_error(BACKEND, e))?;
        check(BACKEND, key, resp).await
    }

    fn to_object(&self, resource: ObjectResource) -> StorageObject {
        let mut object = StorageObject::new(
            strip_prefix(&self.prefix, &resource.name),
            resource
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            resource
                .updated
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or_else(Utc::now),
        );
        object.etag = resource.etag;
        object.content_type = resource.content_type;
        object.metadata = resource.metadata;
        object
    }

    fn signed(&self, method: &str, key: &str, expires_in: Duration) -> StorageResult<String> {
        let host = url::Url::parse(&self.api_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "storage.googleapis.com".into());
        let full = self.full_key(key);
        let signing = v4_signing(
            method,
            &host,
            &self.bucket,
            &full,
            self.auth.client_email(),
            Utc::now(),
            expires_in.as_secs().clamp(1, MAX_SIGNED_URL_SECS),
        );
        let signature = hex::encode(self.auth.sign(signing.string_to_sign.as_bytes())?);
        Ok(format!(
            "{}/{}/{}?{}&X-Goog-Signature={}",
            self.api_base,
            self.bucket,
            encode_path(&full),
            signing.canonical_query,
            signature
        ))
    }
}

#[async_trait]
impl StorageAdapter for GcsStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Gcs
    }

    #[instrument(skip(self, data, opts), fields(bucket = %self.bucket, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        let content_type = opts
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into());
        let mut metadata = serde_json::json!({
            "name": self.full_key(key),
            "contentType": content_type,
        });
        if let Some(cc) = &opts.cache_control {
            metadata["cacheControl"] = cc.clone().into();
        }
        if let Some(meta) = &opts.metadata {
            metadata["metadata"] = serde_json::to_value(meta).unwrap_or_default();
        }
        let (body, multipart_type) = multipart_related(&metadata, &data, &content_type);
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=multipart",
            self.api_base, self.bucket
        );
        self.execute(
            key,
            self.client
                .post(url)
                .header("Content-Type", multipart_type)
                .body(body),
        )
        .await?;
        debug!("object uploaded");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(bucket = %self.bucket, %key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let mut builder = self
            .client
            .get(self.object_url(key))
            .query(&[("alt", "media")]);
        if let Some(range) = opts.range {
            builder = builder.header("Range", range.http_header());
        }
        let resp = self.execute(key, builder).await?;
        read_bytes(BACKEND, resp).await
    }

    #[instrument(skip(self, opts), fields(bucket = %self.bucket, prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let mut result = ListResult::default();
        let mut page_token: Option<String> = None;
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

            let mut query = vec![("prefix", full_prefix.clone())];
            if let Some(d) = opts.delimiter() {
                query.push(("delimiter", d.to_string()));
            }
            if let Some(r) = remaining {
                query.push(("maxResults", r.min(1000).to_string()));
            }
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let url = format!("{}/storage/v1/b/{}/o", self.api_base, self.bucket);
            let resp = self
                .execute(&opts.prefix, self.client.get(url).query(&query))
                .await?;
            let page: ObjectList = read_json(BACKEND, resp).await?;

            for item in page.items {
                result.objects.push(self.to_object(item));
            }
            result.prefixes.extend(
                page.prefixes
                    .iter()
                    .map(|p| strip_prefix(&self.prefix, p).to_string()),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        result.objects.sort_by(|a, b| a.key.cmp(&b.key));
        result.prefixes.sort();
        Ok(result)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        match self.execute(key, self.client.delete(self.object_url(key))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %src, %dst))]
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let url = format!(
            "{}/copyTo/b/{}/o/{}",
            self.object_url(src),
            self.bucket,
            urlencoding::encode(&self.full_key(dst))
        );
        self.execute(src, self.client.post(url).header("Content-Length", "0"))
            .await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let resp = self.execute(key, self.client.get(self.object_url(key))).await?;
        let resource: ObjectResource = read_json(BACKEND, resp).await?;
        Ok(self.to_object(resource))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.signed("GET", key, expires_in)
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.signed("PUT", key, expires_in)
    }
}
