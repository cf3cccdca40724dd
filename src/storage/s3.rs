//! S3 and S3-compatible object storage.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{
    BehaviorVersion, Credentials, Region, RequestChecksumCalculation, ResponseChecksumValidation,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::config::S3Config;
use super::{
    encode_path, join_prefix, strip_prefix, GetOptions, ListOptions, ListResult, PutOptions,
    StorageAdapter, StorageKind, StorageObject,
};
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "s3";

/// Wrapper around one bucket (and optional key prefix).
#[derive(Debug)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build a client from the configuration.  Explicit keys bypass the
    /// default provider chain entirely.
    pub async fn connect(config: &S3Config) -> StorageResult<Self> {
        let region = Region::new(config.region.clone());
        let mut builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(id), Some(secret)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(id, secret, None, None, "forgestore")),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        // S3-compatible stores frequently reject the newer default checksums.
        builder = builder
            .force_path_style(config.force_path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired);

        Ok(Self::new(
            Client::from_conf(builder.build()),
            config.bucket.clone(),
            config.prefix.clone(),
        ))
    }

    fn full_key(&self, key: &str) -> String {
        join_prefix(&self.prefix, key)
    }

    async fn presign(&self, key: &str, expires_in: Duration, upload: bool) -> StorageResult<String> {
        let presigning = PresigningConfig::builder()
            .expires_in(expires_in)
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("presigning config: {e}")))?;
        let full = self.full_key(key);
        let req = if upload {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full)
                .presigned(presigning)
                .await
                .map_err(|e| classify(key, e))?
        } else {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(&full)
                .presigned(presigning)
                .await
                .map_err(|e| classify(key, e))?
        };
        Ok(req.uri().to_string())
    }
}

/// Classify an SDK failure by HTTP status first, then by S3 error code.
fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_owned);
    match (status, code.as_deref()) {
        (Some(404), _) | (_, Some("NoSuchKey" | "NotFound")) => StorageError::not_found(key),
        (Some(401 | 403), _)
        | (_, Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch")) => {
            StorageError::auth(BACKEND, DisplayErrorContext(&err))
        }
        _ => StorageError::transient(BACKEND, format!("{key}: {}", DisplayErrorContext(&err))),
    }
}

fn to_chrono(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|d| DateTime::from_timestamp(d.secs(), d.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl StorageAdapter for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    #[instrument(skip(self, data, opts), fields(bucket = %self.bucket, %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .set_content_type(opts.content_type.clone())
            .set_cache_control(opts.cache_control.clone())
            .set_metadata(opts.metadata.clone())
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        debug!("object uploaded");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(bucket = %self.bucket, %key))]
    async fn get(&self, key: &str, opts: &GetOptions) -> StorageResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .set_range(opts.range.map(|r| r.http_header()))
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::transient(BACKEND, format!("read body of {key}: {e}")))?
            .into_bytes();
        debug!(bytes = bytes.len(), "object downloaded");
        Ok(bytes)
    }

    /// ListObjectsV2 with native delimiter support.  Paginates until the
    /// listing is exhausted or `max_keys` entries have been collected.
    #[instrument(skip(self, opts), fields(bucket = %self.bucket, prefix = %opts.prefix))]
    async fn list(&self, opts: &ListOptions) -> StorageResult<ListResult> {
        let mut result = ListResult::default();
        let mut continuation_token: Option<String> = None;
        let full_prefix = self.full_key(&opts.prefix);
        let full_prefix = if opts.prefix.is_empty() && !self.prefix.is_empty() {
            format!("{full_prefix}/")
        } else {
            full_prefix
        };

        loop {
            let collected = result.objects.len() + result.prefixes.len();
            let remaining = opts.max_keys.map(|max| max.saturating_sub(collected));
            if remaining == Some(0) {
                result.is_truncated = true;
                break;
            }

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_delimiter(opts.delimiter().map(str::to_owned))
                .set_max_keys(remaining.map(|r| r.min(1000) as i32))
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| classify(&opts.prefix, e))?;

            for obj in resp.contents() {
                let Some(k) = obj.key() else { continue };
                let mut object = StorageObject::new(
                    strip_prefix(&self.prefix, k),
                    obj.size().unwrap_or(0).max(0) as u64,
                    to_chrono(obj.last_modified()),
                );
                object.etag = obj.e_tag().map(str::to_owned);
                result.objects.push(object);
            }
            for cp in resp.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    result.prefixes.push(strip_prefix(&self.prefix, p).to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        result.objects.sort_by(|a, b| a.key.cmp(&b.key));
        result.prefixes.sort();
        debug!(
            objects = result.objects.len(),
            prefixes = result.prefixes.len(),
            "listed objects"
        );
        Ok(result)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify(key, e) {
                StorageError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, %src, %dst))]
    async fn copy(&self, src: &str, dst: &str) -> StorageResult<()> {
        let source = format!("{}/{}", self.bucket, encode_path(&self.full_key(src)));
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(self.full_key(dst))
            .send()
            .await
            .map_err(|e| classify(src, e))?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<StorageObject> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        let mut object = StorageObject::new(
            key,
            resp.content_length().unwrap_or(0).max(0) as u64,
            to_chrono(resp.last_modified()),
        );
        object.etag = resp.e_tag().map(str::to_owned);
        object.content_type = resp.content_type().map(str::to_owned);
        object.metadata = resp.metadata().cloned();
        Ok(object)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.presign(key, expires_in, false).await
    }

    async fn signed_upload_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        self.presign(key, expires_in, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::listing::fold_listing;
    use axum::extract::{Path, Query, State};
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    type Objects = Arc<Mutex<BTreeMap<String, Bytes>>>;

    async fn list_bucket(
        State(objects): State<Objects>,
        Path(_bucket): Path<String>,
        Query(q): Query<HashMap<String, String>>,
    ) -> Response {
        let all: Vec<StorageObject> = objects
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| StorageObject::new(k.clone(), v.len() as u64, Utc::now()))
            .collect();
        let opts = ListOptions {
            prefix: q.get("prefix").cloned().unwrap_or_default(),
            delimiter: q.get("delimiter").cloned(),
            max_keys: q.get("max-keys").and_then(|m| m.parse().ok()),
        };
        let folded = fold_listing(all, &opts);

        let mut xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
        );
        xml.push_str(&format!(
            "<Name>forge</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount><IsTruncated>{}</IsTruncated>",
            opts.prefix,
            folded.objects.len() + folded.prefixes.len(),
            folded.is_truncated
        ));
        for o in &folded.objects {
            xml.push_str(&format!(
                "<Contents><Key>{}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>\"e\"</ETag><Size>{}</Size></Contents>",
                o.key, o.size
            ));
        }
        for p in &folded.prefixes {
            xml.push_str(&format!("<CommonPrefixes><Prefix>{p}</Prefix></CommonPrefixes>"));
        }
        xml.push_str("</ListBucketResult>");
        ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
    }

    async fn get_object(
        State(objects): State<Objects>,
        Path((_bucket, key)): Path<(String, String)>,
    ) -> Response {
        match objects.lock().unwrap().get(&key) {
            Some(data) => data.clone().into_response(),
            None => (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "application/xml")],
                "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
            )
                .into_response(),
        }
    }

    async fn put_object(
        State(objects): State<Objects>,
        Path((_bucket, key)): Path<(String, String)>,
        body: Bytes,
    ) -> StatusCode {
        objects.lock().unwrap().insert(key, body);
        StatusCode::OK
    }

    async fn fake_s3() -> (S3Storage, Objects) {
        let objects: Objects = Arc::default();
        let app = Router::new()
            .route("/{bucket}", get(list_bucket))
            .route("/{bucket}/", get(list_bucket))
            .route("/{bucket}/{*key}", get(get_object).put(put_object))
            .with_state(objects.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = S3Config {
            bucket: "forge".into(),
            region: "us-east-1".into(),
            endpoint: Some(format!("http://{addr}")),
            access_key_id: Some("test".into()),
            secret_access_key: Some("test".into()),
            force_path_style: true,
            prefix: String::new(),
        };
        (S3Storage::connect(&config).await.unwrap(), objects)
    }

    #[tokio::test]
    async fn put_get_and_missing_key() {
        let (store, _objects) = fake_s3().await;
        store
            .put("repos/a/b.git/HEAD", Bytes::from_static(b"ref"), &PutOptions::default())
            .await
            .unwrap();
        let back = store
            .get("repos/a/b.git/HEAD", &GetOptions::default())
            .await
            .unwrap();
        assert_eq!(back, &b"ref"[..]);

        let err = store.get("repos/a/b.git/nope", &GetOptions::default()).await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[tokio::test]
    async fn prefix_listing_against_list_objects_v2() {
        let (store, objects) = fake_s3().await;
        {
            let mut map = objects.lock().unwrap();
            for key in [
                "repos/acme/w.git/HEAD",
                "repos/acme/w.git/config",
                "repos/acme/w.git/objects/pack/p.pack",
                "repos/acme/z.git/HEAD",
            ] {
                map.insert(key.to_string(), Bytes::from_static(b"x"));
            }
        }

        let flat = store
            .list(&ListOptions::prefix("repos/acme/w.git/"))
            .await
            .unwrap();
        assert_eq!(
            flat.keys(),
            vec![
                "repos/acme/w.git/HEAD",
                "repos/acme/w.git/config",
                "repos/acme/w.git/objects/pack/p.pack",
            ]
        );

        let level = store
            .list(&ListOptions::prefix("repos/acme/").delimited())
            .await
            .unwrap();
        assert!(level.objects.is_empty());
        assert_eq!(level.prefixes, vec!["repos/acme/w.git/", "repos/acme/z.git/"]);
    }
}
