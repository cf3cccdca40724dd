//! Shared plumbing for the REST-backed adapters: client construction, status
//! classification and multipart bodies.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};

use crate::error::{StorageError, StorageResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Build the HTTP client for one adapter.  `follow_redirects = false` is
/// needed where a 3xx is a protocol answer (resumable uploads).
pub(crate) fn build_client(
    backend: &'static str,
    follow_redirects: bool,
) -> StorageResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("forgestore/", env!("CARGO_PKG_VERSION")));
    if !follow_redirects {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    builder
        .build()
        .map_err(|e| StorageError::transient(backend, format!("build HTTP client: {e}")))
}

/// A request that never produced a response.
pub(crate) fn send_error(backend: &'static str, err: reqwest::Error) -> StorageError {
    StorageError::transient(backend, err)
}

/// Map a failed status to the error taxonomy.
pub(crate) fn status_error(
    backend: &'static str,
    key: &str,
    status: StatusCode,
    body: &str,
) -> StorageError {
    let body = body.trim();
    match status {
        StatusCode::NOT_FOUND => StorageError::not_found(key),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::auth(backend, format!("{status}: {body}"))
        }
        _ => StorageError::transient(backend, format!("{key}: {status}: {body}")),
    }
}

/// Pass successful responses through; classify everything else.
pub(crate) async fn check(
    backend: &'static str,
    key: &str,
    resp: Response,
) -> StorageResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(backend, key, status, &body))
}

pub(crate) async fn read_bytes(backend: &'static str, resp: Response) -> StorageResult<Bytes> {
    resp.bytes().await.map_err(|e| send_error(backend, e))
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    backend: &'static str,
    resp: Response,
) -> StorageResult<T> {
    resp.json()
        .await
        .map_err(|e| StorageError::transient(backend, format!("decode response: {e}")))
}

/// `multipart/related` body with a JSON metadata part followed by the
/// payload, as used by the Google upload endpoints.  Returns the body and
/// the `Content-Type` header value.
pub(crate) fn multipart_related(
    metadata: &serde_json::Value,
    data: &[u8],
    content_type: &str,
) -> (Bytes, String) {
    let boundary = format!("forgestore-{:016x}", rand_boundary());
    let mut body = BytesMut::with_capacity(data.len() + 512);
    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(metadata.to_string().as_bytes());
    body.put_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (
        body.freeze(),
        format!("multipart/related; boundary={boundary}"),
    )
}

fn rand_boundary() -> u64 {
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    hasher.write_u128(Utc::now().timestamp_nanos_opt().unwrap_or_default() as u128);
    hasher.finish()
}

pub(crate) fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// `Last-Modified` style dates (`Tue, 15 Nov 1994 08:12:31 GMT`).
pub(crate) fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Helpers for the fake HTTP backends used by adapter tests.
#[cfg(test)]
pub(crate) mod testing {
    /// Serve `app` on an ephemeral local port and return its base URL.
    pub(crate) async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Split a body built by [`super::multipart_related`] into its metadata
    /// and payload parts.
    pub(crate) fn split_multipart(content_type: &str, body: &[u8]) -> (serde_json::Value, Vec<u8>) {
        let boundary = content_type
            .split_once("boundary=")
            .map(|(_, b)| b.trim_matches('"'))
            .unwrap();
        let separator = format!("\r\n--{boundary}\r\n");
        let closing = format!("\r\n--{boundary}--\r\n");

        let json_start = find(body, b"\r\n\r\n").unwrap() + 4;
        let json_end = json_start + find(&body[json_start..], separator.as_bytes()).unwrap();
        let metadata = serde_json::from_slice(&body[json_start..json_end]).unwrap();

        let rest = &body[json_end + separator.len()..];
        let data_start = find(rest, b"\r\n\r\n").unwrap() + 4;
        let data = rest[data_start..].strip_suffix(closing.as_bytes()).unwrap();
        (metadata, data.to_vec())
    }

    /// Apply an HTTP `Range: bytes=a-b` header to a stored payload.
    pub(crate) fn apply_range(header: Option<&str>, data: &[u8]) -> Vec<u8> {
        let Some((from, to)) = header
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.split_once('-'))
        else {
            return data.to_vec();
        };
        let to = to.parse::<usize>().map_or(data.len(), |t| (t + 1).min(data.len()));
        let from = from.parse::<usize>().unwrap().min(to);
        data[from..to].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(status_error("gcs", "k", StatusCode::NOT_FOUND, "").is_not_found());
        assert!(matches!(
            status_error("gcs", "k", StatusCode::FORBIDDEN, "denied"),
            StorageError::AuthFailure { .. }
        ));
        assert!(matches!(
            status_error("gcs", "k", StatusCode::BAD_GATEWAY, ""),
            StorageError::Transient { .. }
        ));
    }

    #[test]
    fn multipart_body_layout() {
        let (body, content_type) =
            multipart_related(&serde_json::json!({"name": "x"}), b"payload", "text/plain");
        let boundary = content_type
            .strip_prefix("multipart/related; boundary=")
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with(&format!("--{boundary}\r\n")));
        assert!(text.contains("{\"name\":\"x\"}"));
        assert!(text.contains("Content-Type: text/plain\r\n\r\npayload\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));

        let (metadata, data) = testing::split_multipart(&content_type, &body);
        assert_eq!(metadata["name"], "x");
        assert_eq!(data, b"payload");
    }

    #[test]
    fn date_parsing() {
        assert!(parse_rfc3339("2024-05-01T10:00:00.000Z").is_some());
        assert!(parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").is_some());
        assert!(parse_http_date("garbage").is_none());
    }
}
