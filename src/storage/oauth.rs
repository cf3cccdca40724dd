//! OAuth2 access-token providers for the REST backends.
//!
//! Two flows are supported: the refresh-token grant (Dropbox, Google Drive,
//! OneDrive) and the service-account JWT bearer grant (GCS).  Both cache the
//! access token until shortly before expiry; refreshes are serialised by the
//! cache mutex so concurrent requests share one token request.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::http::{read_json, send_error};
use crate::error::{StorageError, StorageResult};

/// Tokens are considered expired this long before their actual expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(120);

const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_BUFFER >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    /// Providers that rotate refresh tokens return the replacement here.
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn request_token(
    backend: &'static str,
    client: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> StorageResult<TokenResponse> {
    let resp = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|e| send_error(backend, e))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        // invalid_grant and friends come back as 400.
        if status.is_client_error() {
            return Err(StorageError::auth(
                backend,
                format!("token request rejected ({status}): {}", body.trim()),
            ));
        }
        return Err(StorageError::transient(
            backend,
            format!("token request failed ({status}): {}", body.trim()),
        ));
    }
    read_json(backend, resp).await
}

fn cache_token(resp: &TokenResponse) -> CachedToken {
    CachedToken {
        access_token: resp.access_token.clone(),
        expires_at: Instant::now() + Duration::from_secs(resp.expires_in.unwrap_or(3600)),
    }
}

// ---------------------------------------------------------------------------
// Refresh-token grant
// ---------------------------------------------------------------------------

struct RefreshState {
    refresh_token: String,
    cached: Option<CachedToken>,
}

pub(crate) struct RefreshTokenAuth {
    backend: &'static str,
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    scope: Option<String>,
    state: Mutex<RefreshState>,
}

impl std::fmt::Debug for RefreshTokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenAuth")
            .field("backend", &self.backend)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl RefreshTokenAuth {
    pub(crate) fn new(
        backend: &'static str,
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            scope: None,
            state: Mutex::new(RefreshState {
                refresh_token: refresh_token.into(),
                cached: None,
            }),
        }
    }

    pub(crate) fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// A valid access token, refreshing when the cached one is near expiry.
    pub(crate) async fn access_token(&self) -> StorageResult<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.access_token.clone());
        }

        let refresh_token = state.refresh_token.clone();
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let resp = request_token(self.backend, &self.client, &self.token_url, &form).await?;
        let token = cache_token(&resp);
        if let Some(rotated) = resp.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = rotated;
        }
        debug!(backend = self.backend, "access token refreshed");
        let access = token.access_token.clone();
        state.cached = Some(token);
        Ok(access)
    }

    /// Drop the cached token after the backend rejected it.
    pub(crate) async fn invalidate(&self) {
        self.state.lock().await.cached = None;
    }
}

// ---------------------------------------------------------------------------
// Service-account JWT grant
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
pub(crate) struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: u64,
    iat: u64,
}

pub(crate) struct ServiceAccountAuth {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scope: String,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceAccountAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountAuth")
            .field("client_email", &self.key.client_email)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountAuth {
    pub(crate) fn new(
        key: ServiceAccountKey,
        scope: impl Into<String>,
        client: reqwest::Client,
    ) -> StorageResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            StorageError::InvalidConfig(format!("service account private key: {e}"))
        })?;
        Ok(Self {
            key,
            encoding_key,
            scope: scope.into(),
            client,
            cached: Mutex::new(None),
        })
    }

    pub(crate) fn client_email(&self) -> &str {
        &self.key.client_email
    }

    pub(crate) async fn access_token(&self) -> StorageResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.access_token.clone());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            exp: now + 3600,
            iat: now,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let assertion = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| StorageError::auth("gcs", format!("sign JWT assertion: {e}")))?;

        let resp = request_token(
            "gcs",
            &self.client,
            &self.key.token_uri,
            &[("grant_type", JWT_GRANT_TYPE), ("assertion", &assertion)],
        )
        .await?;
        let token = cache_token(&resp);
        let access = token.access_token.clone();
        *cached = Some(token);
        debug!(client_email = %self.key.client_email, "service account token refreshed");
        Ok(access)
    }

    /// RSA-SHA256 signature of `message` with the service-account key.
    pub(crate) fn sign(&self, message: &[u8]) -> StorageResult<Vec<u8>> {
        let encoded = jsonwebtoken::crypto::sign(message, &self.encoding_key, Algorithm::RS256)
            .map_err(|e| StorageError::auth("gcs", format!("sign URL: {e}")))?;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| StorageError::auth("gcs", format!("decode signature: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_token_expiry_buffer() {
        let fresh = CachedToken {
            access_token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(600),
        };
        assert!(!fresh.is_expired());

        let expiring = CachedToken {
            access_token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(expiring.is_expired());
    }

    #[tokio::test]
    async fn refresh_token_is_rotated_and_cached() {
        use axum::{routing::post, Form, Json, Router};
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let app = Router::new().route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let seen = seen.clone();
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form["grant_type"], "refresh_token");
                    Json(serde_json::json!({
                        "access_token": format!("access-{n}"),
                        "expires_in": 3600,
                        "refresh_token": format!("rotated-{n}"),
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let auth = RefreshTokenAuth::new(
            "dropbox",
            reqwest::Client::new(),
            format!("http://{addr}/token"),
            "id",
            Some("secret".into()),
            "initial",
        );
        assert_eq!(auth.access_token().await.unwrap(), "access-0");
        assert_eq!(auth.access_token().await.unwrap(), "access-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.state.lock().await.refresh_token, "rotated-0");

        auth.invalidate().await;
        assert_eq!(auth.access_token().await.unwrap(), "access-1");
    }
}
