//! HMAC-signed proxy URLs for backends that cannot mint their own signed
//! URLs (local and FTP).
//!
//! A URL has the form
//! `{base}/{get|put}/{key}?expires=<unix>&signature=<hex>` where the
//! signature is HMAC-SHA256 over `"{op}\n{key}\n{expires}"`.  The binary's
//! `/api/storage` routes verify it and stream the object through the
//! adapter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::encode_path;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOp {
    Get,
    Put,
}

impl ProxyOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed URL has expired")]
    Expired,
    #[error("signature does not match")]
    Mismatch,
    #[error("signature is not valid hex")]
    Malformed,
}

#[derive(Clone)]
pub struct ProxySigner {
    base: String,
    secret: Arc<[u8]>,
}

impl std::fmt::Debug for ProxySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySigner")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl ProxySigner {
    /// `base` is the public URL prefix of the proxy routes, e.g.
    /// `https://forge.example.com/api/storage`.
    pub fn new(base: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            secret: Arc::from(secret.as_ref()),
        }
    }

    pub fn url(&self, op: ProxyOp, key: &str, expires_in: Duration) -> String {
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        self.url_at(op, key, expires)
    }

    fn url_at(&self, op: ProxyOp, key: &str, expires: i64) -> String {
        format!(
            "{}/{}/{}?expires={}&signature={}",
            self.base,
            op.as_str(),
            encode_path(key),
            expires,
            self.sign(op, key, expires)
        )
    }

    fn mac(&self, op: ProxyOp, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(format!("{}\n{}\n{}", op.as_str(), key, expires).as_bytes());
        mac
    }

    pub fn sign(&self, op: ProxyOp, key: &str, expires: i64) -> String {
        hex::encode(self.mac(op, key, expires).finalize().into_bytes())
    }

    /// Check a signature presented on a proxy request.
    pub fn verify(
        &self,
        op: ProxyOp,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<(), SignatureError> {
        if expires < Utc::now().timestamp() {
            return Err(SignatureError::Expired);
        }
        let provided = hex::decode(signature).map_err(|_| SignatureError::Malformed)?;
        self.mac(op, key, expires)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)
    }
}
