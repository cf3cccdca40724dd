//! Git LFS batch API resolution on top of the storage contract.
//!
//! Objects live at `lfs/{oid}`; every action is a signed URL valid for 24
//! hours, pointing either at the backend itself or at the signed proxy
//! endpoints for backends without native URL signing.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::storage::{lfs_key, StorageAdapter};

/// Lifetime of every signed action URL.
pub const LINK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const RESOLVE_CONCURRENCY: usize = 8;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub operation: Operation,
    #[serde(default)]
    pub transfers: Vec<String>,
    pub objects: Vec<ObjectSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub transfer: &'static str,
    pub objects: Vec<ObjectResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub href: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Actions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectResponse {
    pub oid: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

impl ObjectResponse {
    fn error(spec: ObjectSpec, code: u16, message: impl Into<String>) -> Self {
        Self {
            oid: spec.oid,
            size: spec.size,
            actions: None,
            error: Some(ObjectError {
                code,
                message: message.into(),
            }),
        }
    }

    fn with_actions(spec: ObjectSpec, actions: Option<Actions>) -> Self {
        Self {
            oid: spec.oid,
            size: spec.size,
            actions,
            error: None,
        }
    }
}

/// LFS object ids are SHA-256 digests in lowercase hex.
pub fn is_valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn action(href: String) -> Action {
    Action {
        href,
        expires_in: LINK_TTL.as_secs(),
        header: HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

async fn resolve_object(
    storage: &dyn StorageAdapter,
    operation: Operation,
    spec: ObjectSpec,
) -> StorageResult<ObjectResponse> {
    if !is_valid_oid(&spec.oid) {
        return Ok(ObjectResponse::error(spec, 422, "invalid object id"));
    }
    let key = lfs_key(&spec.oid);

    match operation {
        Operation::Download => match storage.stat(&key).await {
            Ok(_) => {
                let href = storage.signed_url(&key, LINK_TTL).await?;
                Ok(ObjectResponse::with_actions(
                    spec,
                    Some(Actions {
                        download: Some(action(href)),
                        upload: None,
                    }),
                ))
            }
            Err(e) if e.is_not_found() => Ok(ObjectResponse::error(spec, 404, "object does not exist")),
            Err(e) => Err(e),
        },
        Operation::Upload => {
            // An object already stored at the same size needs no transfer.
            match storage.stat(&key).await {
                Ok(existing) if existing.size == spec.size => {
                    return Ok(ObjectResponse::with_actions(spec, None));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            match storage.signed_upload_url(&key, LINK_TTL).await {
                Ok(href) => Ok(ObjectResponse::with_actions(
                    spec,
                    Some(Actions {
                        download: None,
                        upload: Some(action(href)),
                    }),
                )),
                Err(StorageError::Unsupported { backend, .. }) => Ok(ObjectResponse::error(
                    spec,
                    501,
                    format!("{backend} storage does not accept direct uploads"),
                )),
                Err(e) => Err(e),
            }
        }
    }
}

/// Resolve an LFS batch request into per-object actions or errors.
///
/// Per-object problems (bad oid, missing object) become object errors;
/// only backend failures fail the whole batch.
#[instrument(skip(storage, request), fields(operation = ?request.operation, objects = request.objects.len()))]
pub async fn resolve_batch(
    storage: &dyn StorageAdapter,
    request: BatchRequest,
) -> StorageResult<BatchResponse> {
    let operation = request.operation;
    let objects: Vec<ObjectResponse> = stream::iter(request.objects)
        .map(|spec| resolve_object(storage, operation, spec))
        .buffered(RESOLVE_CONCURRENCY)
        .try_collect()
        .await?;
    debug!(
        errors = objects.iter().filter(|o| o.error.is_some()).count(),
        "batch resolved"
    );
    Ok(BatchResponse {
        transfer: "basic",
        objects,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::storage::config::LocalConfig;
    use crate::storage::local::LocalStorage;
    use crate::storage::{ProxySigner, PutOptions};

    const PRESENT: &str = "4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393";
    const MISSING: &str = "0000000000000000000000000000000000000000000000000000000000000000";

    async fn storage(dir: &std::path::Path) -> LocalStorage {
        let store = LocalStorage::new(
            &LocalConfig {
                base_path: dir.to_path_buf(),
                passthrough: false,
            },
            ProxySigner::new("https://forge.test/api/storage", "k"),
        );
        store
            .put(&lfs_key(PRESENT), Bytes::from_static(b"12345"), &PutOptions::default())
            .await
            .unwrap();
        store
    }

    fn request(operation: Operation, objects: &[(&str, u64)]) -> BatchRequest {
        BatchRequest {
            operation,
            transfers: vec!["basic".into()],
            objects: objects
                .iter()
                .map(|(oid, size)| ObjectSpec {
                    oid: oid.to_string(),
                    size: *size,
                })
                .collect(),
        }
    }

    #[test]
    fn oid_validation() {
        assert!(is_valid_oid(PRESENT));
        assert!(!is_valid_oid(&PRESENT.to_uppercase()));
        assert!(!is_valid_oid("abc"));
        assert!(!is_valid_oid(&format!("{}g", &PRESENT[..63])));
    }

    #[tokio::test]
    async fn download_signs_present_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(dir.path()).await;
        let resp = resolve_batch(
            &store,
            request(Operation::Download, &[(PRESENT, 5), (MISSING, 1), ("nope", 1)]),
        )
        .await
        .unwrap();

        let download = resp.objects[0].actions.as_ref().unwrap().download.as_ref().unwrap();
        assert!(download
            .href
            .starts_with(&format!("https://forge.test/api/storage/get/lfs/{PRESENT}?expires=")));
        assert_eq!(download.expires_in, 86_400);
        assert_eq!(resp.objects[1].error.as_ref().unwrap().code, 404);
        assert_eq!(resp.objects[2].error.as_ref().unwrap().code, 422);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["transfer"], "basic");
        assert!(json["objects"][1].get("actions").is_none());
    }

    #[tokio::test]
    async fn upload_skips_objects_already_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(dir.path()).await;
        let resp = resolve_batch(&store, request(Operation::Upload, &[(PRESENT, 5), (MISSING, 9)]))
            .await
            .unwrap();
        assert_eq!(resp.objects[0].actions, None);
        assert!(resp.objects[0].error.is_none());
        let upload = resp.objects[1].actions.as_ref().unwrap().upload.as_ref().unwrap();
        assert!(upload.href.contains("/put/lfs/"));
    }

    #[test]
    fn request_parses_from_wire_format() {
        let req: BatchRequest = serde_json::from_str(
            r#"{"operation":"download","objects":[{"oid":"abc","size":3}]}"#,
        )
        .unwrap();
        assert_eq!(req.operation, Operation::Download);
        assert!(req.transfers.is_empty());
    }
}
