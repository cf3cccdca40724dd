//! Backend configuration.
//!
//! A [`StorageConfig`] carries exactly one backend's fields, discriminated by
//! `type`.  It is what the persisted configuration record stores (as JSON)
//! and what [`StorageConfig::from_lookup`] builds out of environment
//! variables.
//!
//! Environment variables, all optional:
//!
//! | kind       | variables |
//! |------------|-----------|
//! | (all)      | `STORAGE_TYPE` (default `local`), `STORAGE_ENV_PRIORITY` |
//! | `local`    | `STORAGE_LOCAL_PATH` (default `./data/storage`), `STORAGE_LOCAL_PASSTHROUGH` |
//! | `s3`       | `S3_BUCKET`, `S3_REGION`, `S3_ENDPOINT`, `S3_ACCESS_KEY_ID`, `S3_SECRET_ACCESS_KEY`, `S3_FORCE_PATH_STYLE`, `S3_PREFIX` |
//! | `gcs`      | `GCS_BUCKET`, `GCS_PROJECT_ID`, `GCS_CREDENTIALS_JSON`, `GCS_CREDENTIALS_PATH` / `GOOGLE_APPLICATION_CREDENTIALS`, `GCS_PREFIX` |
//! | `azure`    | `AZURE_STORAGE_ACCOUNT`, `AZURE_STORAGE_KEY`, `AZURE_CONTAINER`, `AZURE_ENDPOINT`, `AZURE_PREFIX` |
//! | `dropbox`  | `DROPBOX_APP_KEY`, `DROPBOX_APP_SECRET`, `DROPBOX_REFRESH_TOKEN`, `DROPBOX_ROOT_PATH` |
//! | `ftp`      | `FTP_HOST`, `FTP_PORT`, `FTP_USER`, `FTP_PASSWORD`, `FTP_BASE_PATH` |
//! | `rclone`   | `RCLONE_REMOTE`, `RCLONE_BASE_PATH`, `RCLONE_BINARY`, `RCLONE_CONFIG` |
//! | `gdrive`   | `GOOGLE_CLIENT_ID`, `GOOGLE_CLIENT_SECRET`, `GOOGLE_REFRESH_TOKEN`, `GOOGLE_DRIVE_FOLDER_ID` |
//! | `onedrive` | `ONEDRIVE_CLIENT_ID`, `ONEDRIVE_CLIENT_SECRET`, `ONEDRIVE_REFRESH_TOKEN`, `ONEDRIVE_FOLDER_PATH`, `ONEDRIVE_TENANT`, `ONEDRIVE_DRIVE_ID` |

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
    Gcs,
    Azure,
    Dropbox,
    Ftp,
    Rclone,
    Gdrive,
    Onedrive,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Azure => "azure",
            Self::Dropbox => "dropbox",
            Self::Ftp => "ftp",
            Self::Rclone => "rclone",
            Self::Gdrive => "gdrive",
            Self::Onedrive => "onedrive",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "s3" => Self::S3,
            "gcs" => Self::Gcs,
            "azure" => Self::Azure,
            "dropbox" => Self::Dropbox,
            "ftp" => Self::Ftp,
            "rclone" => Self::Rclone,
            "gdrive" => Self::Gdrive,
            "onedrive" => Self::Onedrive,
            other => {
                return Err(StorageError::InvalidConfig(format!(
                    "unknown storage type: {other}"
                )))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Per-backend configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local(LocalConfig),
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Dropbox(DropboxConfig),
    Ftp(FtpConfig),
    Rclone(RcloneConfig),
    Gdrive(GdriveConfig),
    Onedrive(OnedriveConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    #[serde(default = "default_local_path")]
    pub base_path: PathBuf,
    /// Use the storage root directly as the repository location.
    #[serde(default = "default_true")]
    pub passthrough: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsConfig {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Service-account key JSON, inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_gcs_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    pub account_name: String,
    /// Base64 account key.
    pub account_key: String,
    pub container: String,
    /// Defaults to `https://{account}.blob.core.windows.net`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropboxConfig {
    pub app_key: String,
    pub app_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub root_path: String,
    #[serde(default = "default_dropbox_api_base")]
    pub api_base: String,
    #[serde(default = "default_dropbox_content_base")]
    pub content_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default = "default_ftp_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_ftp_base_path")]
    pub base_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcloneConfig {
    /// Remote name as configured in rclone, without the trailing colon.
    pub remote: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_rclone_binary")]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GdriveConfig {
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_refresh_token: String,
    /// Folder that acts as the storage root; `root` means My Drive.
    #[serde(default = "default_gdrive_folder")]
    pub google_folder_id: String,
    #[serde(default = "default_gdrive_api_base")]
    pub api_base: String,
    #[serde(default = "default_google_token_url")]
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnedriveConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub refresh_token: String,
    #[serde(default = "default_onedrive_folder")]
    pub folder_path: String,
    #[serde(default = "default_onedrive_tenant")]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_ms_login_base")]
    pub login_base: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./data/storage")
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_gcs_api_base() -> String {
    "https://storage.googleapis.com".to_string()
}

pub(crate) fn default_dropbox_api_base() -> String {
    "https://api.dropboxapi.com".to_string()
}

pub(crate) fn default_dropbox_content_base() -> String {
    "https://content.dropboxapi.com".to_string()
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_user() -> String {
    "anonymous".to_string()
}

fn default_ftp_base_path() -> String {
    "/".to_string()
}

fn default_rclone_binary() -> String {
    "rclone".to_string()
}

fn default_gdrive_folder() -> String {
    "root".to_string()
}

fn default_gdrive_api_base() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_onedrive_folder() -> String {
    "forgestore".to_string()
}

fn default_onedrive_tenant() -> String {
    "common".to_string()
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_ms_login_base() -> String {
    "https://login.microsoftonline.com".to_string()
}

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

impl StorageConfig {
    /// Default configuration when nothing is set: local storage under
    /// `./data/storage`, used in place.
    pub fn local_default() -> Self {
        Self::Local(LocalConfig {
            base_path: default_local_path(),
            passthrough: true,
        })
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            Self::Local(_) => StorageKind::Local,
            Self::S3(_) => StorageKind::S3,
            Self::Gcs(_) => StorageKind::Gcs,
            Self::Azure(_) => StorageKind::Azure,
            Self::Dropbox(_) => StorageKind::Dropbox,
            Self::Ftp(_) => StorageKind::Ftp,
            Self::Rclone(_) => StorageKind::Rclone,
            Self::Gdrive(_) => StorageKind::Gdrive,
            Self::Onedrive(_) => StorageKind::Onedrive,
        }
    }

    /// SHA-256 over the canonical JSON form.  Two configurations with the
    /// same fingerprint build interchangeable adapters.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }

    /// Parse a persisted JSON record.
    pub fn from_json(raw: &str) -> StorageResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| StorageError::InvalidConfig(format!("storage record: {e}")))
    }

    /// Check that the required fields of the selected kind are present.
    pub fn validate(&self) -> StorageResult<()> {
        match self {
            Self::Local(c) => require("STORAGE_LOCAL_PATH", &c.base_path.to_string_lossy()),
            Self::S3(c) => {
                require("S3_BUCKET", &c.bucket)?;
                if c.access_key_id.is_some() != c.secret_access_key.is_some() {
                    return Err(StorageError::InvalidConfig(
                        "S3 access key id and secret must be set together".into(),
                    ));
                }
                Ok(())
            }
            Self::Gcs(c) => {
                require("GCS_BUCKET", &c.bucket)?;
                if c.credentials_json.is_none() && c.credentials_path.is_none() {
                    return Err(StorageError::InvalidConfig(
                        "GCS requires GCS_CREDENTIALS_JSON or GCS_CREDENTIALS_PATH".into(),
                    ));
                }
                Ok(())
            }
            Self::Azure(c) => {
                require("AZURE_STORAGE_ACCOUNT", &c.account_name)?;
                require("AZURE_STORAGE_KEY", &c.account_key)?;
                require("AZURE_CONTAINER", &c.container)
            }
            Self::Dropbox(c) => {
                require("DROPBOX_APP_KEY", &c.app_key)?;
                require("DROPBOX_APP_SECRET", &c.app_secret)?;
                require("DROPBOX_REFRESH_TOKEN", &c.refresh_token)
            }
            Self::Ftp(c) => require("FTP_HOST", &c.host),
            Self::Rclone(c) => require("RCLONE_REMOTE", &c.remote),
            Self::Gdrive(c) => {
                require("GOOGLE_CLIENT_ID", &c.google_client_id)?;
                require("GOOGLE_CLIENT_SECRET", &c.google_client_secret)?;
                require("GOOGLE_REFRESH_TOKEN", &c.google_refresh_token)
            }
            Self::Onedrive(c) => {
                require("ONEDRIVE_CLIENT_ID", &c.client_id)?;
                require("ONEDRIVE_REFRESH_TOKEN", &c.refresh_token)
            }
        }
    }

    /// Build a configuration from environment-style variables.
    ///
    /// `lookup` abstracts `std::env::var` so callers (and tests) can supply
    /// any source of variables.
    pub fn from_lookup<F>(lookup: F) -> StorageResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let string = |name: &str| var(name).unwrap_or_default();
        let flag = |name: &str, default: bool| var(name).map(|v| parse_bool(&v)).unwrap_or(default);

        let kind: StorageKind = match var("STORAGE_TYPE") {
            Some(raw) => raw.parse()?,
            None => StorageKind::Local,
        };

        let config = match kind {
            StorageKind::Local => Self::Local(LocalConfig {
                base_path: var("STORAGE_LOCAL_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_local_path),
                passthrough: flag("STORAGE_LOCAL_PASSTHROUGH", true),
            }),
            StorageKind::S3 => Self::S3(S3Config {
                bucket: string("S3_BUCKET"),
                region: var("S3_REGION").unwrap_or_else(default_s3_region),
                endpoint: var("S3_ENDPOINT"),
                access_key_id: var("S3_ACCESS_KEY_ID"),
                secret_access_key: var("S3_SECRET_ACCESS_KEY"),
                force_path_style: flag("S3_FORCE_PATH_STYLE", false),
                prefix: string("S3_PREFIX"),
            }),
            StorageKind::Gcs => Self::Gcs(GcsConfig {
                bucket: string("GCS_BUCKET"),
                project_id: var("GCS_PROJECT_ID"),
                credentials_json: var("GCS_CREDENTIALS_JSON"),
                credentials_path: var("GCS_CREDENTIALS_PATH")
                    .or_else(|| var("GOOGLE_APPLICATION_CREDENTIALS"))
                    .map(PathBuf::from),
                prefix: string("GCS_PREFIX"),
                api_base: default_gcs_api_base(),
            }),
            StorageKind::Azure => Self::Azure(AzureConfig {
                account_name: string("AZURE_STORAGE_ACCOUNT"),
                account_key: string("AZURE_STORAGE_KEY"),
                container: string("AZURE_CONTAINER"),
                endpoint: var("AZURE_ENDPOINT"),
                prefix: string("AZURE_PREFIX"),
            }),
            StorageKind::Dropbox => Self::Dropbox(DropboxConfig {
                app_key: string("DROPBOX_APP_KEY"),
                app_secret: string("DROPBOX_APP_SECRET"),
                refresh_token: string("DROPBOX_REFRESH_TOKEN"),
                root_path: string("DROPBOX_ROOT_PATH"),
                api_base: default_dropbox_api_base(),
                content_base: default_dropbox_content_base(),
            }),
            StorageKind::Ftp => Self::Ftp(FtpConfig {
                host: string("FTP_HOST"),
                port: match var("FTP_PORT") {
                    Some(raw) => raw.trim().parse().map_err(|_| {
                        StorageError::InvalidConfig(format!("FTP_PORT is not a port: {raw}"))
                    })?,
                    None => default_ftp_port(),
                },
                username: var("FTP_USER").unwrap_or_else(default_ftp_user),
                password: string("FTP_PASSWORD"),
                base_path: var("FTP_BASE_PATH").unwrap_or_else(default_ftp_base_path),
            }),
            StorageKind::Rclone => Self::Rclone(RcloneConfig {
                remote: string("RCLONE_REMOTE").trim_end_matches(':').to_string(),
                base_path: string("RCLONE_BASE_PATH"),
                binary: var("RCLONE_BINARY").unwrap_or_else(default_rclone_binary),
                config_path: var("RCLONE_CONFIG").map(PathBuf::from),
            }),
            StorageKind::Gdrive => Self::Gdrive(GdriveConfig {
                google_client_id: string("GOOGLE_CLIENT_ID"),
                google_client_secret: string("GOOGLE_CLIENT_SECRET"),
                google_refresh_token: string("GOOGLE_REFRESH_TOKEN"),
                google_folder_id: var("GOOGLE_DRIVE_FOLDER_ID")
                    .unwrap_or_else(default_gdrive_folder),
                api_base: default_gdrive_api_base(),
                token_url: default_google_token_url(),
            }),
            StorageKind::Onedrive => Self::Onedrive(OnedriveConfig {
                client_id: string("ONEDRIVE_CLIENT_ID"),
                client_secret: var("ONEDRIVE_CLIENT_SECRET"),
                refresh_token: string("ONEDRIVE_REFRESH_TOKEN"),
                folder_path: var("ONEDRIVE_FOLDER_PATH").unwrap_or_else(default_onedrive_folder),
                tenant: var("ONEDRIVE_TENANT").unwrap_or_else(default_onedrive_tenant),
                drive_id: var("ONEDRIVE_DRIVE_ID"),
                graph_base: default_graph_base(),
                login_base: default_ms_login_base(),
            }),
        };
        Ok(config)
    }

    /// [`from_lookup`](Self::from_lookup) over the process environment.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn require(name: &str, value: &str) -> StorageResult<()> {
    if value.trim().is_empty() {
        return Err(StorageError::InvalidConfig(format!("{name} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_defaults_to_local_passthrough() {
        let config = StorageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StorageConfig::local_default());
        assert_eq!(config.kind(), StorageKind::Local);
    }

    #[test]
    fn s3_from_environment() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_TYPE", "S3"),
            ("S3_BUCKET", "forge"),
            ("S3_ENDPOINT", "http://minio:9000"),
            ("S3_FORCE_PATH_STYLE", "true"),
        ]))
        .unwrap();
        let StorageConfig::S3(s3) = &config else {
            panic!("expected s3, got {config:?}");
        };
        assert_eq!(s3.bucket, "forge");
        assert_eq!(s3.region, "us-east-1");
        assert!(s3.force_path_style);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_required_field_fails_validation() {
        let config = StorageConfig::from_lookup(lookup(&[("STORAGE_TYPE", "azure")])).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AZURE_STORAGE_ACCOUNT"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(StorageConfig::from_lookup(lookup(&[("STORAGE_TYPE", "tape")])).is_err());
    }

    #[test]
    fn json_record_round_trips_with_type_tag() {
        let raw = r#"{"type":"ftp","host":"ftp.example.com","password":"pw"}"#;
        let config = StorageConfig::from_json(raw).unwrap();
        let StorageConfig::Ftp(ftp) = &config else {
            panic!("expected ftp");
        };
        assert_eq!(ftp.port, 21);
        assert_eq!(ftp.username, "anonymous");
        assert_eq!(ftp.base_path, "/");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "ftp");
        assert_eq!(json["basePath"], "/");
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = StorageConfig::local_default();
        let b = StorageConfig::Local(LocalConfig {
            base_path: "/srv/forge".into(),
            passthrough: true,
        });
        assert_eq!(a.fingerprint(), StorageConfig::local_default().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
