use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process configuration, loaded from YAML.
///
/// Every section has defaults, so an empty file is a valid single-node
/// configuration backed by local storage.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Public base URL of the forge; hook scripts call back into it.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// Socket address for the HTTP listener.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Distributed repository lock; single-process operation when absent.
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_url: default_site_url(),
            http_listen: default_http_listen(),
            cache: CacheConfig::default(),
            storage: StorageSection::default(),
            hooks: HooksConfig::default(),
            keydb: None,
        }
    }
}

fn default_site_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Repository cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding materialised bare repositories.
    pub path: PathBuf,
    /// Idle time (seconds) after which an entry is flushed and evicted.
    pub ttl: u64,
    /// Interval (seconds) between sweeper runs.
    pub sweep_interval: u64,
    /// Optional directory of bare repositories used when storage has no
    /// snapshot (`{mirror}/{owner}/{name}.git`).
    pub mirror_path: Option<PathBuf>,
    /// Concurrent object transfers per snapshot download/upload.
    pub transfer_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/repo-cache"),
            ttl: 300,
            sweep_interval: 60,
            mirror_path: None,
            transfer_concurrency: 8,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

// ---------------------------------------------------------------------------
// Storage selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Prefer environment variables over the persisted record.
    pub env_priority: bool,
    /// JSON file holding the persisted storage configuration record.
    pub record_path: Option<PathBuf>,
    /// Public base of the signed local/FTP proxy endpoints.
    pub proxy_base_url: String,
    /// Name of the environment variable that holds the proxy signing key.
    pub proxy_secret_env: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            env_priority: false,
            record_path: None,
            proxy_base_url: "http://localhost:8080/api/storage".to_string(),
            proxy_secret_env: "STORAGE_PROXY_SECRET".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Name of the environment variable that holds the hook callback secret.
    pub secret_env: String,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            secret_env: "FORGE_HOOK_SECRET".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// TTL (seconds) of a repository transfer lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    /// How long (seconds) a waiter blocks for the lock before giving up.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_lock_ttl() -> u64 {
    120
}

fn default_lock_wait_timeout() -> u64 {
    90
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate YAML configuration text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("failed to parse YAML")?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Read a secret from the environment variable named in the config.
pub fn read_secret(env_name: &str) -> Result<String> {
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("environment variable {env_name} is not set"))
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    url::Url::parse(&config.site_url)
        .with_context(|| format!("site_url is not a URL: {}", config.site_url))?;
    url::Url::parse(&config.storage.proxy_base_url).with_context(|| {
        format!(
            "storage.proxy_base_url is not a URL: {}",
            config.storage.proxy_base_url
        )
    })?;
    anyhow::ensure!(config.cache.ttl > 0, "cache.ttl must be positive");
    anyhow::ensure!(
        config.cache.sweep_interval > 0,
        "cache.sweep_interval must be positive"
    );
    anyhow::ensure!(
        config.cache.transfer_concurrency > 0,
        "cache.transfer_concurrency must be at least 1"
    );
    if let Some(keydb) = &config.keydb {
        anyhow::ensure!(keydb.lock_ttl > 0, "keydb.lock_ttl must be positive");
    }
    Ok(())
}
