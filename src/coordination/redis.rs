//! KeyDB connection pool for the repository transfer lock.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

/// Lock traffic is light; a handful of connections covers concurrent
/// repository transfers.
const POOL_SIZE: usize = 4;

const DEFAULT_PORT: u16 = 6379;

/// A parsed `[redis[s]://]host[:port][/db]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDbEndpoint {
    pub host: String,
    pub port: u16,
    /// Logical database index from the path segment.
    pub database: Option<u8>,
    /// `rediss://` was used.
    pub tls: bool,
}

impl KeyDbEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let (tls, rest) = match endpoint.split_once("://") {
            Some(("rediss", rest)) => (true, rest),
            Some(("redis", rest)) => (false, rest),
            Some((scheme, _)) => anyhow::bail!("unsupported KeyDB scheme: {scheme}"),
            None => (false, endpoint),
        };

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        anyhow::ensure!(!authority.is_empty(), "KeyDB endpoint has no host: {endpoint}");

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .with_context(|| format!("invalid port in KeyDB endpoint: {endpoint}"))?,
            ),
            None => (authority, DEFAULT_PORT),
        };

        let database = match path.trim_matches('/') {
            "" => None,
            db => Some(
                db.parse()
                    .with_context(|| format!("invalid database index in KeyDB endpoint: {endpoint}"))?,
            ),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            database,
            tls,
        })
    }
}

/// Connect to KeyDB and verify the connection with a PING.
///
/// TLS is enabled by either `config.tls` or a `rediss://` endpoint. The
/// password, if any, comes from the environment variable named by
/// `config.auth_token_env`.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let endpoint = KeyDbEndpoint::parse(&config.endpoint)?;
    let tls = config.tls || endpoint.tls;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(endpoint.host.as_str(), endpoint.port),
        database: endpoint.database,
        password: std::env::var(&config.auth_token_env)
            .ok()
            .filter(|v| !v.is_empty()),
        ..fred::types::config::Config::default()
    };
    if tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    let mut builder = Builder::from_config(fred_config);
    // Reconnect from 100 ms doubling up to 30 s.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = %endpoint.host,
        port = endpoint.port,
        database = ?endpoint.database,
        tls,
        "KeyDB pool connected"
    );
    Ok(pool)
}
