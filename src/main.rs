use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use forgestore::cache::{CacheSettings, RepoCacheManager};
use forgestore::config::{self, Config};
use forgestore::coordination::{self, KeyDbRepoLock};
use forgestore::git::{GitEngine, GitignoreTemplate, InitOptions, License, SeedOptions};
use forgestore::hooks::{install_hooks, HookConfig};
use forgestore::http::{self, AppState};
use forgestore::metrics::MetricsRegistry;
use forgestore::storage::{FileConfigSource, ProxySigner, StorageResolver};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgestore", about = "Cloud-synchronised bare-repository storage engine")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "FORGESTORE_CONFIG", default_value = "/etc/forgestore/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve health, metrics and the signed storage proxy; sweep the cache.
    Serve,
    /// Probe the active storage backend and print the result as JSON.
    Health,
    /// Create a repository, install its hooks and upload it to storage.
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    owner: String,
    name: String,
    #[arg(long, default_value = "main")]
    default_branch: String,
    /// Commit a README with this description (may be empty).
    #[arg(long)]
    readme: Option<String>,
    /// One of rust, node, python, go.
    #[arg(long)]
    gitignore: Option<GitignoreTemplate>,
    /// One of mit, apache-2.0, isc.
    #[arg(long)]
    license: Option<License>,
    /// Copyright holder; defaults to the owner.
    #[arg(long)]
    license_holder: Option<String>,
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything the subcommands share.
struct Runtime {
    resolver: Arc<StorageResolver>,
    cache: Arc<RepoCacheManager>,
    signer: ProxySigner,
    metrics: MetricsRegistry,
    keydb: Option<fred::clients::Pool>,
}

async fn build_runtime(config: &Config, require_proxy_secret: bool) -> Result<Runtime> {
    let secret = match config::read_secret(&config.storage.proxy_secret_env) {
        Ok(secret) => secret,
        Err(e) if require_proxy_secret => return Err(e),
        Err(_) => {
            tracing::debug!("no proxy secret; signed proxy URLs are not served by this command");
            String::new()
        }
    };
    let signer = ProxySigner::new(&config.storage.proxy_base_url, secret);

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Storage resolver ----
    let mut resolver = StorageResolver::new(signer.clone())
        .with_env_priority(config.storage.env_priority)
        .with_metrics(metrics.metrics.clone());
    if let Some(path) = &config.storage.record_path {
        resolver = resolver.with_source(Arc::new(FileConfigSource::new(path)));
    }
    let resolver = Arc::new(resolver);

    // ---- Cache manager ----
    let mut cache = RepoCacheManager::new(resolver.clone(), CacheSettings::from(&config.cache))
        .with_metrics(metrics.metrics.clone());

    // ---- Distributed lock ----
    let keydb = match &config.keydb {
        Some(keydb_config) => {
            let pool = coordination::redis::create_keydb_pool(keydb_config).await?;
            let node_id = coordination::node_id();
            tracing::info!(%node_id, "repository transfers locked through KeyDB");
            let lock = KeyDbRepoLock::new(
                pool.clone(),
                node_id,
                Duration::from_secs(keydb_config.lock_ttl),
                Duration::from_secs(keydb_config.lock_wait_timeout),
            )
            .with_metrics(metrics.metrics.clone());
            cache = cache.with_repo_lock(Arc::new(lock));
            Some(pool)
        }
        None => None,
    };

    Ok(Runtime {
        resolver,
        cache: Arc::new(cache),
        signer,
        metrics,
        keydb,
    })
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_serve(config: &Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.cache.path)
        .await
        .with_context(|| format!("failed to create cache dir: {}", config.cache.path.display()))?;

    let rt = build_runtime(config, true).await?;
    let health = rt.resolver.check_storage_health().await;
    if health.healthy {
        tracing::info!(kind = health.kind.as_str(), "storage backend reachable");
    } else {
        tracing::warn!(kind = health.kind.as_str(), error = ?health.error, "storage backend unhealthy at start-up");
    }

    let token = CancellationToken::new();
    let sweeper = rt
        .cache
        .spawn_sweeper(config.cache.sweep_interval(), token.clone());

    let state = AppState {
        resolver: rt.resolver.clone(),
        cache: rt.cache.clone(),
        signer: rt.signer.clone(),
        metrics: rt.metrics.clone(),
        keydb: rt.keydb.clone(),
    };
    let app = http::create_router(state);

    let listen_addr: std::net::SocketAddr = config
        .http_listen
        .parse()
        .context("invalid http_listen address")?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;
    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // ---- Drain ----
    token.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "cache sweeper task failed");
    }
    match rt.cache.drain().await {
        Ok(flushed) => tracing::info!(flushed, "repository cache drained"),
        Err(e) => tracing::error!(error = %e, "some repositories could not be flushed"),
    }
    Ok(())
}

async fn run_health(config: &Config) -> Result<()> {
    let rt = build_runtime(config, false).await?;
    let health = rt.resolver.check_storage_health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    anyhow::ensure!(health.healthy, "storage backend is unhealthy");
    Ok(())
}

async fn run_init(config: &Config, args: InitArgs) -> Result<()> {
    let rt = build_runtime(config, false).await?;
    if config::read_secret(&config.hooks.secret_env).is_err() {
        tracing::warn!(
            env = %config.hooks.secret_env,
            "hook secret is not set here; pushes are rejected until the serving process has it"
        );
    }
    let git = GitEngine::default().with_metrics(rt.metrics.metrics.clone());
    let (owner, name) = (args.owner.as_str(), args.name.as_str());

    let opts = InitOptions {
        default_branch: args.default_branch,
        seed: SeedOptions {
            readme: args.readme,
            gitignore: args.gitignore,
            license: args.license,
            license_holder: args.license_holder,
        },
        ..InitOptions::default()
    };

    let path = rt.cache.acquire_new(owner, name).await?;
    let created = async {
        git.init_bare_repo(&path, &opts).await?;
        install_hooks(
            &path,
            &HookConfig {
                site_url: config.site_url.clone(),
                secret_env: config.hooks.secret_env.clone(),
                repo_path_label: format!("{owner}/{name}"),
            },
        )
        .await
    }
    .await;
    rt.cache
        .release(owner, name, created.is_ok())
        .await
        .with_context(|| format!("failed to upload {owner}/{name}"))?;
    created.with_context(|| format!("failed to initialise {owner}/{name}"))?;

    println!("{}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::info!(config_path = %cli.config.display(), command = ?cli.command, "starting forgestore");

    match cli.command {
        Command::Serve => run_serve(&config).await?,
        Command::Health => run_health(&config).await?,
        Command::Init(args) => run_init(&config, args).await?,
    }

    tracing::info!("forgestore shut down cleanly");
    Ok(())
}
