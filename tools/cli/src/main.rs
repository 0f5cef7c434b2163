//! Harbor CLI - Command line interface for the offline cache and sync layer.
//!
//! Runs the caching proxy, manages cache versions and inspects or drains the
//! queue of mutations waiting for the network.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use harbor_cache::{BroadcastPublisher, CacheStore, CacheStrategyRouter, SqliteBackend};
use harbor_common::{CacheVersion, HarborConfig};
use harbor_net::{Fetcher, HttpFetcher};
use harbor_proxy::{ProxyServer, ProxyState};
use harbor_sync::{
    ConnectivityMonitor, ConnectivityProbe, ConnectivityState, QueueStore, RetryPolicy,
    SqliteQueue, SyncProcessor, SyncQueue,
};

/// Environment variable holding a tracing filter directive.
const LOG_ENV: &str = "HARBOR_LOG";

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Harbor - Offline-first caching proxy and mutation sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (JSON). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the caching proxy with connectivity-driven replay.
    Serve {
        /// Address to listen on (overrides the configuration).
        #[arg(short, long)]
        listen: Option<std::net::SocketAddr>,
    },

    /// Pre-cache the asset manifest for the configured version.
    Install,

    /// Activate the configured version and purge other versions' caches.
    Activate {
        /// Version being replaced, reported to connected clients.
        #[arg(short, long)]
        previous: Option<String>,
    },

    /// Queue a mutation for later replay.
    Enqueue {
        /// HTTP method.
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Target URL, absolute or relative to the origin.
        #[arg(short, long)]
        url: String,

        /// JSON body.
        #[arg(short, long, default_value = "null")]
        body: String,
    },

    /// Inspect or edit the mutation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run one replay pass now.
    Sync,

    /// Write a default configuration file.
    InitConfig {
        /// Destination path.
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued mutations, oldest first.
    List,

    /// Remove a queued mutation.
    Remove {
        /// Mutation id.
        id: i64,
    },

    /// List mutations that were given up on.
    DeadLetters,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str())),
        )
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = || load_config(cli.config.as_deref());

    match cli.command {
        Commands::Serve { listen } => cmd_serve(config()?, listen).await,

        Commands::Install => cmd_install(&config()?).await,

        Commands::Activate { previous } => cmd_activate(&config()?, previous).await,

        Commands::Enqueue { method, url, body } => {
            cmd_enqueue(&config()?, &method, &url, &body).await
        }

        Commands::Queue { command } => match command {
            QueueCommands::List => cmd_queue_list(&config()?).await,
            QueueCommands::Remove { id } => cmd_queue_remove(&config()?, id).await,
            QueueCommands::DeadLetters => cmd_dead_letters(&config()?).await,
        },

        Commands::Sync => cmd_sync(&config()?).await,

        Commands::InitConfig { path, force } => {
            cmd_init_config(path.or_else(default_config_path).as_deref(), force)
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("harbor").join("config.json"))
}

/// Load the explicit config, else the default file if present, else defaults.
fn load_config(path: Option<&Path>) -> Result<HarborConfig> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };

    match &path {
        Some(path) => info!("Loading configuration from {}", path.display()),
        None => info!("No configuration file, using defaults"),
    }

    HarborConfig::load_or_default(path.as_deref()).context("Failed to load configuration")
}

fn fetcher(timeout: Duration) -> Result<Arc<dyn Fetcher>> {
    let fetcher = HttpFetcher::with_timeout(timeout).context("Failed to create HTTP client")?;
    Ok(Arc::new(fetcher))
}

fn cache_store(
    config: &HarborConfig,
    fetcher: Arc<dyn Fetcher>,
    publisher: BroadcastPublisher,
) -> Result<CacheStore> {
    let version = config.cache_version().context("Invalid cache version")?;
    let manifest = config.manifest_urls().context("Invalid asset manifest")?;
    Ok(CacheStore::new(
        version,
        Arc::new(SqliteBackend::open(config.cache_db_path())),
        fetcher,
        Arc::new(publisher),
    )
    .with_manifest(manifest))
}

fn processor(config: &HarborConfig, queue: SyncQueue, fetcher: Arc<dyn Fetcher>) -> SyncProcessor {
    SyncProcessor::new(queue, fetcher)
        .with_policy(RetryPolicy::from_settings(&config.retry))
        .with_replay_timeout(config.replay_timeout())
}

/// Run the proxy until interrupted.
async fn cmd_serve(mut config: HarborConfig, listen: Option<std::net::SocketAddr>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen = listen;
    }
    info!("Serving {} (version {})", config.origin, config.version);

    let network = fetcher(config.request_timeout())?;
    let replayer = fetcher(config.replay_timeout())?;
    let publisher = BroadcastPublisher::new();
    let store = Arc::new(cache_store(&config, network.clone(), publisher.clone())?);

    let installed = store.install().await.context("Failed to install cache")?;
    if !installed.failed.is_empty() {
        info!("{} manifest assets unavailable, serving anyway", installed.failed.len());
    }
    store.activate(None).await.context("Failed to activate cache")?;

    // Another process activating a newer version retires this one.
    let poll_interval = Duration::from_secs(config.probe.interval_secs.max(1));
    let activations = store.watch_activations(poll_interval);

    let router = Arc::new(
        CacheStrategyRouter::new(store, network.clone(), config.routes.clone(), &config.origin)
            .context("Failed to create router")?,
    );
    let queue = SyncQueue::open(config.queue_db_path());
    let processor = Arc::new(processor(&config, queue.clone(), replayer));

    // Start offline so the first successful probe replays whatever is queued.
    let (tx, rx) = watch::channel(ConnectivityState::Offline);
    let probe = ConnectivityProbe::new(network, config.probe_url())
        .with_interval(poll_interval)
        .with_timeout(Duration::from_secs(config.probe.timeout_secs.max(1)))
        .spawn(tx);

    let monitor = ConnectivityMonitor::new(processor, ConnectivityState::Offline);
    let monitor_rx = rx.clone();
    let monitor_task = tokio::spawn(async move { monitor.run(monitor_rx).await });

    let state = ProxyState::new(router.clone(), queue, config.origin.clone())
        .with_connectivity(rx)
        .with_events(publisher);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    ProxyServer::new(config.listen, state)
        .serve(shutdown)
        .await
        .context("Proxy server failed")?;

    probe.abort();
    activations.abort();
    monitor_task.await.context("Connectivity monitor failed")?;
    router.settle().await;

    Ok(())
}

/// Pre-cache the asset manifest.
async fn cmd_install(config: &HarborConfig) -> Result<()> {
    let store = cache_store(
        config,
        fetcher(config.request_timeout())?,
        BroadcastPublisher::new(),
    )?;
    let report = store.install().await.context("Failed to install cache")?;

    println!("Installed {}", report.namespace);
    println!("  Cached: {}", report.cached);
    if !report.failed.is_empty() {
        println!("  Unavailable:");
        for url in &report.failed {
            println!("    {}", url);
        }
    }

    Ok(())
}

/// Activate the configured version.
async fn cmd_activate(config: &HarborConfig, previous: Option<String>) -> Result<()> {
    let previous = previous
        .map(CacheVersion::new)
        .transpose()
        .context("Invalid previous version")?;

    // Serving processes notice through the shared cache database.
    let store = cache_store(
        config,
        fetcher(config.request_timeout())?,
        BroadcastPublisher::new(),
    )?;
    let report = store
        .activate(previous)
        .await
        .context("Failed to activate cache")?;

    println!("Version {} active", report.version);
    if report.purged.is_empty() {
        println!("  No stale namespaces");
    } else {
        for name in &report.purged {
            println!("  Purged {}", name);
        }
    }

    Ok(())
}

/// Queue a mutation.
async fn cmd_enqueue(config: &HarborConfig, method: &str, url: &str, body: &str) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .context("Invalid HTTP method")?;
    let url = Url::parse(url)
        .or_else(|_| config.origin.join(url))
        .context("Invalid URL")?;
    let body: serde_json::Value = serde_json::from_str(body).context("Body is not valid JSON")?;

    let queue = SqliteQueue::open(config.queue_db_path());
    let mutation = queue
        .enqueue(&method, &url, &body)
        .await
        .context("Failed to queue mutation")?;

    println!("Queued #{}: {} {}", mutation.id, mutation.method, mutation.url);
    Ok(())
}

/// List queued mutations.
async fn cmd_queue_list(config: &HarborConfig) -> Result<()> {
    let queue = SqliteQueue::open(config.queue_db_path());
    let mutations = queue.list_all().await.context("Failed to read queue")?;
    let records = queue
        .replay_records()
        .await
        .context("Failed to read replay records")?;

    if mutations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} queued mutations:", mutations.len());
    for m in mutations {
        print!(
            "  #{} {} {} ({})",
            m.id,
            m.method,
            m.url,
            m.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
        match records.get(&m.id) {
            Some(record) => println!(
                " attempts: {}, next: {}, last error: {}",
                record.attempts,
                record.next_attempt_at.format("%H:%M:%S"),
                record.last_error.as_deref().unwrap_or("-")
            ),
            None => println!(),
        }
    }

    Ok(())
}

/// Remove a queued mutation.
async fn cmd_queue_remove(config: &HarborConfig, id: i64) -> Result<()> {
    let queue = SqliteQueue::open(config.queue_db_path());
    let removed = queue.remove(id).await.context("Failed to remove mutation")?;

    if removed {
        println!("Removed #{}", id);
    } else {
        println!("No mutation #{}", id);
    }
    Ok(())
}

/// List dead-lettered mutations.
async fn cmd_dead_letters(config: &HarborConfig) -> Result<()> {
    let queue = SqliteQueue::open(config.queue_db_path());
    let dead = queue.dead_letters().await.context("Failed to read dead letters")?;

    if dead.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    for letter in dead {
        println!(
            "  #{} {} {} after {} attempts: {}",
            letter.mutation.id,
            letter.mutation.method,
            letter.mutation.url,
            letter.attempts,
            letter.reason
        );
    }
    Ok(())
}

/// Run a single replay pass.
async fn cmd_sync(config: &HarborConfig) -> Result<()> {
    let queue = SyncQueue::open(config.queue_db_path());
    let processor = processor(config, queue, fetcher(config.replay_timeout())?);

    let report = processor
        .run_pass()
        .await
        .context("A replay pass is already running")?;

    println!("Replay pass completed in {:?}", report.duration);
    println!("  Replayed:      {}", report.replayed);
    println!("  Failed:        {}", report.failed);
    println!("  Skipped:       {}", report.skipped);
    println!("  Dead-lettered: {}", report.dead_lettered);
    Ok(())
}

/// Write the default configuration.
fn cmd_init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.context("No configuration directory, pass --path")?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
    }

    HarborConfig::default()
        .save(path)
        .context("Failed to write configuration")?;

    println!("Configuration written to {}", path.display());
    Ok(())
}
