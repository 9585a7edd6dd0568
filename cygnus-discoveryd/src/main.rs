mod api;
mod config;
mod discovery;
mod engine;
mod error;
mod mdns;
mod reconciler;
mod registry;
mod store;
mod store_manager;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::discovery::listener::{Listener, ResolvePolicy};
use crate::discovery::prober::Prober;
use crate::discovery::reaper::Reaper;
use crate::engine::Engine;
use crate::mdns::browser::MdnsBrowser;
use crate::mdns::ServiceResolver;
use crate::reconciler::Reconciler;
use crate::registry::LiveRegistry;
use crate::store::db::DeviceDb;
use crate::store_manager::StoreHandle;

const DEFAULT_CONFIG_PATH: &str = "/etc/cygnus/discoveryd.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cygnus_discoveryd=info"))
        )
        .init();

    tracing::info!("Starting cygnus-discoveryd");

    let config = load_config()?;

    // Open SQLite database
    let db = DeviceDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let initial_hash = store::hash::compute_hash(&db.get_all_devices()?);
    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store = StoreHandle::spawn(db, hash_tx);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let registry = LiveRegistry::new();
    let browser = Arc::new(MdnsBrowser::new(mdns_daemon.clone(), config.discovery.service_type.clone()));
    let resolver: Arc<dyn ServiceResolver> = browser.clone();

    let listener = Listener::new(registry.clone(), resolver.clone(), ResolvePolicy::from(&config.discovery));
    let prober = Prober::new(
        registry.clone(),
        resolver,
        browser.service_type(),
        config.discovery.probe_timeout(),
    );
    let reconciler = Reconciler::new(registry.clone(), store.clone(), config.store.offline_after_secs);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let (event_tx, event_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = browser.run(event_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {:#}", e);
        }
    }));

    let listener_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        listener.run(event_rx, listener_cancel).await;
    }));

    let probe_loop = prober.clone();
    let probe_interval = config.discovery.probe_interval();
    let probe_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        probe_loop.run(probe_interval, probe_cancel).await;
    }));

    if config.reaper.enabled {
        let reaper = Reaper::new(registry.clone(), &config.reaper);
        let reaper_interval = Duration::from_secs(config.reaper.interval_secs);
        let reaper_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            reaper.run(reaper_interval, reaper_cancel).await;
        }));
    } else {
        tracing::info!("Registry reaper disabled; staleness handled by the store only");
    }

    if config.store.reconcile_interval_secs > 0 {
        let reconcile_loop = reconciler.clone();
        let reconcile_interval = Duration::from_secs(config.store.reconcile_interval_secs);
        let reconcile_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            reconcile_loop.run(reconcile_interval, reconcile_cancel).await;
        }));
    }

    let app_state = api::routes::AppState {
        engine: Engine::new(registry, store.clone(), reconciler, prober),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    let tcp_listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    futures::future::join_all(tasks).await;

    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// First CLI argument, else the default path if it exists, else built-in defaults
fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            Ok(config)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)?;
            tracing::info!("Loaded config from {}", DEFAULT_CONFIG_PATH);
            Ok(config)
        }
        None => {
            tracing::info!("No config file, using defaults");
            Ok(Config::default())
        }
    }
}
