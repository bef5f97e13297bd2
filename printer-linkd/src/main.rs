use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Utc;
use mdns_sd::ServiceDaemon;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use printer_linkd::api;
use printer_linkd::cache::{db::DnsStore, hash, DnsCache};
use printer_linkd::cache_manager::PersistHandle;
use printer_linkd::config::{Config, StreamConfig};
use printer_linkd::discovery;
use printer_linkd::resolver::lookup::NetworkLookup;
use printer_linkd::resolver::HostResolver;
use printer_linkd::stream::{StreamReader, StreamSnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("printer_linkd=info"))
        )
        .init();

    tracing::info!("Starting printer-linkd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/printer-link/linkd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // DNS cache, persisted when a database is configured
    let (cache, persist, hash_rx) = match &config.resolver.db_path {
        Some(db_path) => {
            let db = DnsStore::open(db_path)?;
            tracing::info!("Opened database at {:?}", db_path);

            let cutoff = Utc::now() - chrono::Duration::seconds(config.resolver.prune_after_secs as i64);
            let pruned = db.prune_expired(cutoff)?;
            if pruned > 0 {
                tracing::info!("Pruned {} stale dns entries", pruned);
            }

            let initial = db.load_all()?;
            let initial_hash = hash::compute_hash(&initial);
            tracing::info!("Initial cache hash: {}", initial_hash);

            let (hash_tx, hash_rx) = watch::channel(initial_hash);
            let persist = PersistHandle::spawn(db, hash_tx);
            let cache = DnsCache::with_persistence(config.resolver.ttl(), persist.clone(), initial);
            (cache, Some(persist), hash_rx)
        }
        None => {
            tracing::info!("No database configured, dns cache is memory only");
            let empty: [shared::types::DnsCacheEntry; 0] = [];
            let (_hash_tx, hash_rx) = watch::channel(hash::compute_hash(&empty));
            (DnsCache::new(config.resolver.ttl()), None, hash_rx)
        }
    };

    let lookup = NetworkLookup::new(
        cache.clone(),
        config.resolver.clone(),
        config.discovery.service_types.clone(),
    );
    let resolver = HostResolver::new(cache.clone(), Arc::new(lookup));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Passive discovery keeps the cache warm
    let mdns_daemon = if config.discovery.passive {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        let mut services = discovery::discover(
            daemon.clone(),
            cache.clone(),
            &config.discovery,
            cancel.clone(),
        );
        tasks.push(tokio::spawn(async move {
            while let Some(service) = services.recv().await {
                tracing::debug!("Cached {} -> {}", service.hostname, service.address);
            }
        }));
        Some(daemon)
    } else {
        None
    };

    if let Some(url) = config.stream.url.clone() {
        let client = resolver
            .http_client(Duration::from_millis(config.stream.timeout_ms))
            .context("Failed to build http client")?;
        let reader = StreamReader::spawn(&url, config.stream.clone(), client)
            .with_context(|| format!("Invalid stream url {}", url))?;
        tasks.push(tokio::spawn(follow_stream(reader, config.stream.clone(), cancel.clone())));
    }

    let app = api::routes::router(api::routes::AppState {
        resolver: resolver.clone(),
        hash_rx,
    });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
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

    for task in tasks {
        let _ = task.await;
    }

    if let Some(persist) = persist {
        match persist.persist_and_wait(cache.entries()).await {
            Ok(true) => tracing::info!("Flushed dns cache"),
            Ok(false) => tracing::debug!("Dns cache already up to date"),
            Err(e) => tracing::error!("Failed to flush dns cache: {}", e),
        }
        if let Err(e) = persist.shutdown() {
            tracing::error!("Failed to shutdown persistence thread: {}", e);
        }
    }

    if let Some(daemon) = mdns_daemon {
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log frames from the configured webcam until the stream ends or shutdown
async fn follow_stream(mut reader: StreamReader, config: StreamConfig, cancel: CancellationToken) {
    let mut frames = 0u64;
    loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = cancel.cancelled() => break,
        };

        match next {
            Some(Ok(StreamSnapshot::Loading)) => {
                tracing::info!("Connecting to webcam stream");
            }
            Some(Ok(StreamSnapshot::Frame { image, analytics })) => {
                frames += 1;
                if (frames - 1) % config.stats_window.max(1) as u64 == 0 {
                    tracing::info!(
                        "Frame {} is {}x{} (sampled by {}, {} bytes buffered)",
                        analytics.frame_index,
                        image.width(),
                        image.height(),
                        analytics.sample_size,
                        analytics.buffered_bytes
                    );
                }
            }
            Some(Err(e)) => {
                tracing::error!("Webcam stream failed: {}", e);
            }
            None => {
                tracing::info!("Webcam stream ended after {} frames", frames);
                break;
            }
        }
    }
    reader.cancel();
}
