use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogFormat, LoggingConfig, RatewardenConfig, StoreBackend};
use ratewarden::ratelimit::{
    CounterStore, InMemoryStore, PolicyTable, RedisStore, SlidingWindowLimiter,
};
use ratewarden::web::HttpServer;

/// Distributed sliding-window rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<String>,

    /// HTTP listen address, overrides the configuration file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Use Redis at this URL as the counter store
    #[arg(long)]
    redis_url: Option<String>,

    /// Policy file extending the built-in presets
    #[arg(long)]
    policies: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatewardenConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = cli.redis_url {
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = url;
    }
    if let Some(path) = cli.policies {
        config.rate_limiting.policies_path = Some(path.display().to_string());
    }

    init_tracing(&config.logging);

    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        store = config.store.backend.as_str(),
        "Configuration loaded"
    );

    let policies = match &config.rate_limiting.policies_path {
        Some(path) => PolicyTable::from_file(path)?,
        None => PolicyTable::presets(),
    };

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryStore::new());
            spawn_sweeper(
                store.clone(),
                Duration::from_secs(config.store.sweep_interval_secs.max(1)),
            );
            store
        }
        StoreBackend::Redis => {
            let store = RedisStore::open(&config.store.redis_url)?
                .with_timeout(Duration::from_millis(config.store.timeout_ms));
            // The limiter fails open, so an unreachable store is not fatal.
            if let Err(e) = store.ping().await {
                warn!(error = %e, "Redis not reachable at startup, requests will be allowed until it is");
            }
            Arc::new(store)
        }
    };

    let limiter = SlidingWindowLimiter::new(store);
    info!("Rate limiter initialized");

    let server = HttpServer::new(
        config.server.listen_addr,
        limiter,
        Arc::new(policies),
        config.store.backend.as_str(),
    )
    .trust_proxy_headers(config.server.trust_proxy_headers);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Periodically drop expired keys from the in-memory store.
fn spawn_sweeper(store: Arc<InMemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
