use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreBackend, IP_NAMESPACE, TOKEN_NAMESPACE};
use gatekeeper::http::{AdmissionGate, HttpServer};
use gatekeeper::ratelimit::{EventStore, InMemoryEventStore, RateLimiter, RedisEventStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// HTTP admission gate with sliding-window rate limiting.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.http_addr = listen;
    }
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        tokens = config.tokens.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn EventStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisEventStore::connect(&config.store.redis.url()).await?;
            info!(
                host = %config.store.redis.host,
                port = config.store.redis.port,
                db = config.store.redis.db,
                "Connected to Redis event store"
            );
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory event store; limits are not shared between instances");
            let store = Arc::new(InMemoryEventStore::new());
            InMemoryEventStore::spawn_purger(&store, config.store.purge_interval());
            info!(
                purge_interval_secs = config.store.purge_interval_secs,
                "Started expired bucket purger"
            );
            store
        }
    };

    let mut ip_limiter = RateLimiter::new(
        store.clone(),
        IP_NAMESPACE,
        config.ip_limit.max_requests,
        config.ip_limit.interval(),
    );
    // Token policies come from the lookup table, so the token limiter carries no defaults.
    let mut token_limiter = RateLimiter::new(store, TOKEN_NAMESPACE, 0, std::time::Duration::ZERO);
    if let Some(ttl) = config.store.bucket_ttl() {
        ip_limiter = ip_limiter.with_bucket_ttl(ttl);
        token_limiter = token_limiter.with_bucket_ttl(ttl);
    }
    info!(
        ip_max_requests = ip_limiter.defaults().max_in_interval,
        ip_interval_secs = ip_limiter.defaults().interval_seconds,
        "Rate limiters initialized"
    );

    let gate = AdmissionGate::new(
        Arc::new(token_limiter),
        Arc::new(ip_limiter),
        Arc::new(config.token_policies()),
    )
    .with_timeout(config.server.request_timeout());

    let server = HttpServer::new(config.server.http_addr, Arc::new(gate));

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Gatekeeper stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
