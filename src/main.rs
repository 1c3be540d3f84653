use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::error::{ConstructionError, StoreError};
use tollgate::http::HttpServer;
use tollgate::ratelimit::TokenBucketLimiter;
use tollgate::store::{MemoryStore, RedisStore, SharedStateStore};

type DynLimiter = TokenBucketLimiter<dyn SharedStateStore>;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Distributed token-bucket rate limiter")]
struct Cli {
    /// YAML config file (default: ./tollgate.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve HTTP with every route rate limited
    Serve,
    /// Check that the store answers
    Ping,
    /// Spend tokens from one bucket and print the decision
    Check {
        /// Bucket key, e.g. ratelimit:203.0.113.7
        key: String,
        /// Tokens to consume
        #[arg(short, long, default_value_t = 1)]
        tokens: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");
    info!(
        backend = ?config.store.backend,
        store_addr = %config.store.addr,
        capacity = config.limits.capacity,
        window = ?config.limits.window,
        "Configuration loaded"
    );

    let store = open_store(&config).await?;

    match cli.command {
        Command::Serve => {
            let limiter = Arc::new(build_limiter(&config, store)?);
            let server = HttpServer::new(config.server.listen_addr, limiter, &config.server.key_prefix);

            server.serve_with_shutdown(shutdown_signal()).await?;
            info!("Tollgate stopped");
        }
        Command::Ping => {
            let reply = store.ping().await?;
            println!("Store response: {}", reply);
        }
        Command::Check { key, tokens } => {
            let limiter = build_limiter(&config, store)?;
            if limiter.allow_n(&key, tokens).await? {
                println!("allowed");
            } else {
                println!("denied");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

async fn open_store(config: &TollgateConfig) -> Result<Arc<dyn SharedStateStore>, StoreError> {
    match config.store.backend {
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(config.store.redis()).await?)),
        StoreBackend::Memory => {
            warn!("Using the in-process store; limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_limiter(
    config: &TollgateConfig,
    store: Arc<dyn SharedStateStore>,
) -> Result<DynLimiter, ConstructionError> {
    Ok(
        TokenBucketLimiter::try_new(store, config.limits.capacity, config.limits.window)?
            .with_call_timeout(config.limits.call_timeout()),
    )
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
