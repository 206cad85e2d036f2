//! chunkvault -- byte-range file server over chunked backend connections.
//!
//! Startup wires config, logging, metrics, the metadata store and the
//! backend pool, then serves until SIGTERM/SIGINT.  In-flight requests get
//! `server.shutdown_timeout` seconds to finish before the pool is stopped.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use chunkvault::config::Config;
use chunkvault::metadata::store::MetadataStore;

/// Command-line arguments for the chunkvault server.
#[derive(Parser, Debug)]
#[command(
    name = "chunkvault",
    version,
    about = "Byte-range file server over chunked backend connections"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "chunkvault.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

/// Install the tracing subscriber. `RUST_LOG` wins over the config level.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_metadata(config: &Config) -> anyhow::Result<Arc<dyn MetadataStore>> {
    match config.metadata.engine.as_str() {
        "memory" => {
            info!("In-memory metadata store initialized");
            Ok(Arc::new(
                chunkvault::metadata::memory::MemoryMetadataStore::new(),
            ))
        }
        "sqlite" => {
            let path = &config.metadata.sqlite.path;
            let store = chunkvault::metadata::sqlite::SqliteMetadataStore::new(path)?;
            info!("SQLite metadata store initialized at {}", path);
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("unknown metadata engine '{}'", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if std::path::Path::new(&cli.config).exists() {
        chunkvault::config::load_config(&cli.config)?
    } else {
        Config::default()
    };
    init_tracing(&config);
    if std::path::Path::new(&cli.config).exists() {
        info!("Loaded configuration from {}", cli.config);
    } else {
        warn!("Config file {} not found, using defaults", cli.config);
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        chunkvault::metrics::init_metrics();
        chunkvault::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let metadata = open_metadata(&config)?;

    let connections = config.pool.effective_connections();
    let backends = chunkvault::backend::build_backends(&connections)?;
    let pool =
        chunkvault::pool::BackendPool::initialize(backends, config.pool.concurrency_ceiling)
            .await?;
    info!(
        "Backend pool ready: {} connection(s), default '{}'",
        pool.len(),
        pool.default_connection()
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let progress_ttl = Duration::from_secs(config.uploads.progress_ttl_seconds.max(1));

    let state = Arc::new(chunkvault::AppState::new(config, metadata, pool.clone())?);
    let reaper = state.progress.spawn_reaper(progress_ttl.min(Duration::from_secs(60)));

    let app = chunkvault::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("chunkvault listening on {}", bind_addr);

    // Stop accepting on the signal, then give in-flight streams a bounded
    // window before the pool goes down.
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });
    let server = tokio::spawn(async move { server.await });

    let drained = async {
        let _ = signalled_rx.await;
        tokio::time::sleep(shutdown_timeout).await;
    };
    tokio::select! {
        result = server => {
            result??;
        }
        _ = drained => {
            warn!(
                "Shutdown timeout of {}s elapsed with requests still in flight",
                shutdown_timeout.as_secs()
            );
        }
    }

    reaper.abort();
    pool.shutdown().await;
    info!("chunkvault shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
