use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use docwire::handlers::Settings;
use docwire::metrics::{self, Metrics};
use docwire::{backend, Config, Context, Listener, Storage};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docwire")]
#[command(about = "Document database wire protocol gateway over PostgreSQL or SQLite", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "DOCWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept client connections on
    #[arg(long, env = "DOCWIRE_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Backend URL: postgres://... or sqlite://<path>
    #[arg(long, env = "DOCWIRE_BACKEND_URL")]
    backend_url: Option<String>,

    /// Backend URL with read-only credentials (PostgreSQL)
    #[arg(long, env = "DOCWIRE_READ_ONLY_URL")]
    read_only_url: Option<String>,

    /// Address of the /metrics and /debug/livez endpoint
    #[arg(long, env = "DOCWIRE_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Maximum backend connections per role
    #[arg(long, env = "DOCWIRE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "DOCWIRE_LOG")]
    log: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.listen_addr {
            config.listen.addr = addr;
        }
        if let Some(url) = self.backend_url {
            config.backend.url = url;
        }
        if let Some(url) = self.read_only_url {
            config.backend.read_only_url = Some(url);
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics.addr = Some(addr);
        }
        if let Some(n) = self.max_connections {
            config.pool.max_connections = n;
        }
        if let Some(filter) = self.log {
            config.log.filter = filter;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = backend::open(&config.backend.url, config.backend.read_only_url.as_deref())?;
    tracing::info!("Using {} backend", backend.dialect.name());
    let storage = Storage::open(backend, config.storage_config()).await;

    let metrics = Arc::new(Metrics::new()?);
    let settings = Settings {
        default_batch_size: config.cursor.default_batch_size,
        cursor_timeout: config.cursor_timeout(),
        max_message_size: config.listen.max_message_size,
        argv: std::env::args().collect(),
    };
    let ctx = Arc::new(Context::new(storage.clone(), metrics.clone(), settings));
    let shutdown = CancellationToken::new();

    if let Some(addr) = config.metrics_addr()? {
        let (metrics, storage, token) = (metrics.clone(), storage.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, metrics, storage, token).await {
                tracing::error!("Debug endpoint error: {}", e);
            }
        });
    }

    let listener = Listener::bind(config.listen_addr()?, ctx, config.frame_limits()).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    listener.run(shutdown).await;
    storage.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing listener...");
}
