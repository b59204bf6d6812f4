//! First-Close Engine Binary
//!
//! Tracks the first 1/5/15-minute closes after the open for every symbol in
//! the catalog, and walks history backwards to fill past days.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin first-close-engine
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKER_USER_ID`, `BROKER_PASSWORD`, `BROKER_FACTOR2`,
//!   `BROKER_VENDOR_CODE`, `BROKER_API_SECRET`: broker login
//!
//! ## Optional
//! - `BROKER_REST_URL`, `BROKER_WS_URL`: broker endpoints
//! - `FIRST_CLOSE_DATA_DIR`: database, snapshot and symbol files (default: data)
//! - `FIRST_CLOSE_UTC_OFFSET`: market UTC offset (default: +05:30)
//! - `FIRST_CLOSE_MARKET_OPEN`: default open (default: 09:15)
//! - `FIRST_CLOSE_MARKET_OPENS`: per-exchange opens (default: MCX=09:00,CDS=09:00)
//! - `FIRST_CLOSE_SYMBOL_URLS`: comma-separated symbol file URLs
//! - `FIRST_CLOSE_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `RUST_LOG`: log filter (default: info)

use std::sync::Arc;

use anyhow::Context;
use first_close_engine::infrastructure::acquire::HttpSymbolDownloader;
use first_close_engine::infrastructure::config::EngineConfig;
use first_close_engine::infrastructure::metrics::init_metrics;
use first_close_engine::infrastructure::noren::{NorenFeedConnector, NorenSessionFactory};
use first_close_engine::infrastructure::telemetry;
use first_close_engine::{Adapters, Orchestrator};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting first-close engine");

    let config = EngineConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if let Some(addr) = init_metrics(config.supervisor.metrics_port)? {
        tracing::info!(%addr, "Prometheus metrics listening");
    }

    let adapters = Adapters {
        acquirer: Arc::new(
            HttpSymbolDownloader::new(config.symbol_urls.clone(), config.fetch.request_timeout)
                .context("failed to build symbol downloader")?,
        ),
        sessions: Arc::new(
            NorenSessionFactory::new(config.rest_config(), config.credentials.clone())
                .context("failed to build REST client")?,
        ),
        feed: Arc::new(NorenFeedConnector::new(config.feed_config())),
    };

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    let orchestrator =
        Orchestrator::start(config.orchestrator_settings(), &adapters, shutdown_token)
            .await
            .context("startup failed")?;

    tracing::info!("First-close engine ready");

    let counters = orchestrator.run().await;

    tracing::info!(?counters, "First-close engine stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &EngineConfig) {
    tracing::info!(
        user = config.credentials.user_id(),
        db = %config.paths.db_path.display(),
        snapshot = %config.paths.snapshot_path.display(),
        symbols = %config.paths.symbol_dir.display(),
        max_sessions = config.max_sessions,
        concurrency = config.fetch.concurrency,
        metrics_port = config.supervisor.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        rest_url = %config.rest_url,
        ws_url = %config.ws_url,
        "Broker endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
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
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
