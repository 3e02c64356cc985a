//! Axum API server binary.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use basejobs_api::{create_router, metrics, ApiConfig, AppState};
use basejobs_queue::{QueueConfig, QueueMode};
use basejobs_worker::{registry_from_config, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run().await {
        error!("API server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("basejobs=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for rediss:// URLs)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    info!("Starting basejobs-api");

    let config = ApiConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let queue_config = QueueConfig::from_env();
    if !queue_config.role.serves_api() {
        anyhow::bail!("JOBS_ROLE=worker does not serve the API; run basejobs-worker instead");
    }
    let runs_workers =
        queue_config.role.runs_workers() || queue_config.mode() == QueueMode::Fallback;

    let registry = registry_from_config(&WorkerConfig::from_env());
    let queue = basejobs_queue::connect(queue_config, registry)
        .await
        .context("failed to connect to the job queue")?;

    if runs_workers {
        queue.start().await.context("failed to start workers")?;
    }

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);

    let metrics_handle = if metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let state = AppState::new(config.clone(), queue.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(state.gateway.clone().run(queue.clone(), shutdown_rx));

    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = config.bind_addr().parse().context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = relay.await;
    queue.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
