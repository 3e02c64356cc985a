//! Job worker binary.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

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
        error!("Worker failed: {:#}", e);
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
            .with(fmt::layer().with_ansi(true).with_target(true))
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

    info!("Starting basejobs-worker");

    let queue_config = QueueConfig::from_env();
    if queue_config.mode() == QueueMode::Fallback {
        anyhow::bail!("JOBS_REDIS_URL is not set; without Redis, jobs run inside the API process");
    }
    if !queue_config.role.runs_workers() {
        anyhow::bail!("JOBS_ROLE=api does not run workers");
    }

    let worker_config = WorkerConfig::from_env();
    info!("Worker config: {:?}", worker_config);

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: std::net::SocketAddr = addr.parse().context("invalid METRICS_ADDR")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let registry = registry_from_config(&worker_config);
    let queue = basejobs_queue::connect(queue_config, registry)
        .await
        .context("failed to connect to the job queue")?;
    queue.start().await?;

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    queue.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}
