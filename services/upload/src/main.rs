use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_service::{
    recover, start_api_server, AppState, Config, Ingestor, MetadataStore, PhotoStore, QueryEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        storage_root = %config.storage.root.display(),
        "Starting MoopMapper upload service"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Prepare storage
    let storage_root = config.storage_root();
    storage_root
        .ensure()
        .with_context(|| format!("Failed to create storage root {}", storage_root.root().display()))?;

    let photos = Arc::new(PhotoStore::new(&storage_root));
    let records = Arc::new(MetadataStore::new(&storage_root));

    if config.storage.recover_on_startup {
        let (p, r) = (photos.clone(), records.clone());
        let report = tokio::task::spawn_blocking(move || recover(&p, &r))
            .await?
            .context("Storage recovery failed")?;

        if !report.orphaned_photos.is_empty() {
            warn!(
                count = report.orphaned_photos.len(),
                "Photos without metadata records found"
            );
        }
    }

    let state = AppState {
        ingestor: Ingestor::new(photos.clone(), records.clone()),
        queries: QueryEngine::new(photos, records),
        service_name: config.service.name.clone(),
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Upload service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down upload service");
}
