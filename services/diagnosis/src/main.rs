use anyhow::{Context, Result};
use plantlens_diagnosis::{
    start_api_server, AppState, Config, DiagnosisService, DiagnosisStore, MySqlStore,
    ProcessPredictor, S3ImageStorage,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting PlantLens Diagnosis Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        MySqlStore::new(&config.database)
            .await
            .context("Failed to initialize database pool")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let storage = Arc::new(
        S3ImageStorage::new(&config.storage)
            .await
            .context("Failed to initialize object storage client")?,
    );

    let predictor = Arc::new(ProcessPredictor::new(&config.predictor));

    let diagnosis = Arc::new(DiagnosisService::new(
        store.clone(),
        predictor,
        storage,
        config.staging.dir.clone(),
    ));

    let api_state = AppState {
        store: store.clone() as Arc<dyn DiagnosisStore>,
        diagnosis,
    };

    info!(staging_dir = %config.staging.dir.display(), "Diagnosis service started");

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Shutting down diagnosis service");

    store.close().await;

    info!("Diagnosis service stopped");

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
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
