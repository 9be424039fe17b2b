use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cas_file_manager::{
    api,
    config::Config,
    manager::FileManager,
    scanner::{ClamdAddress, ClamdScanner, Scanner},
    AppState,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "cas-file-manager starting");

    // Load configuration
    let config = Config::load()?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        target_dir = %config.storage.target_dir.display(),
        max_file_size = config.policy.max_file_size(),
        image_only = config.policy.image_only(),
        scan_enabled = config.policy.scan_enabled(),
        "Loaded configuration"
    );

    // Virus scanner, only when scanning is enabled
    let scanner: Option<Arc<dyn Scanner>> = if config.policy.scan_enabled() {
        let address = ClamdAddress::parse(&config.scanner.address)?;
        info!(address = %config.scanner.address, "Using clamd scanner");
        Some(Arc::new(ClamdScanner::new(
            address,
            Duration::from_millis(config.scanner.timeout_ms),
        )))
    } else {
        None
    };

    // Open the blob store and link namespace
    let manager = FileManager::open(&config.storage, config.policy.clone(), scanner)?;
    info!(stages = ?manager.pipeline().stage_names(), "Upload pipeline ready");

    // Clean up after any crash before accepting uploads
    let stats = manager.recover().await?;
    if stats.reconcile.stale_markers_removed > 0 || stats.gc.blobs_removed > 0 {
        warn!(
            stale_markers_removed = stats.reconcile.stale_markers_removed,
            blobs_removed = stats.reconcile.blobs_removed + stats.gc.blobs_removed,
            "Recovered from an unclean shutdown"
        );
    }

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
