use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use broadcast_relay_service::config::Settings;
use broadcast_relay_service::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let server = Arc::new(RelayServer::new(settings));
    let addr = server.bind().await?;
    tracing::info!("Relay listening on {}", addr);

    // Log relayed traffic from the subscriber channel
    let mut relayed = server.subscribe();
    let observer_handle = tokio::spawn(async move {
        while let Ok(event) = relayed.recv().await {
            tracing::info!(
                sender_id = %event.sender_id,
                bytes = event.text.len(),
                "Relayed message"
            );
        }
    });

    // Run the accept loop in the background
    let accept_server = server.clone();
    let accept_handle = tokio::spawn(async move {
        if let Err(e) = accept_server.listen().await {
            tracing::error!(error = %e, "Accept loop failed");
        }
    });

    shutdown_signal().await;

    if let Some(result) = server.shutdown().await {
        tracing::info!(
            disposed = result.handles_disposed,
            forced = result.forced,
            duration_ms = result.duration.as_millis() as u64,
            "Teardown finished"
        );
    }

    let _ = accept_handle.await;
    observer_handle.abort();

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating shutdown");
        }
    }
}
