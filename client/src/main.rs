//! tetherd - background sync daemon for one device.
//!
//! Keeps the local queue flowing to the hub on an interval and logs sync
//! events until interrupted.

use tether_client::{Config, SyncEventKind, SyncService};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_client=debug,tetherd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        device_id = %config.identity.device_id,
        hub = %config.identity.hub_url,
        "Starting tetherd"
    );

    let service = SyncService::connect(&config).await?.build();
    service.initialize().await?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    SyncEventKind::SyncCompleted { result } => tracing::info!(
                        sent = result.deltas_sent,
                        received = result.deltas_received,
                        conflicts = result.conflicts,
                        "Sync cycle finished"
                    ),
                    SyncEventKind::SyncError { message } => {
                        tracing::warn!(error = %message, "Sync cycle failed")
                    }
                    SyncEventKind::ConflictResolved { conflict } => tracing::info!(
                        entity_id = %conflict.local_delta.entity_id,
                        resolution = ?conflict.resolution,
                        "Conflict resolved"
                    ),
                    _ => tracing::debug!(event = ?event.kind, "Sync event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    service.set_online(true);
    service.start_auto_sync();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    service.dispose().await;

    Ok(())
}
