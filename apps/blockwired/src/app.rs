//! Wires the server to the event log and waits for shutdown.

use blockwire_server::{FileServer, ServerConfig};
use blockwire_transfer::{EventBus, TransferEvent};
use tokio::sync::broadcast::error::RecvError;

/// Runs the server until Ctrl-C or a fatal listener error.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let events = EventBus::new();
    let server = FileServer::new(&config, events.clone())?;

    let mut rx = events.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server_run = std::sync::Arc::clone(&server);
    let result = tokio::select! {
        res = server_run.run() => res.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
    };

    server.shutdown();
    logger.abort();
    result
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Started {
            id,
            direction,
            path,
            file_size,
            block_count,
        } => tracing::info!(id, ?direction, %path, file_size, block_count, "transfer started"),
        TransferEvent::Progress {
            id,
            direction,
            bytes_done,
            file_size,
        } => tracing::trace!(id, ?direction, bytes_done, file_size, "transfer progress"),
        TransferEvent::Completed {
            id,
            direction,
            path,
            file_size,
        } => tracing::info!(id, ?direction, %path, file_size, "transfer completed"),
        TransferEvent::Failed {
            id,
            direction,
            path,
            reason,
        } => tracing::warn!(id, ?direction, %path, %reason, "transfer failed"),
        TransferEvent::Skipped { path } => tracing::info!(%path, "upload skipped, file unchanged"),
    }
}
