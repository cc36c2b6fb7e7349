//! Write pump: the only task that touches the WebSocket sink.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Writes queued frames in order until cancelled or the queue closes,
/// then sends a close frame.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(frame) = msg else { break };
                if let Err(e) = write.send(frame).await {
                    error!("WebSocket write error: {e}");
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    // Flush what was queued before the cancel, e.g. a final error report.
    write_rx.close();
    while let Ok(frame) = write_rx.try_recv() {
        if write.send(frame).await.is_err() {
            return;
        }
    }
    let _ = write.send(tungstenite::Message::Close(None)).await;
}
