//! Keepalive pump: periodic application-level `Keepalive` messages.
//!
//! The server answers each with an echo, so an idle channel still sees
//! inbound traffic before its read deadline.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use blockwire_protocol::{Message, encode};

pub(crate) async fn keepalive_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame = match encode(&Message::keepalive_now()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("keepalive encode failed: {e}");
                        break;
                    }
                };
                trace!("sending keepalive");
                if write_tx.send(tungstenite::Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        }
    }
}
