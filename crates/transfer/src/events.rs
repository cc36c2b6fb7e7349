use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Direction of a transfer, seen from the side publishing the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle notifications for transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        id: u32,
        direction: Direction,
        path: String,
        file_size: u64,
        block_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        id: u32,
        direction: Direction,
        bytes_done: u64,
        file_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        id: u32,
        direction: Direction,
        path: String,
        file_size: u64,
    },
    Failed {
        id: u32,
        direction: Direction,
        path: String,
        reason: String,
    },
    /// Upload skipped because the target already exists.
    Skipped { path: String },
}

/// Fan-out of [`TransferEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails; events sent while nobody is
/// subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
