//! Which channels each logged-in client has open.
//!
//! A client typically holds a control, an upload and a download channel
//! under the same token; this is the one structure those sessions share.

use std::collections::HashMap;

use tokio::sync::Mutex;
use uuid::Uuid;

use blockwire_protocol::Channel;

/// One logged-in channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredChannel {
    pub connection_id: Uuid,
    pub username: String,
    pub channel: Channel,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Vec<RegisteredChannel>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, token: &str, username: &str, connection_id: Uuid, channel: Channel) {
        let mut inner = self.inner.lock().await;
        inner
            .entry(token.to_string())
            .or_default()
            .push(RegisteredChannel {
                connection_id,
                username: username.to_string(),
                channel,
            });
    }

    /// Removes a connection; tokens left with no channels are dropped.
    pub async fn unregister(&self, connection_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.retain(|_, channels| {
            channels.retain(|c| c.connection_id != connection_id);
            !channels.is_empty()
        });
    }

    pub async fn channels_for(&self, token: &str) -> Vec<RegisteredChannel> {
        self.inner
            .lock()
            .await
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    /// Total registered channels.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
