//! Server side of the download channel.
//!
//! `WaitDownloadRequest -> StreamingFileData -> WaitDownloadRequest`.
//! The client is the receiver here: it requests blocks by index and the
//! server answers each request with exactly one block.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use blockwire_protocol::constants::PENDING_QUEUE_CAPACITY;
use blockwire_protocol::{Message, MessageTag};
use blockwire_transfer::{
    BlockLayout, BlockReader, Direction, FileTransferContext, TransferEvent, resolve_path,
};

use super::{SessionError, notify};
use crate::connection::{ConnectionError, Sender};
use crate::server::ServerState;

struct Outgoing {
    ctx: FileTransferContext,
    reader: BlockReader,
}

pub(super) struct DownloadSession {
    state: Arc<ServerState>,
    inflight: Option<Outgoing>,
    pending: VecDeque<String>,
}

impl DownloadSession {
    pub(super) fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            inflight: None,
            pending: VecDeque::new(),
        }
    }

    pub(super) fn state_name(&self) -> &'static str {
        if self.inflight.is_some() {
            "StreamingFileData"
        } else {
            "WaitDownloadRequest"
        }
    }

    pub(super) async fn handle(&mut self, msg: Message, sender: &Sender) -> Result<(), SessionError> {
        match msg {
            Message::DownloadFileRequest { filename } => {
                if self.inflight.is_some() {
                    return self.enqueue(filename);
                }
                self.start(filename, sender).await
            }
            Message::BlockDataRequest { id, index } => self.send_block(id, index, sender).await,
            Message::BlockDataFinish { id } => self.finish(id, sender).await,
            Message::Error { code, message } => Err(SessionError::Peer { code, message }),
            other => Err(SessionError::Unexpected {
                state: self.state_name(),
                got: other.tag(),
            }),
        }
    }

    fn enqueue(&mut self, filename: String) -> Result<(), SessionError> {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            return Err(SessionError::Busy(self.pending.len()));
        }
        debug!(file = %filename, queued = self.pending.len() + 1, "download queued");
        self.pending.push_back(filename);
        Ok(())
    }

    async fn start(&mut self, filename: String, sender: &Sender) -> Result<(), SessionError> {
        let path = resolve_path(&self.state.root, &filename)
            .ok_or_else(|| SessionError::Sandbox(filename.clone()))?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(SessionError::NotFound(filename)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(filename));
            }
            Err(e) => return Err(e.into()),
        }

        let reader = BlockReader::open(&path).await?;
        let layout = BlockLayout::new(reader.file_len(), self.state.block_size)?;
        let id = self.state.next_file_id();
        let ctx = FileTransferContext::new(id, filename.clone(), path, layout);

        info!(
            id,
            file = %filename,
            file_size = layout.file_size(),
            block_count = layout.block_count(),
            "download started"
        );
        self.state.events.publish(TransferEvent::Started {
            id,
            direction: Direction::Download,
            path: filename.clone(),
            file_size: layout.file_size(),
            block_count: layout.block_count(),
        });
        self.inflight = Some(Outgoing { ctx, reader });

        sender
            .send(&Message::download_response(
                id,
                layout.file_size(),
                layout.block_size(),
                &filename,
            ))
            .await?;
        Ok(())
    }

    async fn send_block(&mut self, id: u32, index: u64, sender: &Sender) -> Result<(), SessionError> {
        let Some(out) = self.inflight.as_mut() else {
            return Err(SessionError::Unexpected {
                state: "WaitDownloadRequest",
                got: MessageTag::BlockDataRequest,
            });
        };
        // Stale or duplicate requests are harmless; the receiver asks again.
        if id != out.ctx.id() || index != out.ctx.active_block_count() {
            warn!(
                id,
                index,
                expected = out.ctx.active_block_count(),
                "dropping block request out of sequence"
            );
            return Ok(());
        }
        let Some(len) = out.ctx.layout().block_len(index) else {
            warn!(id, index, "dropping block request past end of file");
            return Ok(());
        };

        let data = out.reader.read_at(out.ctx.offset_of(index), len).await?;
        let hash = out.ctx.seal_block(index, &data)?;
        sender
            .send(&Message::BlockDataResponse {
                id,
                index,
                hash,
                data: Bytes::from(data),
            })
            .await?;
        self.state.events.publish(TransferEvent::Progress {
            id,
            direction: Direction::Download,
            bytes_done: out.ctx.bytes_done(),
            file_size: out.ctx.file_size(),
        });
        Ok(())
    }

    async fn finish(&mut self, id: u32, sender: &Sender) -> Result<(), SessionError> {
        let Some(out) = self.inflight.as_ref() else {
            return Err(SessionError::Unexpected {
                state: "WaitDownloadRequest",
                got: MessageTag::BlockDataFinish,
            });
        };
        if id != out.ctx.id() {
            return Err(SessionError::Protocol(format!(
                "finish for transfer {id} while {} is in flight",
                out.ctx.id()
            )));
        }
        if !out.ctx.is_complete() {
            return Err(SessionError::Protocol(format!(
                "finish after {} of {} blocks",
                out.ctx.active_block_count(),
                out.ctx.block_count()
            )));
        }

        let Some(done) = self.inflight.take() else {
            return Ok(());
        };
        info!(id, file = %done.ctx.name(), bytes = done.ctx.file_size(), "download complete");
        self.state.events.publish(TransferEvent::Completed {
            id,
            direction: Direction::Download,
            path: done.ctx.name().to_string(),
            file_size: done.ctx.file_size(),
        });
        sender.send(&Message::Done { id }).await?;
        self.drain_pending(sender).await
    }

    pub(super) fn abort(&mut self, err: &SessionError) {
        let Some(out) = self.inflight.take() else {
            return;
        };
        warn!(id = out.ctx.id(), file = %out.ctx.name(), "download aborted: {err}");
        self.state.events.publish(TransferEvent::Failed {
            id: out.ctx.id(),
            direction: Direction::Download,
            path: out.ctx.name().to_string(),
            reason: err.to_string(),
        });
    }

    pub(super) async fn drain_pending(&mut self, sender: &Sender) -> Result<(), SessionError> {
        while self.inflight.is_none() {
            let Some(filename) = self.pending.pop_front() else {
                break;
            };
            if let Err(err) = self.start(filename, sender).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("queued download failed: {err}");
                self.abort(&err);
                notify(sender, &err).await?;
            }
        }
        Ok(())
    }

    pub(super) fn shutdown(&mut self) {
        self.pending.clear();
        self.abort(&SessionError::Connection(ConnectionError::Closed));
    }
}
