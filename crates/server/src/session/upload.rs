//! Server side of the upload channel.
//!
//! `WaitUploadRequest -> WaitBlockConfirm -> WaitFileData -> WaitUploadRequest`.
//! The server is the receiver and paces the transfer: it asks for each
//! block by index and accepts only that block. Data lands in a `.tmp`
//! file private to the transfer, renamed into place once the whole-file
//! hash matches.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use blockwire_protocol::constants::PENDING_QUEUE_CAPACITY;
use blockwire_protocol::{Message, UploadFileInfo};
use blockwire_transfer::{
    BlockLayout, BlockWriter, Direction, FileTransferContext, TransferError, TransferEvent,
    calculate_file_checksum, resolve_path, temp_path_for,
};

use super::{SessionError, notify};
use crate::connection::{ConnectionError, Sender};
use crate::server::ServerState;

struct PendingUpload {
    file_size: u64,
    info: UploadFileInfo,
}

struct Inflight {
    ctx: FileTransferContext,
    writer: Option<BlockWriter>,
    temp_path: PathBuf,
    declared_hash: String,
    confirmed: bool,
}

pub(super) struct UploadSession {
    state: Arc<ServerState>,
    inflight: Option<Inflight>,
    pending: VecDeque<PendingUpload>,
}

impl UploadSession {
    pub(super) fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            inflight: None,
            pending: VecDeque::new(),
        }
    }

    pub(super) fn state_name(&self) -> &'static str {
        match &self.inflight {
            None => "WaitUploadRequest",
            Some(i) if !i.confirmed => "WaitBlockConfirm",
            Some(_) => "WaitFileData",
        }
    }

    pub(super) async fn handle(&mut self, msg: Message, sender: &Sender) -> Result<(), SessionError> {
        match msg {
            Message::UploadFileRequest { file_size, info } => {
                if self.inflight.is_some() {
                    return self.enqueue(PendingUpload { file_size, info });
                }
                self.start(file_size, info, sender).await
            }
            Message::FileBlockResponse {
                id,
                block_size,
                block_count,
            } => self.confirm(id, block_size, block_count, sender).await,
            Message::BlockDataResponse {
                id,
                index,
                hash,
                data,
            } => self.receive_block(id, index, &hash, &data, sender).await,
            Message::Error { code, message } => Err(SessionError::Peer { code, message }),
            other => Err(SessionError::Unexpected {
                state: self.state_name(),
                got: other.tag(),
            }),
        }
    }

    fn enqueue(&mut self, request: PendingUpload) -> Result<(), SessionError> {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            return Err(SessionError::Busy(self.pending.len()));
        }
        debug!(file = %request.info.filename, queued = self.pending.len() + 1, "upload queued");
        self.pending.push_back(request);
        Ok(())
    }

    async fn start(
        &mut self,
        file_size: u64,
        info: UploadFileInfo,
        sender: &Sender,
    ) -> Result<(), SessionError> {
        let path = resolve_path(&self.state.root, &info.filename)
            .filter(|p| *p != self.state.root)
            .ok_or_else(|| SessionError::Sandbox(info.filename.clone()))?;

        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.is_dir() {
                return Err(SessionError::Io(std::io::Error::other(format!(
                    "{} is a directory",
                    info.filename
                ))));
            }
            if meta.len() == file_size {
                let existing = calculate_file_checksum(&path).await?;
                if existing.eq_ignore_ascii_case(&info.hash) {
                    info!(file = %info.filename, "upload skipped, identical file exists");
                    self.state.events.publish(TransferEvent::Skipped {
                        path: info.filename.clone(),
                    });
                    sender
                        .send(&Message::UploadFileExist {
                            filename: info.filename,
                        })
                        .await?;
                    return Ok(());
                }
            }
        }

        let layout = BlockLayout::new(file_size, self.state.block_size)?;
        let temp_path = temp_path_for(&path, Uuid::new_v4().simple());
        let writer = BlockWriter::create_new(&temp_path).await?;
        let id = self.state.next_file_id();
        let ctx = FileTransferContext::new(id, info.filename.clone(), path, layout);

        info!(
            id,
            file = %info.filename,
            file_size,
            block_count = layout.block_count(),
            "upload started"
        );
        self.state.events.publish(TransferEvent::Started {
            id,
            direction: Direction::Upload,
            path: info.filename.clone(),
            file_size,
            block_count: layout.block_count(),
        });
        self.inflight = Some(Inflight {
            ctx,
            writer: Some(writer),
            temp_path,
            declared_hash: info.hash,
            confirmed: false,
        });

        sender
            .send(&Message::UploadFileResponse {
                id,
                filename: info.filename,
            })
            .await?;
        sender
            .send(&Message::FileBlockRequest {
                id,
                block_size: layout.block_size(),
                block_count: layout.block_count(),
            })
            .await?;
        Ok(())
    }

    async fn confirm(
        &mut self,
        id: u32,
        block_size: u32,
        block_count: u64,
        sender: &Sender,
    ) -> Result<(), SessionError> {
        let state = self.state_name();
        let Some(inflight) = self.inflight.as_mut().filter(|i| !i.confirmed) else {
            return Err(SessionError::Unexpected {
                state,
                got: blockwire_protocol::MessageTag::FileBlockResponse,
            });
        };
        let ctx = &inflight.ctx;
        if id != ctx.id() || block_size != ctx.block_size() || block_count != ctx.block_count() {
            return Err(SessionError::Protocol(format!(
                "block layout mismatch: offered id={} size={} count={}, got id={id} size={block_size} count={block_count}",
                ctx.id(),
                ctx.block_size(),
                ctx.block_count()
            )));
        }
        inflight.confirmed = true;

        if inflight.ctx.is_complete() {
            return self.finish(sender).await;
        }
        sender.send(&Message::BlockDataRequest { id, index: 0 }).await?;
        Ok(())
    }

    async fn receive_block(
        &mut self,
        id: u32,
        index: u64,
        hash: &str,
        data: &[u8],
        sender: &Sender,
    ) -> Result<(), SessionError> {
        let state = self.state_name();
        let Some(inflight) = self.inflight.as_mut().filter(|i| i.confirmed) else {
            return Err(SessionError::Unexpected {
                state,
                got: blockwire_protocol::MessageTag::BlockDataResponse,
            });
        };
        if id != inflight.ctx.id() {
            return Err(SessionError::Protocol(format!(
                "block for transfer {id} while {} is in flight",
                inflight.ctx.id()
            )));
        }

        inflight.ctx.accept_block(index, data, hash)?;
        let offset = inflight.ctx.offset_of(index);
        match inflight.writer.as_mut() {
            Some(writer) => writer.write_at(offset, data).await?,
            None => return Err(SessionError::Transfer(TransferError::PastEnd { index })),
        }
        self.state.events.publish(TransferEvent::Progress {
            id,
            direction: Direction::Upload,
            bytes_done: inflight.ctx.bytes_done(),
            file_size: inflight.ctx.file_size(),
        });

        if inflight.ctx.is_complete() {
            return self.finish(sender).await;
        }
        sender
            .send(&Message::BlockDataRequest {
                id,
                index: index + 1,
            })
            .await?;
        Ok(())
    }

    /// Verifies the whole-file hash and commits the rename.
    async fn finish(&mut self, sender: &Sender) -> Result<(), SessionError> {
        let Some(inflight) = self.inflight.as_mut() else {
            return Ok(());
        };
        if let Some(writer) = inflight.writer.take() {
            writer.close().await?;
        }
        let actual = inflight.ctx.content_hash();
        if !actual.eq_ignore_ascii_case(&inflight.declared_hash) {
            return Err(TransferError::ContentHashMismatch {
                expected: inflight.declared_hash.clone(),
                actual,
            }
            .into());
        }
        tokio::fs::rename(&inflight.temp_path, inflight.ctx.path()).await?;

        let Some(done) = self.inflight.take() else {
            return Ok(());
        };
        let id = done.ctx.id();
        info!(id, file = %done.ctx.name(), bytes = done.ctx.file_size(), "upload complete");
        self.state.events.publish(TransferEvent::Completed {
            id,
            direction: Direction::Upload,
            path: done.ctx.name().to_string(),
            file_size: done.ctx.file_size(),
        });
        sender.send(&Message::Done { id }).await?;
        self.drain_pending(sender).await
    }

    /// Drops the transfer in flight and its temp file.
    pub(super) async fn abort(&mut self, err: &SessionError) {
        let Some(mut inflight) = self.inflight.take() else {
            return;
        };
        drop(inflight.writer.take());
        if let Err(e) = tokio::fs::remove_file(&inflight.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %inflight.temp_path.display(), "failed to remove temp file: {e}");
            }
        }
        warn!(id = inflight.ctx.id(), file = %inflight.ctx.name(), "upload aborted: {err}");
        self.state.events.publish(TransferEvent::Failed {
            id: inflight.ctx.id(),
            direction: Direction::Upload,
            path: inflight.ctx.name().to_string(),
            reason: err.to_string(),
        });
    }

    pub(super) async fn drain_pending(&mut self, sender: &Sender) -> Result<(), SessionError> {
        while self.inflight.is_none() {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            if let Err(err) = self.start(next.file_size, next.info, sender).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("queued upload failed: {err}");
                self.abort(&err).await;
                notify(sender, &err).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn shutdown(&mut self) {
        self.pending.clear();
        self.abort(&SessionError::Connection(ConnectionError::Closed))
            .await;
    }
}
