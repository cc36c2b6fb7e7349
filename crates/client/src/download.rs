//! Download client: the receiving half of the download channel.
//!
//! Blocks are requested one at a time and written straight to the
//! destination. A failed checkpoint is reported to the server with
//! `Error{IntegrityMismatch}` and the transfer stops there; whatever was
//! already written stays on disk for the caller to inspect or discard.

use std::path::Path;

use tracing::{info, warn};

use blockwire_crypt::{StreamKey, open_file};
use blockwire_protocol::{ErrorCode, Message};
use blockwire_transfer::{
    BlockLayout, BlockWriter, Direction, EventBus, FileTransferContext, TransferError,
    TransferEvent,
};

use crate::ClientError;
use crate::connection::ClientConnection;
use crate::upload::staging_path;

pub struct DownloadClient {
    conn: ClientConnection,
    key: Option<StreamKey>,
    events: EventBus,
}

impl DownloadClient {
    pub fn new(conn: ClientConnection, key: Option<StreamKey>, events: EventBus) -> Self {
        Self { conn, key, events }
    }

    /// Downloads `remote` into `local` and returns the bytes written.
    ///
    /// With a stream key the sealed bytes are received into a staging
    /// file and opened into `local` only after the whole stream verifies.
    pub async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, ClientError> {
        let Some(key) = self.key.clone() else {
            return self.receive(remote, local).await;
        };

        let staging = staging_path();
        let result = async {
            self.receive(remote, &staging).await?;
            Ok::<_, ClientError>(open_file(&staging, local, &key).await?)
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), "failed to remove staging file: {e}");
            }
        }
        result
    }

    async fn receive(&mut self, remote: &str, dest: &Path) -> Result<u64, ClientError> {
        self.conn
            .send(&Message::DownloadFileRequest {
                filename: remote.to_string(),
            })
            .await?;
        let (id, file_size, block_size) = match self.conn.reply().await? {
            Message::DownloadFileResponse {
                id,
                file_size,
                block_size,
                ..
            } => (id, file_size, block_size),
            other => {
                return Err(ClientError::Unexpected {
                    expected: "DownloadFileResponse",
                    got: other.tag(),
                });
            }
        };

        let layout = BlockLayout::new(file_size, block_size)?;
        let mut ctx = FileTransferContext::new(id, remote, dest.to_path_buf(), layout);
        self.events.publish(TransferEvent::Started {
            id,
            direction: Direction::Download,
            path: remote.to_string(),
            file_size,
            block_count: layout.block_count(),
        });

        match self.receive_blocks(&mut ctx).await {
            Ok(()) => {
                info!(id, file = %remote, bytes = file_size, "download complete");
                self.events.publish(TransferEvent::Completed {
                    id,
                    direction: Direction::Download,
                    path: remote.to_string(),
                    file_size,
                });
                Ok(file_size)
            }
            Err(e) => {
                warn!(id, file = %remote, "download failed: {e}");
                self.events.publish(TransferEvent::Failed {
                    id,
                    direction: Direction::Download,
                    path: remote.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn receive_blocks(&mut self, ctx: &mut FileTransferContext) -> Result<(), ClientError> {
        let id = ctx.id();
        let mut writer = BlockWriter::create(ctx.path()).await?;

        while !ctx.is_complete() {
            let index = ctx.active_block_count();
            self.conn.send(&Message::BlockDataRequest { id, index }).await?;
            let (rid, rindex, hash, data) = match self.conn.reply().await? {
                Message::BlockDataResponse {
                    id,
                    index,
                    hash,
                    data,
                } => (id, index, hash, data),
                other => {
                    return Err(ClientError::Unexpected {
                        expected: "BlockDataResponse",
                        got: other.tag(),
                    });
                }
            };
            if rid != id {
                return Err(ClientError::Protocol(format!(
                    "block for transfer {rid} while {id} is in flight"
                )));
            }

            if let Err(e) = ctx.accept_block(rindex, &data, &hash) {
                if let Err(close) = writer.close().await {
                    warn!(id, "failed to flush partial download: {close}");
                }
                self.report(&e).await;
                return Err(e.into());
            }
            writer.write_at(ctx.offset_of(rindex), &data).await?;
            self.events.publish(TransferEvent::Progress {
                id,
                direction: Direction::Download,
                bytes_done: ctx.bytes_done(),
                file_size: ctx.file_size(),
            });
        }
        writer.close().await?;

        self.conn.send(&Message::BlockDataFinish { id }).await?;
        match self.conn.reply().await? {
            Message::Done { id: rid } if rid == id => Ok(()),
            other => Err(ClientError::Unexpected {
                expected: "Done",
                got: other.tag(),
            }),
        }
    }

    /// Tells the server why this transfer is being abandoned.
    async fn report(&self, err: &TransferError) {
        let code = if err.is_integrity() {
            ErrorCode::IntegrityMismatch
        } else {
            ErrorCode::InvalidBlock
        };
        if let Err(e) = self.conn.send(&Message::error(code, err.to_string())).await {
            warn!("failed to report transfer error: {e}");
        }
    }

    pub fn close(&self) {
        self.conn.close();
    }
}
