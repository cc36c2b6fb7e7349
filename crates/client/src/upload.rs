//! Upload client: the sending half of the upload channel.
//!
//! The server paces the transfer; this side answers each
//! `BlockDataRequest` with exactly the requested block and attaches a
//! checkpoint hash where a window closes.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use blockwire_crypt::{StreamEncryptor, StreamKey, seal_file};
use blockwire_protocol::constants::DEFAULT_BLOCK_SIZE;
use blockwire_protocol::{Message, UploadFileInfo};
use blockwire_transfer::{
    BlockLayout, BlockReader, Direction, EventBus, FileTransferContext, TransferEvent,
    calculate_file_checksum,
};

use crate::ClientError;
use crate::connection::ClientConnection;

/// How an upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server stored the file under the returned transfer id.
    Uploaded { id: u32, bytes: u64 },
    /// The server already had identical content at that name.
    AlreadyExists,
}

pub struct UploadClient {
    conn: ClientConnection,
    key: Option<StreamKey>,
    events: EventBus,
}

impl UploadClient {
    pub fn new(conn: ClientConnection, key: Option<StreamKey>, events: EventBus) -> Self {
        Self { conn, key, events }
    }

    /// Uploads `local` as `remote`.
    ///
    /// With a stream key the file is sealed into a staging file first and
    /// the sealed bytes are what the server stores.
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<UploadOutcome, ClientError> {
        let Some(key) = self.key.clone() else {
            return self.send_file(local, remote).await;
        };

        let staging = staging_path();
        let result = async {
            let frame = (DEFAULT_BLOCK_SIZE as usize).saturating_sub(StreamEncryptor::overhead());
            seal_file(local, &staging, &key, frame).await?;
            self.send_file(&staging, remote).await
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), "failed to remove staging file: {e}");
            }
        }
        result
    }

    async fn send_file(&mut self, path: &Path, remote: &str) -> Result<UploadOutcome, ClientError> {
        let hash = calculate_file_checksum(path).await?;
        let mut reader = BlockReader::open(path).await?;
        let file_size = reader.file_len();

        self.conn
            .send(&Message::UploadFileRequest {
                file_size,
                info: UploadFileInfo {
                    filename: remote.to_string(),
                    hash,
                },
            })
            .await?;

        let id = match self.conn.reply().await? {
            Message::UploadFileExist { .. } => {
                info!(file = %remote, "server already has this file");
                self.events.publish(TransferEvent::Skipped {
                    path: remote.to_string(),
                });
                return Ok(UploadOutcome::AlreadyExists);
            }
            Message::UploadFileResponse { id, .. } => id,
            other => {
                return Err(ClientError::Unexpected {
                    expected: "UploadFileResponse",
                    got: other.tag(),
                });
            }
        };

        let (block_size, block_count) = match self.conn.reply().await? {
            Message::FileBlockRequest {
                id: rid,
                block_size,
                block_count,
            } if rid == id => (block_size, block_count),
            other => {
                return Err(ClientError::Unexpected {
                    expected: "FileBlockRequest",
                    got: other.tag(),
                });
            }
        };
        let layout = BlockLayout::new(file_size, block_size)?;
        if layout.block_count() != block_count {
            return Err(ClientError::Protocol(format!(
                "server expects {block_count} blocks, file has {}",
                layout.block_count()
            )));
        }
        self.conn
            .send(&Message::FileBlockResponse {
                id,
                block_size,
                block_count,
            })
            .await?;

        let mut ctx = FileTransferContext::new(id, remote, path.to_path_buf(), layout);
        self.events.publish(TransferEvent::Started {
            id,
            direction: Direction::Upload,
            path: remote.to_string(),
            file_size,
            block_count,
        });

        match self.stream_blocks(&mut ctx, &mut reader).await {
            Ok(()) => {
                info!(id, file = %remote, bytes = file_size, "upload complete");
                self.events.publish(TransferEvent::Completed {
                    id,
                    direction: Direction::Upload,
                    path: remote.to_string(),
                    file_size,
                });
                Ok(UploadOutcome::Uploaded {
                    id,
                    bytes: file_size,
                })
            }
            Err(e) => {
                warn!(id, file = %remote, "upload failed: {e}");
                self.events.publish(TransferEvent::Failed {
                    id,
                    direction: Direction::Upload,
                    path: remote.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Serves block requests until the server reports `Done`.
    async fn stream_blocks(
        &mut self,
        ctx: &mut FileTransferContext,
        reader: &mut BlockReader,
    ) -> Result<(), ClientError> {
        let id = ctx.id();
        loop {
            match self.conn.reply().await? {
                Message::BlockDataRequest { id: rid, index } if rid == id => {
                    let len = ctx
                        .layout()
                        .block_len(index)
                        .ok_or(blockwire_transfer::TransferError::PastEnd { index })?;
                    let data = reader.read_at(ctx.offset_of(index), len).await?;
                    let hash = ctx.seal_block(index, &data)?;
                    self.conn
                        .send(&Message::BlockDataResponse {
                            id,
                            index,
                            hash,
                            data: Bytes::from(data),
                        })
                        .await?;
                    self.events.publish(TransferEvent::Progress {
                        id,
                        direction: Direction::Upload,
                        bytes_done: ctx.bytes_done(),
                        file_size: ctx.file_size(),
                    });
                }
                Message::Done { id: rid } if rid == id => {
                    if !ctx.is_complete() {
                        return Err(ClientError::Protocol(format!(
                            "Done after {} of {} blocks",
                            ctx.active_block_count(),
                            ctx.block_count()
                        )));
                    }
                    return Ok(());
                }
                other => {
                    return Err(ClientError::Unexpected {
                        expected: "BlockDataRequest or Done",
                        got: other.tag(),
                    });
                }
            }
        }
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

pub(crate) fn staging_path() -> PathBuf {
    std::env::temp_dir().join(format!("blockwire-{}.sealed", uuid::Uuid::new_v4()))
}
