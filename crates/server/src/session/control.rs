//! Control channel: directory listing and small filesystem edits.
//!
//! Every request is answered on its own; failures never close the
//! channel, they come back as `Error` messages.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use blockwire_protocol::constants::MAX_STRUCTURED_PAYLOAD;
use blockwire_protocol::{FileEntry, FileListing, Message, MessageTag, RenamePaths};
use blockwire_transfer::{TEMP_SUFFIX, display_path, resolve_path};

use super::SessionError;
use crate::connection::Sender;
use crate::server::ServerState;

pub(super) struct ControlSession {
    state: Arc<ServerState>,
}

impl ControlSession {
    pub(super) fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub(super) async fn handle(&mut self, msg: Message, sender: &Sender) -> Result<(), SessionError> {
        let reply = match msg {
            Message::FilesRequest { path } => Message::FilesResponse(self.list(&path).await?),
            Message::DeleteFileRequest { path } => {
                self.delete(&path).await?;
                Message::DeleteFileResponse { path }
            }
            Message::CreateDir { path } => {
                let dir = self.resolve(&path)?;
                tokio::fs::create_dir_all(&dir).await?;
                info!(path = %path, "directory created");
                Message::Ack {
                    acked: MessageTag::CreateDir,
                }
            }
            Message::RenameRequest(paths) => {
                self.rename(&paths).await?;
                Message::RenameResponse(paths)
            }
            Message::Error { code, message } => {
                return Err(SessionError::Peer { code, message });
            }
            other => {
                return Err(SessionError::Unexpected {
                    state: "Ready",
                    got: other.tag(),
                });
            }
        };
        sender.send(&reply).await?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SessionError> {
        resolve_path(&self.state.root, path).ok_or_else(|| SessionError::Sandbox(path.to_string()))
    }

    /// Like [`Self::resolve`] but refuses the storage root itself.
    fn resolve_entry(&self, path: &str) -> Result<PathBuf, SessionError> {
        let resolved = self.resolve(path)?;
        if resolved == self.state.root {
            return Err(SessionError::Sandbox(path.to_string()));
        }
        Ok(resolved)
    }

    async fn list(&self, path: &str) -> Result<FileListing, SessionError> {
        let dir = self.resolve(path)?;
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| lookup_error(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(name = %name, "skipping entry: {e}");
                    continue;
                }
            };
            entries.push(FileEntry {
                name,
                size: if meta.is_dir() { 0 } else { meta.len() },
                is_dir: meta.is_dir(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(fit_listing(FileListing {
            path: display_path(&self.state.root, &dir),
            entries,
        }))
    }

    async fn delete(&self, path: &str) -> Result<(), SessionError> {
        let target = self.resolve_entry(path)?;
        let meta = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| lookup_error(e, path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        info!(path = %path, "deleted");
        Ok(())
    }

    async fn rename(&self, paths: &RenamePaths) -> Result<(), SessionError> {
        let from = self.resolve_entry(&paths.from)?;
        let to = self.resolve_entry(&paths.to)?;
        tokio::fs::symlink_metadata(&from)
            .await
            .map_err(|e| lookup_error(e, &paths.from))?;
        tokio::fs::rename(&from, &to).await?;
        info!(from = %paths.from, to = %paths.to, "renamed");
        Ok(())
    }
}

fn lookup_error(e: io::Error, path: &str) -> SessionError {
    if e.kind() == io::ErrorKind::NotFound {
        SessionError::NotFound(path.to_string())
    } else {
        SessionError::Io(e)
    }
}

/// Keeps the longest prefix of entries that encodes within the
/// structured payload cap.
///
/// Each entry is serialized once; the listing's encoded size is the
/// empty listing plus every kept entry and the commas between them.
fn fit_listing(mut listing: FileListing) -> FileListing {
    let total = listing.entries.len();
    let mut size = encoded_len(&FileListing {
        path: listing.path.clone(),
        entries: Vec::new(),
    });
    let mut keep = 0;
    for (i, entry) in listing.entries.iter().enumerate() {
        let entry_len = serde_json::to_vec(entry).map_or(usize::MAX, |v| v.len());
        let separator = usize::from(i > 0);
        let next = size.saturating_add(entry_len).saturating_add(separator);
        if next > MAX_STRUCTURED_PAYLOAD {
            break;
        }
        size = next;
        keep += 1;
    }

    if keep < total {
        listing.entries.truncate(keep);
        warn!(
            path = %listing.path,
            shown = keep,
            total,
            "directory listing truncated"
        );
    }
    listing
}

fn encoded_len(listing: &FileListing) -> usize {
    serde_json::to_vec(listing).map_or(usize::MAX, |v| v.len())
}
