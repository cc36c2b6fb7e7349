//! Control client: listing and small filesystem edits on the server.

use blockwire_protocol::{FileListing, Message, MessageTag, RenamePaths};

use crate::ClientError;
use crate::connection::ClientConnection;

pub struct ControlClient {
    conn: ClientConnection,
}

impl ControlClient {
    pub fn new(conn: ClientConnection) -> Self {
        Self { conn }
    }

    async fn request(&mut self, msg: Message) -> Result<Message, ClientError> {
        self.conn.send(&msg).await?;
        self.conn.reply().await
    }

    /// Lists a directory. Long listings may come back truncated.
    pub async fn list(&mut self, path: &str) -> Result<FileListing, ClientError> {
        match self
            .request(Message::FilesRequest {
                path: path.to_string(),
            })
            .await?
        {
            Message::FilesResponse(listing) => Ok(listing),
            other => Err(unexpected("FilesResponse", other)),
        }
    }

    /// Deletes a file or an empty directory.
    pub async fn delete(&mut self, path: &str) -> Result<(), ClientError> {
        match self
            .request(Message::DeleteFileRequest {
                path: path.to_string(),
            })
            .await?
        {
            Message::DeleteFileResponse { .. } => Ok(()),
            other => Err(unexpected("DeleteFileResponse", other)),
        }
    }

    /// Creates a directory and any missing parents.
    pub async fn mkdir(&mut self, path: &str) -> Result<(), ClientError> {
        match self
            .request(Message::CreateDir {
                path: path.to_string(),
            })
            .await?
        {
            Message::Ack {
                acked: MessageTag::CreateDir,
            } => Ok(()),
            other => Err(unexpected("Ack(CreateDir)", other)),
        }
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), ClientError> {
        let paths = RenamePaths {
            from: from.to_string(),
            to: to.to_string(),
        };
        match self.request(Message::RenameRequest(paths)).await? {
            Message::RenameResponse(_) => Ok(()),
            other => Err(unexpected("RenameResponse", other)),
        }
    }

    pub fn close(&self) {
        self.conn.close();
    }
}

fn unexpected(expected: &'static str, got: Message) -> ClientError {
    ClientError::Unexpected {
        expected,
        got: got.tag(),
    }
}
