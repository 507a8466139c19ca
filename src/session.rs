use std::net::SocketAddr;

use network::{write_message, BoxedWriter, Message};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::error::Result;

/// Position in a LOAD/RELOAD sequence: which replica of `file` to offer next.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadCursor {
    file: Option<String>,
    index: usize,
}

impl LoadCursor {
    /// LOAD always starts over at the first replica.
    pub fn start(&mut self, file: &str) -> usize {
        self.file = Some(file.to_string());
        self.index = 0;
        self.index
    }

    /// RELOAD moves to the next replica of the file being loaded. A RELOAD for
    /// some other file behaves as if that file had just been LOADed once.
    pub fn advance(&mut self, file: &str) -> usize {
        if self.file.as_deref() == Some(file) {
            self.index += 1;
        } else {
            self.file = Some(file.to_string());
            self.index = 1;
        }
        self.index
    }

    pub fn reset(&mut self) {
        self.file = None;
        self.index = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// One client connection: where replies go and its LOAD retry cursor.
pub struct ClientSession {
    id: Uuid,
    peer: SocketAddr,
    writer: Mutex<BoxedWriter>,
    cursor: Mutex<LoadCursor>,
}

impl ClientSession {
    pub fn new<W>(peer: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            peer,
            writer: Mutex::new(Box::new(writer)),
            cursor: Mutex::new(LoadCursor::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await?;
        trace!(session = %self.id, "sent {}", message);
        Ok(())
    }

    pub fn cursor(&self) -> &Mutex<LoadCursor> {
        &self.cursor
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}
