use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{info, trace, warn};

use crate::framing::{read_line, write_message};
use crate::{Message, NetworkError, NodeId, Result};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Unclaimed messages kept per node; the oldest go first beyond this.
pub const INBOX_CAPACITY: usize = 1024;

/// Controller-side handle for one connected storage node.
///
/// A background reader drains the connection into `inbox` and wakes any task
/// blocked in [`StorageNode::expect`]. Once the connection closes the handle
/// stays dead; the registry sweep evicts it.
pub struct StorageNode {
    id: NodeId,
    joined_at: DateTime<Utc>,
    writer: Mutex<BoxedWriter>,
    inbox: Mutex<VecDeque<Message>>,
    arrivals: Notify,
    connected: AtomicBool,
}

impl StorageNode {
    pub fn spawn<R, W>(id: NodeId, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let node = Arc::new(Self {
            id,
            joined_at: Utc::now(),
            writer: Mutex::new(Box::new(writer)),
            inbox: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
            connected: AtomicBool::new(true),
        });

        let reader_node = Arc::clone(&node);
        tokio::spawn(async move {
            reader_node.read_loop(reader).await;
        });

        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::DeadNode(self.id));
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = write_message(&mut *writer, message).await {
            warn!(node = %self.id, "send failed, marking node dead: {}", e);
            self.mark_dead();
            return Err(NetworkError::DeadNode(self.id));
        }

        trace!(node = %self.id, "sent {}", message);
        Ok(())
    }

    /// Waits until a message accepted by `matches` is in the inbox, removes it
    /// and returns it. `Ok(None)` means the timeout elapsed first.
    pub async fn expect<F>(&self, mut matches: F, timeout: Duration) -> Result<Option<Message>>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;

        loop {
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(message) = self.take_first(&mut matches).await {
                return Ok(Some(message));
            }
            if !self.is_connected() {
                return Err(NetworkError::DeadNode(self.id));
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(None);
            }
        }
    }

    pub async fn expect_exact(&self, expected: &Message, timeout: Duration) -> Result<Option<Message>> {
        self.expect(|message| message == expected, timeout).await
    }

    pub async fn send_and_expect<F>(
        &self,
        command: &Message,
        matches: F,
        timeout: Duration,
    ) -> Result<Option<Message>>
    where
        F: FnMut(&Message) -> bool,
    {
        self.send(command).await?;
        self.expect(matches, timeout).await
    }

    /// Drops unclaimed inbox entries, e.g. late replies to a round that
    /// already timed out.
    pub async fn discard<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        let mut inbox = self.inbox.lock().await;
        let before = inbox.len();
        inbox.retain(|message| !matches(message));
        before - inbox.len()
    }

    pub async fn inbox_len(&self) -> usize {
        self.inbox.lock().await.len()
    }

    async fn take_first<F>(&self, matches: &mut F) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut inbox = self.inbox.lock().await;
        let position = inbox.iter().position(|message| matches(message))?;
        inbox.remove(position)
    }

    async fn read_loop<R>(&self, mut reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => match line.parse::<Message>() {
                    Ok(message) => {
                        trace!(node = %self.id, "received {}", message);
                        let mut inbox = self.inbox.lock().await;
                        if inbox.len() >= INBOX_CAPACITY {
                            if let Some(oldest) = inbox.pop_front() {
                                warn!(node = %self.id, "inbox full, dropping unclaimed {}", oldest);
                            }
                        }
                        inbox.push_back(message);
                        drop(inbox);
                        self.arrivals.notify_waiters();
                    }
                    Err(e) => {
                        warn!(node = %self.id, "ignoring malformed line {:?}: {}", line, e);
                    }
                },
                Ok(None) => {
                    info!(node = %self.id, "storage node closed its connection");
                    break;
                }
                Err(e) => {
                    warn!(node = %self.id, "read from storage node failed: {}", e);
                    break;
                }
            }
        }

        self.mark_dead();
    }

    fn mark_dead(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("joined_at", &self.joined_at)
            .finish()
    }
}
