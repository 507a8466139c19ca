use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use network::{read_line, write_message, ErrorCode, Message, NodeId, RebalanceInstruction};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{Config, Result, StorageEngine, StorageError};

/// A storage node: joins the controller, then serves controller commands
/// and client or peer transfers until the controller goes away.
pub struct Dstore {
    config: Config,
    engine: Arc<StorageEngine>,
    listener: TcpListener,
    port: u16,
}

struct Shared {
    engine: Arc<StorageEngine>,
    controller: Mutex<OwnedWriteHalf>,
    peer_host: String,
    timeout: Duration,
}

impl Dstore {
    /// Opens the storage folder and the listening socket. Port 0 picks an
    /// ephemeral port, which is then the id announced in JOIN.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(StorageEngine::new(&config.folder).await?);
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();

        info!("storage node listening on port {} with folder {:?}", port, config.folder);

        Ok(Self {
            config,
            engine,
            listener,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> NodeId {
        NodeId(self.port)
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Joins the controller and serves until its connection closes.
    ///
    /// Every spawned transfer is owned by this future, so dropping it tears
    /// the node down completely.
    pub async fn run(self) -> Result<()> {
        let stream = TcpStream::connect(self.config.controller_address())
            .await
            .map_err(|e| {
                StorageError::Network(network::NetworkError::ConnectionFailed(format!(
                    "{}: {}",
                    self.config.controller_address(),
                    e
                )))
            })?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let shared = Arc::new(Shared {
            engine: Arc::clone(&self.engine),
            controller: Mutex::new(writer),
            peer_host: self.config.controller_host.clone(),
            timeout: self.config.timeout(),
        });

        shared.notify_controller(&Message::Join(self.id())).await?;
        info!(node = %self.id(), "joined controller at {}", self.config.controller_address());

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                line = read_line(&mut reader) => {
                    let Some(line) = line? else {
                        info!(node = %self.id(), "controller closed the connection");
                        return Ok(());
                    };
                    match line.parse::<Message>() {
                        Ok(Message::Rebalance(instruction)) => {
                            let shared = Arc::clone(&shared);
                            tasks.spawn(async move { shared.rebalance(instruction).await });
                        }
                        Ok(message) => {
                            if let Err(e) = shared.handle_controller(message).await {
                                error!("controller command failed: {}", e);
                            }
                        }
                        Err(e) => warn!("ignoring malformed controller line {:?}: {}", line, e),
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&shared);
                            tasks.spawn(async move { shared.serve_connection(stream, peer).await });
                        }
                        Err(e) => error!("accept failed: {}", e),
                    }
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    match finished {
                        Ok(Err(e)) => warn!("connection handler failed: {}", e),
                        Err(e) if e.is_panic() => error!("connection handler panicked: {}", e),
                        _ => {}
                    }
                }
            }
        }
    }
}

impl Shared {
    async fn notify_controller(&self, message: &Message) -> Result<()> {
        let mut controller = self.controller.lock().await;
        write_message(&mut *controller, message).await?;
        Ok(())
    }

    async fn handle_controller(&self, message: Message) -> Result<()> {
        match message {
            Message::List(_) => {
                let files = self.engine.list().await?;
                self.notify_controller(&Message::List(files)).await
            }
            Message::Remove(name) => {
                let reply = if self.engine.delete(&name).await? {
                    Message::RemoveAck(name)
                } else {
                    Message::Error {
                        code: ErrorCode::FileDoesNotExist,
                        file: Some(name),
                    }
                };
                self.notify_controller(&reply).await
            }
            other => {
                warn!("unexpected controller message {}", other);
                Ok(())
            }
        }
    }

    /// Copies go out first; local deletions happen only once every copy
    /// landed.
    async fn rebalance(self: Arc<Self>, instruction: RebalanceInstruction) -> Result<()> {
        debug!(
            "rebalance: {} transfers, {} deletions",
            instruction.transfer_count(),
            instruction.to_remove.len()
        );

        let this = &self;
        let transfers = instruction
            .to_send
            .iter()
            .flat_map(|(name, peers)| peers.iter().map(move |peer| this.copy_to_peer(name, *peer)));
        let results = join_all(transfers).await;

        if results.iter().any(|ok| !ok) {
            return Err(StorageError::Timeout(
                "rebalance transfers incomplete, keeping local files".to_string(),
            ));
        }

        for name in &instruction.to_remove {
            self.engine.delete(name).await?;
        }
        self.notify_controller(&Message::RebalanceComplete).await
    }

    async fn copy_to_peer(&self, name: &str, peer: NodeId) -> bool {
        match tokio::time::timeout(self.timeout, self.send_to_peer(name, peer)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(file = %name, peer = %peer, "rebalance copy failed: {}", e);
                false
            }
            Err(_) => {
                warn!(file = %name, peer = %peer, "rebalance copy timed out");
                false
            }
        }
    }

    async fn send_to_peer(&self, name: &str, peer: NodeId) -> Result<()> {
        let data = self.engine.get(name).await?;
        let stream = TcpStream::connect((self.peer_host.as_str(), peer.0)).await?;
        let mut stream = BufReader::new(stream);

        let header = Message::RebalanceStore {
            name: name.to_string(),
            size: data.len() as u64,
        };
        write_message(stream.get_mut(), &header).await?;

        match read_line(&mut stream).await? {
            Some(line) if line == Message::Ack.to_string() => {}
            other => {
                return Err(StorageError::Network(network::NetworkError::Protocol(format!(
                    "peer {} answered {:?} instead of ACK",
                    peer, other
                ))));
            }
        }

        stream.get_mut().write_all(&data).await?;
        stream.get_mut().shutdown().await?;

        // The peer closes its side once the file is on disk.
        let mut trailing = Vec::new();
        stream.read_to_end(&mut trailing).await?;
        debug!(file = %name, peer = %peer, "copied to peer");
        Ok(())
    }

    /// One inbound connection carries exactly one request.
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut stream = BufReader::new(stream);
        let Some(line) = read_line(&mut stream).await? else {
            return Ok(());
        };

        let request = match line.parse::<Message>() {
            Ok(request) => request,
            Err(e) => {
                warn!("ignoring malformed line {:?} from {}: {}", line, peer, e);
                return Ok(());
            }
        };

        match request {
            Message::Store { name, size } => {
                self.receive(&mut stream, &name, size).await?;
                self.notify_controller(&Message::StoreAck(name)).await
            }
            Message::RebalanceStore { name, size } => self.receive(&mut stream, &name, size).await,
            Message::LoadData(name) => match self.engine.get(&name).await {
                Ok(data) => {
                    stream.get_mut().write_all(&data).await?;
                    stream.get_mut().shutdown().await?;
                    Ok(())
                }
                Err(StorageError::FileNotFound(_)) => {
                    warn!(file = %name, "load of missing file, closing connection");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            other => {
                warn!("unexpected request {} from {}", other, peer);
                Ok(())
            }
        }
    }

    async fn receive(&self, stream: &mut BufReader<TcpStream>, name: &str, size: u64) -> Result<()> {
        write_message(stream.get_mut(), &Message::Ack).await?;

        // Grows with what actually arrives, never with the announced size.
        let mut buffer = Vec::new();
        (&mut *stream).take(size).read_to_end(&mut buffer).await?;
        if buffer.len() as u64 != size {
            return Err(StorageError::Network(network::NetworkError::Protocol(format!(
                "{} announced {} bytes, connection closed after {}",
                name,
                size,
                buffer.len()
            ))));
        }
        self.engine.put(name, Bytes::from(buffer)).await?;

        info!(file = %name, "received {} bytes", size);
        Ok(())
    }
}
