use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use network::{read_line, Message, NodeId, NodeRegistry, StorageNode};
use placement::{select_nodes, FileRecord, FileTable};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ControllerError, Result};
use crate::gate::{Admission, Gate, Request};
use crate::rebalancer::{RebalanceTimer, Rebalancer};
use crate::session::ClientSession;

struct State {
    config: Config,
    registry: NodeRegistry,
    files: RwLock<FileTable>,
    gate: Gate,
    trigger: Notify,
}

/// The coordinating service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Controller {
    state: Arc<State>,
    listener: Arc<TcpListener>,
}

impl Controller {
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_address()).await?;
        info!(
            "controller listening on {} (R={}, timeout={}ms, rebalance every {}ms)",
            listener.local_addr()?,
            config.replication_factor,
            config.timeout_ms,
            config.rebalance_period_ms
        );

        Ok(Self {
            state: Arc::new(State {
                config,
                registry: NodeRegistry::new(),
                files: RwLock::new(FileTable::new()),
                gate: Gate::new(),
                trigger: Notify::new(),
            }),
            listener: Arc::new(listener),
        })
    }

    /// Serves connections and runs the liveness sweep and the rebalance
    /// schedule until one of them fails.
    pub async fn start(&self) -> Result<()> {
        info!("starting controller services");

        tokio::select! {
            result = self.accept_loop() => {
                error!("accept loop stopped: {:?}", result);
                result
            }
            result = self.sweep_loop() => {
                error!("liveness sweep stopped: {:?}", result);
                result
            }
            result = self.schedule_rebalances() => {
                error!("rebalance scheduler stopped: {:?}", result);
                result
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Ids of the storage nodes currently connected.
    pub async fn live_nodes(&self) -> Vec<NodeId> {
        self.state.registry.live_ids().await
    }

    pub async fn file_record(&self, name: &str) -> Option<FileRecord> {
        self.state.files.read().await.get(name).cloned()
    }

    /// Every tracked filename, whatever its status, sorted.
    pub async fn file_names(&self) -> Vec<String> {
        let files = self.state.files.read().await;
        let mut names: Vec<String> = files.iter().map(|r| r.filename().to_string()).collect();
        names.sort();
        names
    }

    pub async fn is_rebalancing(&self) -> bool {
        self.state.gate.is_rebalancing().await
    }

    /// Starts a rebalance as soon as the scheduler is free.
    pub fn trigger_rebalance(&self) {
        self.state.trigger.notify_one();
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let controller = self.clone();
                    tokio::spawn(async move { controller.serve_connection(stream, peer).await });
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
    }

    /// The first line decides whether the peer is a storage node (JOIN) or a
    /// client.
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let first = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("reading from {} failed: {}", peer, e);
                return;
            }
        };

        if let Ok(Message::Join(node)) = first.parse::<Message>() {
            self.submit(Request::Join {
                node,
                reader,
                writer,
            })
            .await;
        } else {
            self.serve_client(first, reader, writer, peer).await;
        }
    }

    async fn serve_client(
        &self,
        first: String,
        mut reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        peer: SocketAddr,
    ) {
        let session = Arc::new(ClientSession::new(peer, writer));
        debug!(session = %session.id(), "client connected from {}", peer);

        let mut next = Some(first);
        loop {
            let line = match next.take() {
                Some(line) => line,
                None => match read_line(&mut reader).await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session = %session.id(), "client read failed: {}", e);
                        break;
                    }
                },
            };

            match line.parse::<Message>() {
                Ok(message) => {
                    self.submit(Request::Client {
                        session: Arc::clone(&session),
                        message,
                    })
                    .await
                }
                Err(e) => warn!(session = %session.id(), "ignoring malformed line {:?}: {}", line, e),
            }
        }

        debug!(session = %session.id(), "client disconnected");
    }

    /// Runs `request` now, or parks until a rebalance has replayed it, so a
    /// connection never has two requests outstanding.
    async fn submit(&self, request: Request) {
        match self.state.gate.admit(request).await {
            Admission::Dispatch(request, _in_flight) => self.dispatch(request).await,
            Admission::Queued(replayed) => {
                let _ = replayed.await;
            }
        }
    }

    async fn dispatch(&self, request: Request) {
        match request {
            Request::Join {
                node,
                reader,
                writer,
            } => self.join(node, reader, writer).await,
            Request::Client { session, message } => {
                let outcome = self.handle_client(&session, message).await;
                let reply = match outcome {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!(session = %session.id(), "request failed: {}", e);
                        e.into_reply()
                    }
                };
                if let Some(reply) = reply {
                    if let Err(e) = session.send(&reply).await {
                        warn!(session = %session.id(), "reply not delivered: {}", e);
                    }
                }
            }
        }
    }

    async fn join(&self, id: NodeId, reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf) {
        let node = StorageNode::spawn(id, reader, writer);
        if self.state.registry.register(node).await.is_some() {
            warn!(node = %id, "storage node rejoined, replacing its old connection");
        }

        let live = self.state.registry.live_count().await;
        info!(node = %id, "storage node joined ({} live)", live);

        if live >= self.state.config.replication_factor && !self.state.files.read().await.is_empty() {
            self.trigger_rebalance();
        }
    }

    async fn handle_client(&self, session: &ClientSession, message: Message) -> Result<Option<Message>> {
        let required = self.state.config.replication_factor;
        let live = self.state.registry.live_count().await;
        if live < required {
            return Err(ControllerError::InsufficientReplicas { live, required });
        }

        match message {
            Message::List(_) => Ok(Some(Message::List(
                self.state.files.read().await.visible_names(),
            ))),
            Message::Store { name, size } => self.store(session, name, size).await,
            Message::Load(name) => self.load(session, &name, false).await,
            Message::Reload(name) => self.load(session, &name, true).await,
            Message::Remove(name) => self.remove(&name).await,
            other => Err(ControllerError::Malformed(format!(
                "{} is not a client request",
                other.token()
            ))),
        }
    }

    async fn store(&self, session: &ClientSession, name: String, size: u64) -> Result<Option<Message>> {
        let required = self.state.config.replication_factor;
        let live = self.state.registry.live_ids().await;

        let chosen = {
            let mut files = self.state.files.write().await;
            files.begin_store(&name, size)?;
            let loads = files.node_loads(&live);
            select_nodes(&loads, required, files.len())
        };

        if chosen.len() < required {
            self.state.files.write().await.remove(&name);
            return Err(ControllerError::InsufficientReplicas {
                live: chosen.len(),
                required,
            });
        }

        let ack = Message::StoreAck(name.clone());
        let mut nodes = Vec::with_capacity(chosen.len());
        for id in &chosen {
            if let Some(node) = self.state.registry.get(*id).await {
                node.discard(|message| *message == ack).await;
                nodes.push(node);
            }
        }

        if let Err(e) = session.send(&Message::StoreTo(chosen.clone())).await {
            self.state.files.write().await.remove(&name);
            return Err(e);
        }
        debug!(file = %name, "storing to {:?}", chosen);

        let timeout = self.state.config.timeout();
        let mut waits: FuturesUnordered<_> = nodes
            .iter()
            .map(|node| {
                let ack = &ack;
                async move { (node.id(), node.expect_exact(ack, timeout).await) }
            })
            .collect();

        let mut acked = 0;
        while let Some((id, outcome)) = waits.next().await {
            match outcome {
                Ok(Some(_)) => {
                    acked += 1;
                    if let Some(record) = self.state.files.write().await.get_mut(&name) {
                        record.add_replica(id);
                    }
                }
                Ok(None) => warn!(file = %name, node = %id, "no STORE_ACK within timeout"),
                Err(e) => warn!(file = %name, node = %id, "store acknowledgement lost: {}", e),
            }
        }

        let mut files = self.state.files.write().await;
        if acked == required {
            if let Some(record) = files.get_mut(&name) {
                record.mark_store_complete()?;
            }
            info!(file = %name, "stored on {} nodes", acked);
            return Ok(Some(Message::StoreComplete));
        }

        files.remove(&name);
        drop(files);
        for node in &nodes {
            node.discard(|message| *message == ack).await;
        }
        Err(ControllerError::QuorumTimeout {
            file: name,
            acked,
            required,
        })
    }

    async fn load(&self, session: &ClientSession, name: &str, retry: bool) -> Result<Option<Message>> {
        let files = self.state.files.read().await;
        let mut cursor = session.cursor().lock().await;

        let Some(record) = files.get(name).filter(|record| record.is_visible()) else {
            cursor.reset();
            return Err(ControllerError::FileNotFound(name.to_string()));
        };
        if record.replicas().is_empty() {
            cursor.reset();
            return Err(ControllerError::NoLiveReplica(name.to_string()));
        }

        let index = if retry {
            cursor.advance(name)
        } else {
            cursor.start(name)
        };

        match record.replica_at(index) {
            Some(node) => Ok(Some(Message::LoadFrom {
                node,
                size: record.size(),
            })),
            None => {
                debug!(file = %name, "all {} replicas tried", record.replicas().len());
                cursor.reset();
                Err(ControllerError::FileNotFound(name.to_string()))
            }
        }
    }

    /// A storage node that no longer has the file counts as having deleted
    /// it. On timeout the record stays `RemoveInProgress` holding only the
    /// nodes that did not answer, and no reply is sent.
    async fn remove(&self, name: &str) -> Result<Option<Message>> {
        let holders = {
            let mut files = self.state.files.write().await;
            let record = files
                .get_mut(name)
                .filter(|record| record.is_visible())
                .ok_or_else(|| ControllerError::FileNotFound(name.to_string()))?;
            record.begin_remove()?;
            record.replicas().clone()
        };

        let timeout = self.state.config.timeout();
        let command = Message::Remove(name.to_string());
        let deleted = |message: &Message| match message {
            Message::RemoveAck(file) => file == name,
            Message::Error {
                code: network::ErrorCode::FileDoesNotExist,
                file: Some(file),
            } => file == name,
            _ => false,
        };

        let mut waits: FuturesUnordered<_> = holders
            .iter()
            .map(|id| {
                let command = &command;
                async move {
                    let Some(node) = self.state.registry.get(*id).await else {
                        return (*id, Err(network::NetworkError::DeadNode(*id)));
                    };
                    node.discard(deleted).await;
                    (*id, node.send_and_expect(command, deleted, timeout).await)
                }
            })
            .collect();

        let mut confirmed = 0;
        while let Some((id, outcome)) = waits.next().await {
            match outcome {
                Ok(Some(_)) => {
                    confirmed += 1;
                    if let Some(record) = self.state.files.write().await.get_mut(name) {
                        record.remove_replica(id);
                    }
                }
                Ok(None) => warn!(file = %name, node = %id, "no REMOVE_ACK within timeout"),
                Err(e) => warn!(file = %name, node = %id, "remove not confirmed: {}", e),
            }
        }

        if confirmed < holders.len() {
            return Err(ControllerError::QuorumTimeout {
                file: name.to_string(),
                acked: confirmed,
                required: holders.len(),
            });
        }

        let mut files = self.state.files.write().await;
        if let Some(record) = files.get_mut(name) {
            record.mark_remove_complete()?;
        }
        files.remove(name);
        info!(file = %name, "removed from {} nodes", confirmed);
        Ok(Some(Message::RemoveComplete))
    }

    /// Evicts disconnected nodes and strips them from every replica set.
    async fn sweep_loop(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.state.config.sweep_interval());
        loop {
            interval.tick().await;
            if self.state.gate.is_rebalancing().await {
                continue;
            }

            let dead = self.state.registry.evict_dead().await;
            if dead.is_empty() {
                continue;
            }

            let mut files = self.state.files.write().await;
            for id in dead {
                let purged = files.purge_node(id);
                info!(node = %id, "dropped dead node from {} replica sets", purged);
            }
        }
    }

    async fn schedule_rebalances(&self) -> Result<()> {
        let mut timer = RebalanceTimer::new(self.state.config.rebalance_period());
        loop {
            tokio::select! {
                _ = timer.expired() => debug!("periodic rebalance due"),
                _ = self.state.trigger.notified() => debug!("rebalance triggered"),
            }

            self.rebalance().await;
            timer.reset();
        }
    }

    /// One full cycle: close the gate, let running requests finish, fix
    /// placement, then replay whatever queued up.
    async fn rebalance(&self) {
        if !self.state.gate.begin().await {
            return;
        }
        info!("rebalance started");

        let timeout = self.state.config.timeout();
        if !self.state.gate.wait_idle(timeout).await {
            warn!(
                "{} requests still running after {:?}, rebalancing anyway",
                self.state.gate.in_flight(),
                timeout
            );
        }

        let report = Rebalancer::new(
            &self.state.registry,
            &self.state.files,
            self.state.config.replication_factor,
            timeout,
        )
        .run()
        .await;
        info!(
            "rebalance finished: {} nodes answered, {} instructed, {} completed, {} files lost",
            report.responders,
            report.instructed,
            report.completed,
            report.lost.len()
        );

        let mut replayed = 0;
        while let Some(pending) = self.state.gate.next_pending().await {
            replayed += 1;
            let (request, parked) = pending.into_parts();
            self.dispatch(request).await;
            parked.release();
        }
        if replayed > 0 {
            debug!("replayed {} queued requests", replayed);
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("listener", &self.listener.local_addr().ok())
            .field("replication_factor", &self.state.config.replication_factor)
            .finish()
    }
}
