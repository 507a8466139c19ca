#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use replistore::network::{read_line, Message, NodeId};
use replistore::storage::{self, Dstore, StorageEngine};
use replistore::{Config, Controller};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Starts a controller on an ephemeral loopback port.
pub async fn start_controller(replication: usize, timeout_ms: u64, rebalance_period_ms: u64) -> (Controller, u16) {
    let mut config = Config::new(0, replication, timeout_ms, rebalance_period_ms);
    config.bind_ip = "127.0.0.1".parse().unwrap();

    let controller = Controller::bind(config).await.unwrap();
    let port = controller.local_addr().unwrap().port();
    let running = controller.clone();
    tokio::spawn(async move {
        let _ = running.start().await;
    });
    (controller, port)
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_nodes(controller: &Controller, count: usize) {
    let joined = wait_until(REPLY_TIMEOUT, move || async move {
        controller.live_nodes().await.len() == count
    })
    .await;
    assert!(joined, "expected {} live storage nodes", count);
}

/// A real storage node running against a temporary folder.
pub struct RunningDstore {
    pub id: NodeId,
    pub engine: Arc<StorageEngine>,
    task: JoinHandle<storage::Result<()>>,
    _folder: TempDir,
}

impl RunningDstore {
    pub async fn start(controller_port: u16, timeout_ms: u64) -> Self {
        let folder = TempDir::new().unwrap();
        let config = storage::Config::new(0, controller_port, timeout_ms, folder.path());
        let dstore = Dstore::bind(config).await.unwrap();
        let id = dstore.id();
        let engine = Arc::clone(dstore.engine());
        let task = tokio::spawn(dstore.run());
        Self {
            id,
            engine,
            task,
            _folder: folder,
        }
    }

    pub async fn holds(&self, name: &str) -> bool {
        self.engine.list().await.unwrap().iter().any(|file| file == name)
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RunningDstore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A line-oriented client connection speaking the raw protocol.
pub struct Line {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Line {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    /// Next line, or `None` if nothing arrives within `timeout`.
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<String> {
        match tokio::time::timeout(timeout, read_line(&mut self.reader)).await {
            Ok(line) => line.unwrap(),
            Err(_) => None,
        }
    }

    pub async fn recv(&mut self) -> String {
        self.recv_within(REPLY_TIMEOUT).await.expect("no reply from controller")
    }

    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await
    }
}

#[derive(Debug, Clone)]
struct Behaviour {
    list_delay: Duration,
    answer_removes: bool,
}

/// A scripted storage node: it joins and answers controller commands from an
/// in-memory file set, but never serves data. Uploads are simulated with
/// [`FakeDstore::ack_store`].
pub struct FakeDstore {
    pub id: NodeId,
    files: Arc<StdMutex<BTreeSet<String>>>,
    behaviour: Arc<StdMutex<Behaviour>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    task: JoinHandle<()>,
    _listener: TcpListener,
}

impl FakeDstore {
    pub async fn join(controller_port: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id = NodeId(listener.local_addr().unwrap().port());

        let stream = TcpStream::connect(("127.0.0.1", controller_port)).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(format!("JOIN {}\n", id.0).as_bytes()).await.unwrap();

        let files = Arc::new(StdMutex::new(BTreeSet::new()));
        let behaviour = Arc::new(StdMutex::new(Behaviour {
            list_delay: Duration::ZERO,
            answer_removes: true,
        }));
        let writer = Arc::new(Mutex::new(writer));

        let task = tokio::spawn(Self::answer(
            BufReader::new(reader),
            Arc::clone(&writer),
            Arc::clone(&files),
            Arc::clone(&behaviour),
        ));

        Self {
            id,
            files,
            behaviour,
            writer,
            task,
            _listener: listener,
        }
    }

    async fn answer(
        mut reader: BufReader<OwnedReadHalf>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        files: Arc<StdMutex<BTreeSet<String>>>,
        behaviour: Arc<StdMutex<Behaviour>>,
    ) {
        while let Ok(Some(line)) = read_line(&mut reader).await {
            let Ok(message) = line.parse::<Message>() else {
                continue;
            };
            let current = behaviour.lock().unwrap().clone();

            let reply = match message {
                Message::List(_) => {
                    sleep(current.list_delay).await;
                    let held = files.lock().unwrap().iter().cloned().collect();
                    Some(Message::List(held))
                }
                Message::Remove(name) if current.answer_removes => {
                    if files.lock().unwrap().remove(&name) {
                        Some(Message::RemoveAck(name))
                    } else {
                        Some(Message::Error {
                            code: replistore::network::ErrorCode::FileDoesNotExist,
                            file: Some(name),
                        })
                    }
                }
                Message::Rebalance(instruction) => {
                    let mut held = files.lock().unwrap();
                    for name in &instruction.to_remove {
                        held.remove(name);
                    }
                    Some(Message::RebalanceComplete)
                }
                _ => None,
            };

            if let Some(reply) = reply {
                let line = format!("{}\n", reply);
                if writer.lock().await.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Pretends a client upload of `name` finished here.
    pub async fn ack_store(&self, name: &str) {
        self.files.lock().unwrap().insert(name.to_string());
        let line = format!("{}\n", Message::StoreAck(name.to_string()));
        self.writer.lock().await.write_all(line.as_bytes()).await.unwrap();
    }

    pub fn files(&self) -> BTreeSet<String> {
        self.files.lock().unwrap().clone()
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.behaviour.lock().unwrap().list_delay = delay;
    }

    /// With `false` the node silently ignores REMOVE.
    pub fn answer_removes(&self, answer: bool) {
        self.behaviour.lock().unwrap().answer_removes = answer;
    }

    /// Drops the controller connection.
    pub async fn kill(self) {
        self.task.abort();
        let _ = self.task.await;
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Ports named in a `STORE_TO` reply.
pub fn store_targets(reply: &str) -> Vec<NodeId> {
    match reply.parse::<Message>() {
        Ok(Message::StoreTo(nodes)) => nodes,
        _ => panic!("expected STORE_TO, got {:?}", reply),
    }
}

/// Stores `name` through `client`, acknowledging from every chosen fake.
pub async fn store_with_fakes(client: &mut Line, fakes: &[&FakeDstore], name: &str, size: u64) -> Vec<NodeId> {
    let chosen = store_targets(&client.request(&format!("STORE {} {}", name, size)).await);
    for fake in fakes {
        if chosen.contains(&fake.id) {
            fake.ack_store(name).await;
        }
    }
    assert_eq!(client.recv().await, "STORE_COMPLETE");
    chosen
}
