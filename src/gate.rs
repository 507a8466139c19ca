use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use network::{Message, NodeId};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::session::ClientSession;

/// Anything that may mutate the file table or the node registry.
pub enum Request {
    Client {
        session: Arc<ClientSession>,
        message: Message,
    },
    Join {
        node: NodeId,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Client { session, message } => f
                .debug_struct("Client")
                .field("session", &session.id())
                .field("message", message)
                .finish(),
            Request::Join { node, .. } => f.debug_struct("Join").field("node", node).finish(),
        }
    }
}

/// A request held back by a rebalance, replayed in arrival order afterwards.
pub struct Pending {
    request: Request,
    parked: Parked,
}

impl Pending {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_parts(self) -> (Request, Parked) {
        (self.request, self.parked)
    }
}

/// The connection waiting on a queued request.
pub struct Parked(oneshot::Sender<()>);

impl Parked {
    /// Lets the connection read its next line.
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

pub enum Admission {
    /// Run now; the guard keeps the request counted as in flight.
    Dispatch(Request, InFlight),
    /// Parked until the current rebalance ends and the request has been replayed.
    Queued(oneshot::Receiver<()>),
}

#[derive(Default)]
struct GateState {
    rebalancing: bool,
    queue: VecDeque<Pending>,
}

#[derive(Default)]
struct Counter {
    active: AtomicUsize,
    idle: Notify,
}

/// Decides, atomically with queueing, whether a request runs now or waits
/// for the rebalance in progress.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    counter: Arc<Counter>,
}

pub struct InFlight {
    counter: Arc<Counter>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.counter.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.idle.notify_waiters();
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(&self, request: Request) -> Admission {
        let mut state = self.state.lock().await;
        if state.rebalancing {
            let (done, replayed) = oneshot::channel();
            debug!("queueing {:?} behind rebalance", request);
            state.queue.push_back(Pending {
                request,
                parked: Parked(done),
            });
            return Admission::Queued(replayed);
        }

        self.counter.active.fetch_add(1, Ordering::SeqCst);
        Admission::Dispatch(
            request,
            InFlight {
                counter: Arc::clone(&self.counter),
            },
        )
    }

    /// Raises the rebalancing flag. Returns false if it was already raised.
    pub async fn begin(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.rebalancing {
            return false;
        }
        state.rebalancing = true;
        true
    }

    /// Waits until no admitted request is still running. Returns false if
    /// some were still running when `timeout` elapsed.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.counter.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.counter.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }

    /// Pops the oldest queued request. Once the queue is empty the flag is
    /// lowered under the same lock, so nothing can slip into the queue after
    /// the last replay.
    pub async fn next_pending(&self) -> Option<Pending> {
        let mut state = self.state.lock().await;
        let next = state.queue.pop_front();
        if next.is_none() {
            state.rebalancing = false;
        }
        next
    }

    pub async fn is_rebalancing(&self) -> bool {
        self.state.lock().await.rebalancing
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.counter.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn list_request() -> Request {
        let (writer, _reader) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        Request::Client {
            session: Arc::new(ClientSession::new(peer, writer)),
            message: Message::List(vec![]),
        }
    }

    #[tokio::test]
    async fn dispatches_when_idle() {
        let gate = Gate::new();
        match gate.admit(list_request()).await {
            Admission::Dispatch(_, guard) => {
                assert_eq!(gate.in_flight(), 1);
                drop(guard);
                assert_eq!(gate.in_flight(), 0);
            }
            Admission::Queued(_) => panic!("gate is not rebalancing"),
        }
    }

    #[tokio::test]
    async fn queues_in_order_during_rebalance() {
        let gate = Gate::new();
        assert!(gate.begin().await);
        assert!(!gate.begin().await);

        let first = gate.admit(list_request()).await;
        let second = gate.admit(list_request()).await;
        assert!(matches!(first, Admission::Queued(_)));
        assert!(matches!(second, Admission::Queued(_)));
        assert_eq!(gate.queued().await, 2);

        let replayed = gate.next_pending().await.unwrap();
        assert!(matches!(replayed.request(), Request::Client { .. }));
        let (_, parked) = replayed.into_parts();
        parked.release();
        if let Admission::Queued(parked) = first {
            parked.await.unwrap();
        }
        assert!(gate.is_rebalancing().await, "flag holds while the queue drains");

        let (_, parked) = gate.next_pending().await.unwrap().into_parts();
        parked.release();
        assert!(gate.next_pending().await.is_none());
        assert!(!gate.is_rebalancing().await);
        assert!(matches!(gate.admit(list_request()).await, Admission::Dispatch(..)));
    }

    #[tokio::test]
    async fn waits_for_in_flight_requests() {
        let gate = Arc::new(Gate::new());
        let Admission::Dispatch(_, guard) = gate.admit(list_request()).await else {
            panic!("expected dispatch");
        };
        gate.begin().await;

        assert!(!gate.wait_idle(Duration::from_millis(30)).await);

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(gate.wait_idle(Duration::from_secs(1)).await);
        releaser.await.unwrap();
    }
}
