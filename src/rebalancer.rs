use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use network::{Message, NodeId, NodeRegistry, RebalanceInstruction, StorageNode};
use placement::{
    compute_target, is_balanced, is_fully_replicated, plan_instructions, Allocation, FileStatus,
    FileTable,
};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Deadline of the next periodic rebalance.
#[derive(Debug)]
pub struct RebalanceTimer {
    period: Duration,
    deadline: Instant,
}

impl RebalanceTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: Instant::now() + period,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.period;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub responders: usize,
    pub lost: Vec<String>,
    pub instructed: usize,
    pub completed: usize,
}

/// Runs a single rebalance pass over the given registry and file table.
///
/// The caller is expected to hold the request gate closed for the duration.
pub struct Rebalancer<'a> {
    registry: &'a NodeRegistry,
    files: &'a RwLock<FileTable>,
    replication: usize,
    timeout: Duration,
}

impl<'a> Rebalancer<'a> {
    pub fn new(
        registry: &'a NodeRegistry,
        files: &'a RwLock<FileTable>,
        replication: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            files,
            replication,
            timeout,
        }
    }

    pub async fn run(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let nodes = self.registry.live_nodes().await;
        if nodes.is_empty() {
            debug!("no storage nodes, nothing to rebalance");
            return report;
        }

        let current = self.collect_listings(&nodes).await;
        report.responders = current.len();

        let reconciliation = self.files.write().await.reconcile(&current);
        for file in &reconciliation.lost {
            warn!(file = %file, "no storage node holds file any more, dropping it");
        }
        report.lost = reconciliation.lost.clone();

        if current.len() < self.replication {
            warn!(
                "only {} storage nodes answered LIST, {} needed; skipping redistribution",
                current.len(),
                self.replication
            );
            return report;
        }

        let stored = &reconciliation.stored;
        let files = &reconciliation.files;
        let mut target = if is_balanced(stored, self.replication, files.len())
            && is_fully_replicated(stored, files, self.replication)
        {
            debug!("placement already within band");
            stored.clone()
        } else {
            let deadline = std::time::Instant::now() + self.timeout;
            compute_target(stored, files, self.replication, deadline)
        };
        for (node, pending) in reconciliation.preserved {
            target.entry(node).or_default().extend(pending);
        }

        let plan = plan_instructions(&current, &target);
        if plan.is_empty() {
            debug!("no transfers or deletions needed");
            return report;
        }
        report.instructed = plan.len();

        let acked = self.deliver(&nodes, &plan).await;
        report.completed = acked.len();
        self.apply(&plan, &acked).await;

        report
    }

    /// Asks every node for its file list. Nodes that do not answer in time
    /// are left out of the returned allocation.
    ///
    /// Before asking, each inbox is cleared of everything no running store or
    /// remove can still be waiting for.
    async fn collect_listings(&self, nodes: &[Arc<StorageNode>]) -> Allocation {
        let awaited: BTreeSet<String> = self
            .files
            .read()
            .await
            .iter()
            .filter(|record| {
                matches!(
                    record.status(),
                    FileStatus::StoreInProgress | FileStatus::RemoveInProgress
                )
            })
            .map(|record| record.filename().to_string())
            .collect();
        let awaited = &awaited;

        let rounds = nodes.iter().map(|node| async move {
            let dropped = node.discard(|message| is_stale(message, awaited)).await;
            if dropped > 0 {
                debug!(node = %node.id(), "dropped {} stale replies", dropped);
            }
            let reply = node
                .send_and_expect(&Message::List(Vec::new()), |m| matches!(m, Message::List(_)), self.timeout)
                .await;
            (node.id(), reply)
        });

        let mut current = Allocation::new();
        for (id, reply) in join_all(rounds).await {
            match reply {
                Ok(Some(Message::List(files))) => {
                    current.insert(id, files.into_iter().collect());
                }
                Ok(_) => warn!(node = %id, "LIST timed out, excluding node from this cycle"),
                Err(e) => warn!(node = %id, "LIST failed: {}", e),
            }
        }
        current
    }

    async fn deliver(
        &self,
        nodes: &[Arc<StorageNode>],
        plan: &BTreeMap<NodeId, RebalanceInstruction>,
    ) -> BTreeSet<NodeId> {
        let rounds = plan.iter().map(|(id, instruction)| async move {
            let Some(node) = nodes.iter().find(|node| node.id() == *id) else {
                return (*id, false);
            };
            node.discard(|message| *message == Message::RebalanceComplete).await;

            let command = Message::Rebalance(instruction.clone());
            let reply = node
                .send_and_expect(&command, |m| *m == Message::RebalanceComplete, self.timeout)
                .await;
            match reply {
                Ok(Some(_)) => (*id, true),
                Ok(None) => {
                    warn!(node = %id, "no REBALANCE_COMPLETE within timeout");
                    (*id, false)
                }
                Err(e) => {
                    warn!(node = %id, "REBALANCE failed: {}", e);
                    (*id, false)
                }
            }
        });

        join_all(rounds)
            .await
            .into_iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| id)
            .collect()
    }

    /// Folds acknowledged instructions into the replica sets: a sender's ack
    /// vouches for its receivers, a node's ack for its own deletions.
    async fn apply(&self, plan: &BTreeMap<NodeId, RebalanceInstruction>, acked: &BTreeSet<NodeId>) {
        let mut files = self.files.write().await;

        for (id, instruction) in plan.iter().filter(|(id, _)| acked.contains(*id)) {
            for (name, receivers) in &instruction.to_send {
                if let Some(record) = files.get_mut(name) {
                    for receiver in receivers {
                        record.add_replica(*receiver);
                    }
                }
            }
            for name in &instruction.to_remove {
                if let Some(record) = files.get_mut(name) {
                    record.remove_replica(*id);
                }
            }
        }

        let finished: Vec<String> = files
            .iter()
            .filter(|record| {
                matches!(
                    record.status(),
                    FileStatus::RemoveInProgress | FileStatus::RemoveComplete
                ) && record.replicas().is_empty()
            })
            .map(|record| record.filename().to_string())
            .collect();
        for name in finished {
            info!(file = %name, "removal finished during rebalance");
            files.remove(&name);
        }
    }
}

/// Replies nobody is waiting for: acknowledgements for files with no store
/// or remove in flight, and anything unsolicited.
fn is_stale(message: &Message, awaited: &BTreeSet<String>) -> bool {
    match message {
        Message::StoreAck(file)
        | Message::RemoveAck(file)
        | Message::Error {
            file: Some(file), ..
        } => !awaited.contains(file),
        _ => true,
    }
}
