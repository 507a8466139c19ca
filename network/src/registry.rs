use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::node::StorageNode;
use crate::NodeId;

/// Node id -> handle for every storage node that has joined and not yet been
/// evicted by the liveness sweep.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, Arc<StorageNode>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node`, returning the handle it replaced when the same id
    /// joins twice.
    pub async fn register(&self, node: Arc<StorageNode>) -> Option<Arc<StorageNode>> {
        let mut nodes = self.nodes.write().await;
        let previous = nodes.insert(node.id(), node);
        debug!("registry now holds {} storage nodes", nodes.len());
        previous
    }

    pub async fn get(&self, id: NodeId) -> Option<Arc<StorageNode>> {
        self.nodes.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn live_count(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.is_connected())
            .count()
    }

    pub async fn live_ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.is_connected())
            .map(|node| node.id())
            .collect()
    }

    /// Handles of connected nodes, in ascending id order.
    pub async fn live_nodes(&self) -> Vec<Arc<StorageNode>> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|node| node.is_connected())
            .cloned()
            .collect()
    }

    /// Removes every handle whose connection has gone away and returns their ids.
    pub async fn evict_dead(&self) -> Vec<NodeId> {
        let mut nodes = self.nodes.write().await;
        let dead: Vec<NodeId> = nodes
            .values()
            .filter(|node| !node.is_connected())
            .map(|node| node.id())
            .collect();

        for id in &dead {
            nodes.remove(id);
            warn!(node = %id, "evicted dead storage node");
        }

        dead
    }
}
