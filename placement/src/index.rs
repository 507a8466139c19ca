use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use network::NodeId;
use serde::{Deserialize, Serialize};

use crate::{Allocation, PlacementError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
    RemoveComplete,
}

/// Controller-side record of one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    filename: String,
    size: u64,
    status: FileStatus,
    replicas: BTreeSet<NodeId>,
    created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
            status: FileStatus::StoreInProgress,
            replicas: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn replicas(&self) -> &BTreeSet<NodeId> {
        &self.replicas
    }

    /// Only completed stores are listed, loadable or removable.
    pub fn is_visible(&self) -> bool {
        self.status == FileStatus::StoreComplete
    }

    pub fn replica_at(&self, index: usize) -> Option<NodeId> {
        self.replicas.iter().nth(index).copied()
    }

    pub fn add_replica(&mut self, node: NodeId) -> bool {
        self.replicas.insert(node)
    }

    pub fn remove_replica(&mut self, node: NodeId) -> bool {
        self.replicas.remove(&node)
    }

    pub fn set_replicas(&mut self, replicas: BTreeSet<NodeId>) {
        self.replicas = replicas;
    }

    pub fn mark_store_complete(&mut self) -> Result<()> {
        self.transition(FileStatus::StoreInProgress, FileStatus::StoreComplete)
    }

    pub fn begin_remove(&mut self) -> Result<()> {
        self.transition(FileStatus::StoreComplete, FileStatus::RemoveInProgress)
    }

    pub fn mark_remove_complete(&mut self) -> Result<()> {
        self.transition(FileStatus::RemoveInProgress, FileStatus::RemoveComplete)
    }

    fn transition(&mut self, from: FileStatus, to: FileStatus) -> Result<()> {
        if self.status != from {
            return Err(PlacementError::InvalidTransition {
                file: self.filename.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// What a rebalance cycle learned after matching node listings against the
/// table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Completed files as actually held by the responding nodes.
    pub stored: Allocation,
    /// Completed files that still have at least one holder.
    pub files: BTreeSet<String>,
    /// Files of stores still in flight, left where they are.
    pub preserved: Allocation,
    /// Completed files no responding node holds; their records were dropped.
    pub lost: Vec<String>,
}

/// Filename -> record for everything the controller tracks.
#[derive(Debug, Default)]
pub struct FileTable {
    records: HashMap<String, FileRecord>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, filename: &str) -> Option<&FileRecord> {
        self.records.get(filename)
    }

    pub fn get_mut(&mut self, filename: &str) -> Option<&mut FileRecord> {
        self.records.get_mut(filename)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    /// Creates a `StoreInProgress` record unless the name is taken by a record
    /// that has not finished being removed.
    pub fn begin_store(&mut self, filename: &str, size: u64) -> Result<&mut FileRecord> {
        if let Some(existing) = self.records.get(filename) {
            if existing.status() != FileStatus::RemoveComplete {
                return Err(PlacementError::FileExists(filename.to_string()));
            }
        }

        let record = FileRecord::new(filename, size);
        self.records.insert(filename.to_string(), record);
        self.records
            .get_mut(filename)
            .ok_or_else(|| PlacementError::UnknownFile(filename.to_string()))
    }

    pub fn remove(&mut self, filename: &str) -> Option<FileRecord> {
        self.records.remove(filename)
    }

    /// Sorted names of every `StoreComplete` record.
    pub fn visible_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .values()
            .filter(|record| record.is_visible())
            .map(|record| record.filename().to_string())
            .collect();
        names.sort();
        names
    }

    /// Number of replicas each of `nodes` currently holds, zero included.
    pub fn node_loads(&self, nodes: &[NodeId]) -> BTreeMap<NodeId, usize> {
        let mut loads: BTreeMap<NodeId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
        for record in self.records.values() {
            for replica in record.replicas() {
                if let Some(load) = loads.get_mut(replica) {
                    *load += 1;
                }
            }
        }
        loads
    }

    /// Strips `node` from every replica set; records themselves are kept.
    pub fn purge_node(&mut self, node: NodeId) -> usize {
        self.records
            .values_mut()
            .map(|record| record.remove_replica(node))
            .filter(|removed| *removed)
            .count()
    }

    /// Resets replica sets to what `listings` says the responding nodes hold.
    ///
    /// Completed files nobody holds are dropped. Removals whose files are gone
    /// everywhere are finished. Stores in flight keep their record untouched.
    pub fn reconcile(&mut self, listings: &Allocation) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        let mut finished_removals = Vec::new();

        for record in self.records.values_mut() {
            let holders: BTreeSet<NodeId> = listings
                .iter()
                .filter(|(_, files)| files.contains(record.filename()))
                .map(|(node, _)| *node)
                .collect();

            match record.status() {
                FileStatus::StoreInProgress => {
                    for node in &holders {
                        outcome
                            .preserved
                            .entry(*node)
                            .or_default()
                            .insert(record.filename().to_string());
                    }
                }
                FileStatus::StoreComplete => {
                    if holders.is_empty() {
                        outcome.lost.push(record.filename().to_string());
                    } else {
                        outcome.files.insert(record.filename().to_string());
                        record.set_replicas(holders);
                    }
                }
                FileStatus::RemoveInProgress | FileStatus::RemoveComplete => {
                    if holders.is_empty() {
                        finished_removals.push(record.filename().to_string());
                    }
                    record.set_replicas(holders);
                }
            }
        }

        for name in outcome.lost.iter().chain(finished_removals.iter()) {
            self.records.remove(name);
        }

        for (node, files) in listings {
            let kept: BTreeSet<String> = files
                .iter()
                .filter(|file| outcome.files.contains(*file))
                .cloned()
                .collect();
            outcome.stored.insert(*node, kept);
        }

        outcome.lost.sort();
        outcome
    }
}
