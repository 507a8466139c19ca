mod allocation;
mod index;

pub use allocation::{
    compute_target, is_balanced, is_fully_replicated, plan_instructions, select_nodes, LoadBand,
};
pub use index::{FileRecord, FileStatus, FileTable, Reconciliation};

use std::collections::{BTreeMap, BTreeSet};

use network::NodeId;

/// Node id -> filenames held (or to be held) by that node.
pub type Allocation = BTreeMap<NodeId, BTreeSet<String>>;

pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Invalid transition for {file}: {from:?} -> {to:?}")]
    InvalidTransition {
        file: String,
        from: FileStatus,
        to: FileStatus,
    },
}
