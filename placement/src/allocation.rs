use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use network::{NodeId, RebalanceInstruction};
use tracing::{debug, warn};

use crate::Allocation;

/// Acceptable per-node file count, `[floor(R*F/N), ceil(R*F/N)]`.
///
/// R is capped at N since a file can never have more holders than there are
/// nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBand {
    pub floor: usize,
    pub ceil: usize,
}

impl LoadBand {
    pub fn new(replication: usize, files: usize, nodes: usize) -> Self {
        if nodes == 0 {
            return Self { floor: 0, ceil: 0 };
        }
        let total = replication.min(nodes) * files;
        Self {
            floor: total / nodes,
            ceil: (total + nodes - 1) / nodes,
        }
    }

    pub fn contains(&self, load: usize) -> bool {
        self.floor <= load && load <= self.ceil
    }

    /// Whether a node at `load` can take one more file and stay in the band.
    fn admits(&self, load: usize) -> bool {
        load < self.floor || load < self.ceil
    }
}

/// Chooses `replication` distinct nodes for a new file.
///
/// `loads` are current replica counts per live node, `files` counts the new
/// file too. Nodes are ranked by ascending load (ties by id); nodes with room
/// under the band go first, then the least loaded of the rest fill any gap.
pub fn select_nodes(
    loads: &BTreeMap<NodeId, usize>,
    replication: usize,
    files: usize,
) -> Vec<NodeId> {
    let band = LoadBand::new(replication, files, loads.len());

    let mut ranked: Vec<(usize, NodeId)> = loads.iter().map(|(id, load)| (*load, *id)).collect();
    ranked.sort();

    let mut picked: Vec<NodeId> = ranked
        .iter()
        .filter(|(load, _)| band.admits(*load))
        .map(|(_, id)| *id)
        .take(replication)
        .collect();

    for (_, id) in &ranked {
        if picked.len() >= replication {
            break;
        }
        if !picked.contains(id) {
            debug!(node = %id, "no room left in load band, picking least loaded");
            picked.push(*id);
        }
    }

    picked
}

fn load_of(allocation: &Allocation, node: NodeId) -> usize {
    allocation.get(&node).map_or(0, BTreeSet::len)
}

/// Every node of `allocation` holds a file count inside the band for `files`
/// files at `replication`.
pub fn is_balanced(allocation: &Allocation, replication: usize, files: usize) -> bool {
    let band = LoadBand::new(replication, files, allocation.len());
    allocation.values().all(|held| band.contains(held.len()))
}

/// Every one of `files` is held by exactly `min(R, N)` nodes.
pub fn is_fully_replicated(
    allocation: &Allocation,
    files: &BTreeSet<String>,
    replication: usize,
) -> bool {
    let wanted = replication.min(allocation.len());
    files.iter().all(|file| {
        allocation.values().filter(|held| held.contains(file)).count() == wanted
    })
}

/// Computes where every file of `files` should live after this cycle.
///
/// Replication is first fixed per file (drop copies from the busiest holders,
/// add copies to the idlest non-holders). Files from the most loaded node are
/// then moved to the least loaded one until every node sits in the band or
/// `deadline` passes. Files with no holder in `current` cannot be copied and
/// are left out.
pub fn compute_target(
    current: &Allocation,
    files: &BTreeSet<String>,
    replication: usize,
    deadline: Instant,
) -> Allocation {
    let mut target: Allocation = current
        .iter()
        .map(|(node, held)| {
            let kept = held.iter().filter(|file| files.contains(*file)).cloned().collect();
            (*node, kept)
        })
        .collect();

    if target.is_empty() {
        return target;
    }
    let wanted = replication.min(target.len());

    let mut placed = 0;
    for file in files {
        let mut holders: BTreeSet<NodeId> = target
            .iter()
            .filter(|(_, held)| held.contains(file))
            .map(|(node, _)| *node)
            .collect();
        if holders.is_empty() {
            warn!(file = %file, "no holder left, cannot replicate");
            continue;
        }
        placed += 1;

        while holders.len() > wanted {
            let Some(busiest) = holders
                .iter()
                .copied()
                .max_by_key(|node| (load_of(&target, *node), std::cmp::Reverse(*node)))
            else {
                break;
            };
            holders.remove(&busiest);
            if let Some(held) = target.get_mut(&busiest) {
                held.remove(file);
            }
        }

        while holders.len() < wanted {
            let Some(idlest) = target
                .keys()
                .copied()
                .filter(|node| !holders.contains(node))
                .min_by_key(|node| (load_of(&target, *node), *node))
            else {
                break;
            };
            holders.insert(idlest);
            target.entry(idlest).or_default().insert(file.clone());
        }
    }

    let band = LoadBand::new(replication, placed, target.len());
    loop {
        let busiest = target
            .iter()
            .max_by_key(|(node, held)| (held.len(), std::cmp::Reverse(**node)))
            .map(|(node, held)| (*node, held.len()));
        let idlest = target
            .iter()
            .min_by_key(|(node, held)| (held.len(), **node))
            .map(|(node, held)| (*node, held.len()));
        let (Some((from, high)), Some((to, low))) = (busiest, idlest) else {
            break;
        };

        if band.contains(high) && band.contains(low) {
            break;
        }
        if Instant::now() >= deadline {
            warn!("target computation hit its deadline before reaching the load band");
            break;
        }

        let movable = target.get(&from).and_then(|from_files| {
            let to_files = target.get(&to)?;
            from_files.iter().find(|file| !to_files.contains(*file)).cloned()
        });
        let Some(file) = movable else {
            break;
        };

        if let Some(held) = target.get_mut(&from) {
            held.remove(&file);
        }
        target.entry(to).or_default().insert(file);
    }

    target
}

/// Diffs `current` against `target` into one REBALANCE payload per node that
/// has something to do.
///
/// Each copy is sourced from a node that currently holds the file, spreading
/// sends so the holder with the fewest assigned transfers is used first.
pub fn plan_instructions(
    current: &Allocation,
    target: &Allocation,
) -> BTreeMap<NodeId, RebalanceInstruction> {
    let empty = BTreeSet::new();
    let nodes: BTreeSet<NodeId> = current.keys().chain(target.keys()).copied().collect();

    let mut sends: BTreeMap<NodeId, BTreeMap<String, Vec<NodeId>>> = BTreeMap::new();
    let mut send_counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut removals: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();

    for node in &nodes {
        let has = current.get(node).unwrap_or(&empty);
        let wants = target.get(node).unwrap_or(&empty);

        for file in wants.difference(has) {
            let source = current
                .iter()
                .filter(|(holder, held)| *holder != node && held.contains(file))
                .map(|(holder, _)| *holder)
                .min_by_key(|holder| (send_counts.get(holder).copied().unwrap_or(0), *holder));

            match source {
                Some(source) => {
                    *send_counts.entry(source).or_default() += 1;
                    sends
                        .entry(source)
                        .or_default()
                        .entry(file.clone())
                        .or_default()
                        .push(*node);
                }
                None => {
                    warn!(file = %file, node = %node, "no source holds file, skipping copy");
                }
            }
        }

        let dropped: Vec<String> = has.difference(wants).cloned().collect();
        if !dropped.is_empty() {
            removals.insert(*node, dropped);
        }
    }

    let mut instructions: BTreeMap<NodeId, RebalanceInstruction> = BTreeMap::new();
    for (node, files) in sends {
        instructions.entry(node).or_default().to_send = files.into_iter().collect();
    }
    for (node, files) in removals {
        instructions.entry(node).or_default().to_remove = files;
    }
    instructions.retain(|_, instruction| !instruction.is_empty());
    instructions
}
