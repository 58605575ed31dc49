//! Topology tracker — the set of workers currently considered live.
//!
//! The dispatcher does not detect failures. The transport/heartbeat layer
//! forwards joins and leaves verbatim; `join` and `leave` report whether
//! membership actually changed, which is what schedules a rebalance.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use loadgrid_core::WorkerId;

/// Live worker membership, kept in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    members: BTreeSet<WorkerId>,
    /// Members in the order users are dealt to them.
    ordered: Vec<WorkerId>,
}

impl Topology {
    /// Create a topology from an initial worker list. Duplicates collapse.
    pub fn new<I, S>(workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkerId>,
    {
        let members: BTreeSet<WorkerId> = workers.into_iter().map(Into::into).collect();
        let ordered = dispatch_order(&members);
        Self {
            members,
            ordered,
        }
    }

    /// Register a worker. Returns `false` if it was already tracked.
    pub fn join(&mut self, worker: &str) -> bool {
        if !self.members.insert(worker.to_string()) {
            debug!(%worker, "worker already tracked, ignoring join");
            return false;
        }
        self.ordered = dispatch_order(&self.members);
        info!(%worker, workers = self.members.len(), "worker joined");
        true
    }

    /// Remove a worker. Returns `false` if it was not tracked.
    pub fn leave(&mut self, worker: &str) -> bool {
        if !self.members.remove(worker) {
            debug!(%worker, "worker not tracked, ignoring leave");
            return false;
        }
        self.ordered = dispatch_order(&self.members);
        info!(%worker, workers = self.members.len(), "worker left");
        true
    }

    /// Workers in dispatch order.
    pub fn ordered(&self) -> &[WorkerId] {
        &self.ordered
    }

    pub fn contains(&self, worker: &str) -> bool {
        self.members.contains(worker)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Order workers so consecutive users land on different hosts.
///
/// Ids of the form `host_suffix` are grouped by host. Each worker gets its
/// index within its host (by id), and the final order is by that index,
/// then id: `h1_a, h2_a, h1_b, h2_b, ...`. Ids without `_` are their own
/// host.
fn dispatch_order(members: &BTreeSet<WorkerId>) -> Vec<WorkerId> {
    let mut per_host: HashMap<&str, usize> = HashMap::new();
    let mut indexed: Vec<(usize, &WorkerId)> = members
        .iter()
        .map(|id| {
            let host = id.split('_').next().unwrap_or(id.as_str());
            let slot = per_host.entry(host).or_insert(0);
            let index = *slot;
            *slot += 1;
            (index, id)
        })
        .collect();
    indexed.sort();
    indexed.into_iter().map(|(_, id)| id.clone()).collect()
}
