//! Cluster map (smap) snapshots.
//!
//! Smap ownership and gossip live outside this workspace; the engine only
//! consumes versioned, immutable snapshots. [`SmapOwner`] is the handle the
//! node framework updates and every rebalance run captures one `Arc<Smap>`
//! from it at start, so a membership change mid-run can never partially
//! apply — it aborts the run instead.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tessera_placement::{hrw_main, hrw_order};
use tessera_types::TargetId;
use tracing::info;

/// One storage target as seen in the cluster map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNode {
    /// Daemon identifier.
    pub id: TargetId,
    /// Address of the data stream listener.
    pub data_addr: SocketAddr,
    /// Address of the control listener.
    pub ctrl_addr: SocketAddr,
}

/// An immutable, versioned view of cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smap {
    /// Monotonic map version; bumped by the (external) owner on any change.
    pub version: u64,
    /// All targets, keyed by id. BTreeMap keeps iteration deterministic.
    pub targets: BTreeMap<TargetId, TargetNode>,
}

impl Smap {
    /// An empty map at version 0.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            targets: BTreeMap::new(),
        }
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when the map holds no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Look up one target.
    pub fn get(&self, id: &TargetId) -> Option<&TargetNode> {
        self.targets.get(id)
    }

    /// All target ids, in id order.
    pub fn target_ids(&self) -> Vec<TargetId> {
        self.targets.keys().cloned().collect()
    }

    /// HRW order of targets for an object uname, truncated to `count`.
    pub fn hrw_targets(&self, uname: &str, count: usize) -> Vec<TargetId> {
        let mut order = hrw_order(&self.target_ids(), uname);
        order.truncate(count);
        order
    }

    /// The object's main target: head of the HRW order.
    pub fn main_target(&self, uname: &str) -> Option<TargetId> {
        hrw_main(&self.target_ids(), uname)
    }
}

/// Shared handle to the current cluster map.
pub struct SmapOwner {
    inner: RwLock<Arc<Smap>>,
}

impl SmapOwner {
    /// Start with the given map.
    pub fn new(smap: Smap) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Arc::new(smap)),
        })
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<Smap> {
        self.inner.read().expect("smap lock poisoned").clone()
    }

    /// Install a newer map. Older or equal versions are ignored.
    pub fn put(&self, smap: Smap) -> bool {
        let mut cur = self.inner.write().expect("smap lock poisoned");
        if smap.version <= cur.version {
            return false;
        }
        info!(version = smap.version, targets = smap.len(), "cluster map updated");
        *cur = Arc::new(smap);
        true
    }
}
