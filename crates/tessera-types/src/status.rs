//! Rebalance status reporting and transfer counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::stage::Stage;
use crate::TargetId;

/// Status of the local rebalance, returned on `rebstatus` control queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebStatus {
    /// Current stage of the local engine.
    pub stage: Stage,
    /// Current batch id (meaningful during EC batches).
    pub batch: u64,
    /// Version of the cluster map the node currently holds.
    pub smap_version: u64,
    /// Cluster map version this rebalance was started against.
    pub reb_version: u64,
    /// Monotonic id of the rebalance run.
    pub reb_id: u64,
    /// True once the run has been aborted.
    pub aborted: bool,
    /// True while the run is in progress.
    pub running: bool,
    /// Targets this node still awaits object ACKs from.
    pub ack_waiting: Vec<TargetId>,
    /// Objects and bytes moved since this run started.
    pub stats: RebStatsSnapshot,
}

impl Default for RebStatus {
    fn default() -> Self {
        Self {
            stage: Stage::Inactive,
            batch: 0,
            smap_version: 0,
            reb_version: 0,
            reb_id: 0,
            aborted: false,
            running: false,
            ack_waiting: Vec::new(),
            stats: RebStatsSnapshot::default(),
        }
    }
}

/// Point-in-time view of the transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebStatsSnapshot {
    /// Fragments and objects sent.
    pub tx_count: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Fragments and objects received.
    pub rx_count: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Checksum mismatches observed on received fragments.
    pub cksum_errors: u64,
}

impl RebStatsSnapshot {
    /// Delta of `self` relative to an earlier snapshot.
    pub fn delta_since(&self, begin: &RebStatsSnapshot) -> RebStatsSnapshot {
        RebStatsSnapshot {
            tx_count: self.tx_count - begin.tx_count,
            tx_bytes: self.tx_bytes - begin.tx_bytes,
            rx_count: self.rx_count - begin.rx_count,
            rx_bytes: self.rx_bytes - begin.rx_bytes,
            cksum_errors: self.cksum_errors - begin.cksum_errors,
        }
    }
}

/// Live transfer counters, updated from senders and receivers.
#[derive(Debug, Default)]
pub struct RebStats {
    tx_count: AtomicU64,
    tx_bytes: AtomicU64,
    rx_count: AtomicU64,
    rx_bytes: AtomicU64,
    cksum_errors: AtomicU64,
}

impl RebStats {
    /// Record one outbound transfer of `bytes`.
    pub fn add_tx(&self, bytes: u64) {
        self.tx_count.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one inbound transfer of `bytes`.
    pub fn add_rx(&self, bytes: u64) {
        self.rx_count.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a checksum mismatch on a received fragment.
    pub fn add_cksum_error(&self) {
        self.cksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> RebStatsSnapshot {
        RebStatsSnapshot {
            tx_count: self.tx_count.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_count: self.rx_count.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            cksum_errors: self.cksum_errors.load(Ordering::Relaxed),
        }
    }
}
