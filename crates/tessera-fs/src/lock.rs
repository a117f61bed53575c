//! Per-object name locks.
//!
//! Rebalance shares object access with foreground I/O. Writers take the
//! exclusive lock for an object's uname across the full metadata + data
//! mutation. Locks are sharded by uname hash; two distinct names in the
//! same shard serialize, which is harmless and keeps the table fixed-size.

use tessera_types::uname_shard;
use tokio::sync::{Mutex, MutexGuard};

const LOCK_SHARDS: usize = 64;

/// Sharded exclusive name locks.
pub struct NameLocker {
    shards: Vec<Mutex<()>>,
}

impl NameLocker {
    /// A locker with the default shard count.
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Take the exclusive lock for `uname`; released on guard drop.
    pub async fn exclusive(&self, uname: &str) -> MutexGuard<'_, ()> {
        self.shards[uname_shard(uname, LOCK_SHARDS - 1)].lock().await
    }
}

impl Default for NameLocker {
    fn default() -> Self {
        Self::new()
    }
}
