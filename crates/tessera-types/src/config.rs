//! Rebalance engine configuration.
//!
//! The engine never reads live configuration: the caller takes a snapshot
//! at rebalance start and every worker captures that snapshot, so a
//! mid-rebalance config change cannot partially apply.

use std::time::Duration;

/// Snapshot of all tunables the rebalance engine consumes.
#[derive(Debug, Clone, Default)]
pub struct RebConfig {
    /// Erasure-coding parameters.
    pub ec: EcConf,
    /// Rebalance pacing and retry parameters.
    pub rebalance: RebalanceConf,
    /// Control-plane timeouts.
    pub timeout: TimeoutConf,
}

/// Erasure-coding parameters.
#[derive(Debug, Clone)]
pub struct EcConf {
    /// Objects processed concurrently per EC repair batch.
    pub batch_size: usize,
    /// Objects below this size are replicated instead of erasure coded.
    pub obj_size_limit: u64,
    /// Data slices per object.
    pub data_slices: u16,
    /// Parity slices per object.
    pub parity_slices: u16,
}

impl Default for EcConf {
    fn default() -> Self {
        Self {
            batch_size: 8,
            obj_size_limit: 262_144, // 256 KiB
            data_slices: 2,
            parity_slices: 1,
        }
    }
}

impl EcConf {
    /// True when an object of `size` bytes is replicated rather than encoded.
    pub fn is_replicated(&self, size: u64) -> bool {
        size < self.obj_size_limit
    }

    /// Validate the shard counts against the cluster size.
    ///
    /// `data + parity` fragments plus the full object must each land on a
    /// distinct target, so `data + parity <= cluster_size - 1`.
    pub fn validate(&self, cluster_size: usize) -> Result<(), String> {
        if self.data_slices == 0 {
            return Err("ec.data_slices must be at least 1".to_string());
        }
        let need = self.data_slices as usize + self.parity_slices as usize;
        if need + 1 > cluster_size {
            return Err(format!(
                "ec {}+{} needs at least {} targets, cluster has {}",
                self.data_slices,
                self.parity_slices,
                need + 1,
                cluster_size
            ));
        }
        Ok(())
    }
}

/// Rebalance pacing and retry parameters.
#[derive(Debug, Clone)]
pub struct RebalanceConf {
    /// Per-mountpath jogger parallelism; effective value is clamped to [1, 8].
    pub multiplier: usize,
    /// How long to keep retrying an unresponsive destination.
    pub dest_retry: Duration,
    /// How long the cluster must be quiet before a batch is considered done.
    pub quiesce: Duration,
}

impl Default for RebalanceConf {
    fn default() -> Self {
        Self {
            multiplier: 2,
            dest_retry: Duration::from_secs(120),
            quiesce: Duration::from_secs(10),
        }
    }
}

impl RebalanceConf {
    /// The multiplier with the [1, 8] clamp applied.
    pub fn effective_multiplier(&self) -> usize {
        self.multiplier.clamp(1, 8)
    }
}

/// Control-plane timeouts, named by role.
#[derive(Debug, Clone)]
pub struct TimeoutConf {
    /// Budget for one control-plane RPC; also the barrier polling interval.
    pub cplane_op: Duration,
    /// Retry spacing when a peer looks slow but alive.
    pub max_keepalive: Duration,
    /// Budget for establishing a stream connection.
    pub stream_connect: Duration,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            cplane_op: Duration::from_secs(2),
            max_keepalive: Duration::from_secs(5),
            stream_connect: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RebConfig::default();
        assert_eq!(cfg.ec.batch_size, 8);
        assert_eq!(cfg.ec.obj_size_limit, 262_144);
        assert_eq!(cfg.timeout.cplane_op, Duration::from_secs(2));
        assert_eq!(cfg.rebalance.quiesce, Duration::from_secs(10));
    }

    #[test]
    fn test_is_replicated_boundary() {
        let ec = EcConf::default();
        assert!(ec.is_replicated(ec.obj_size_limit - 1));
        assert!(!ec.is_replicated(ec.obj_size_limit));
    }

    #[test]
    fn test_validate_cluster_size() {
        let ec = EcConf {
            data_slices: 2,
            parity_slices: 1,
            ..EcConf::default()
        };
        assert!(ec.validate(4).is_ok());
        assert!(ec.validate(3).is_err());
    }

    #[test]
    fn test_validate_zero_data_slices() {
        let ec = EcConf {
            data_slices: 0,
            ..EcConf::default()
        };
        assert!(ec.validate(10).is_err());
    }

    #[test]
    fn test_multiplier_clamp() {
        let mut reb = RebalanceConf {
            multiplier: 0,
            ..RebalanceConf::default()
        };
        assert_eq!(reb.effective_multiplier(), 1);
        reb.multiplier = 64;
        assert_eq!(reb.effective_multiplier(), 8);
        reb.multiplier = 4;
        assert_eq!(reb.effective_multiplier(), 4);
    }
}
