//! TOML configuration for the Tessera daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tessera_types::{Bucket, EcConf, RebConfig, RebalanceConf, TimeoutConf};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node identity and filesystem layout.
    pub node: NodeSection,
    /// Static cluster membership.
    pub cluster: ClusterSection,
    /// Erasure coding parameters.
    pub ec: EcSection,
    /// Rebalance pacing.
    pub rebalance: RebalanceSection,
    /// Control-plane timeouts.
    pub timeout: TimeoutSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Daemon identifier, unique across the cluster.
    pub id: String,
    /// Mountpath roots, one per dedicated filesystem.
    pub mountpaths: Vec<PathBuf>,
    /// Directory for persistent markers.
    pub conf_dir: PathBuf,
    /// Listen address for the data/ack stream bundles.
    pub data_listen: SocketAddr,
    /// Listen address for the control plane.
    pub ctrl_listen: SocketAddr,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "t0".to_string(),
            mountpaths: vec![PathBuf::from("/data/tessera/mp1")],
            conf_dir: PathBuf::from("/etc/tessera"),
            data_listen: "0.0.0.0:7810".parse().expect("static addr"),
            ctrl_listen: "0.0.0.0:7811".parse().expect("static addr"),
        }
    }
}

/// One peer entry in `[[cluster.targets]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    /// Peer daemon id.
    pub id: String,
    /// Peer data/ack listen address.
    pub data_addr: SocketAddr,
    /// Peer control address.
    pub ctrl_addr: SocketAddr,
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Version of this membership description.
    pub smap_version: u64,
    /// Every target in the cluster, this node included.
    pub targets: Vec<TargetEntry>,
}

/// `[ec]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EcSection {
    /// Objects per repair batch.
    pub batch_size: usize,
    /// Below this size objects are replicated, not encoded.
    pub obj_size_limit: u64,
    /// Data slices per object.
    pub data_slices: u16,
    /// Parity slices per object.
    pub parity_slices: u16,
    /// EC-enabled bucket names (native provider).
    pub buckets: Vec<String>,
}

impl Default for EcSection {
    fn default() -> Self {
        let d = EcConf::default();
        Self {
            batch_size: d.batch_size,
            obj_size_limit: d.obj_size_limit,
            data_slices: d.data_slices,
            parity_slices: d.parity_slices,
            buckets: Vec::new(),
        }
    }
}

/// `[rebalance]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RebalanceSection {
    /// Per-mountpath jogger parallelism (clamped to [1, 8]).
    pub multiplier: usize,
    /// Seconds to keep retrying an unresponsive destination.
    pub dest_retry_secs: u64,
    /// Seconds of cluster quiet that end a repair batch.
    pub quiesce_secs: u64,
}

impl Default for RebalanceSection {
    fn default() -> Self {
        let d = RebalanceConf::default();
        Self {
            multiplier: d.multiplier,
            dest_retry_secs: d.dest_retry.as_secs(),
            quiesce_secs: d.quiesce.as_secs(),
        }
    }
}

/// `[timeout]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// Milliseconds per control-plane RPC.
    pub cplane_op_ms: u64,
    /// Milliseconds between keepalive retries.
    pub max_keepalive_ms: u64,
    /// Seconds to establish a stream connection.
    pub stream_connect_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        let d = TimeoutConf::default();
        Self {
            cplane_op_ms: d.cplane_op.as_millis() as u64,
            max_keepalive_ms: d.max_keepalive.as_millis() as u64,
            stream_connect_secs: d.stream_connect.as_secs(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a TOML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string (used in tests).
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(s)?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.node.mountpaths.is_empty() {
            anyhow::bail!("node.mountpaths must not be empty");
        }
        if !self.cluster.targets.is_empty() {
            if !self.cluster.targets.iter().any(|t| t.id == self.node.id) {
                anyhow::bail!("cluster.targets must include the local node {}", self.node.id);
            }
            self.reb_config()
                .ec
                .validate(self.cluster.targets.len())
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        Ok(())
    }

    /// The engine configuration snapshot this TOML describes.
    pub fn reb_config(&self) -> RebConfig {
        RebConfig {
            ec: EcConf {
                batch_size: self.ec.batch_size,
                obj_size_limit: self.ec.obj_size_limit,
                data_slices: self.ec.data_slices,
                parity_slices: self.ec.parity_slices,
            },
            rebalance: RebalanceConf {
                multiplier: self.rebalance.multiplier,
                dest_retry: Duration::from_secs(self.rebalance.dest_retry_secs),
                quiesce: Duration::from_secs(self.rebalance.quiesce_secs),
            },
            timeout: TimeoutConf {
                cplane_op: Duration::from_millis(self.timeout.cplane_op_ms),
                max_keepalive: Duration::from_millis(self.timeout.max_keepalive_ms),
                stream_connect: Duration::from_secs(self.timeout.stream_connect_secs),
            },
        }
    }

    /// EC-enabled buckets, as the engine expects them.
    pub fn ec_buckets(&self) -> Vec<Bucket> {
        self.ec.buckets.iter().map(Bucket::ais).collect()
    }
}
