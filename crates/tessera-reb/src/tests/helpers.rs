//! Shared harness: N managers wired through an in-process loopback router,
//! each with its own tempdir mountpaths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tessera_cluster::{Smap, SmapOwner, TargetNode};
use tessera_fs::{content_path, hrw_mountpath, ContentKind, Mountpath, NoopFsHealth};
use tessera_net::DataHdr;
use tessera_types::{
    xxhash_hex, Bucket, EcConf, EcMetadata, RebConfig, RebStatus, RebalanceConf, TargetId,
    TimeoutConf, CKSUM_XXHASH,
};

use crate::error::RebError;
use crate::manager::{RebManager, RebManagerArgs};
use crate::transport::{PeerClient, RebTransport};

// ---------------------------------------------------------------------------
// Loopback router
// ---------------------------------------------------------------------------

/// Routes frames and control requests straight into peer managers.
#[derive(Default)]
pub struct Loopback {
    mgrs: Mutex<HashMap<TargetId, Arc<RebManager>>>,
    down: Mutex<HashSet<TargetId>>,
    drop_acks: std::sync::atomic::AtomicBool,
}

impl Loopback {
    pub fn register(&self, id: TargetId, mgr: Arc<RebManager>) {
        self.mgrs.lock().unwrap().insert(id, mgr);
    }

    /// Swallow every ack frame (lossy-ack simulation).
    pub fn set_drop_acks(&self, drop: bool) {
        self.drop_acks
            .store(drop, std::sync::atomic::Ordering::SeqCst);
    }

    /// Simulate a crashed target: every path to it starts failing.
    #[allow(dead_code)]
    pub fn set_down(&self, id: &TargetId, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    fn route(&self, to: &TargetId) -> Result<Arc<RebManager>, RebError> {
        if self.down.lock().unwrap().contains(to) {
            return Err(RebError::Net(format!("{to} is down")));
        }
        self.mgrs
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| RebError::Net(format!("{to} not registered")))
    }
}

#[async_trait::async_trait]
impl RebTransport for Loopback {
    async fn send_data(
        &self,
        to: &TargetId,
        hdr: DataHdr,
        payload: Bytes,
    ) -> Result<(), RebError> {
        let mgr = self.route(to)?;
        mgr.recv_data(hdr, payload).await;
        Ok(())
    }

    async fn send_ack(&self, to: &TargetId, hdr: DataHdr) -> Result<(), RebError> {
        if self.drop_acks.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        let mgr = self.route(to)?;
        mgr.recv_ack(hdr).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerClient for Loopback {
    async fn reb_status(&self, to: &TargetId) -> Result<RebStatus, RebError> {
        Ok(self.route(to)?.status())
    }

    async fn head_object(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
    ) -> Result<bool, RebError> {
        Ok(self.route(to)?.head_object(bucket, obj_name).await)
    }

    async fn fetch_ct(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
        slice_id: u16,
    ) -> Result<Option<(EcMetadata, Bytes)>, RebError> {
        Ok(self.route(to)?.fetch_ct(bucket, obj_name, slice_id).await)
    }

    async fn fetch_namespace(&self, to: &TargetId) -> Result<Option<Bytes>, RebError> {
        Ok(self.route(to)?.namespace_payload())
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub id: TargetId,
    pub mgr: Arc<RebManager>,
    pub mpaths: Vec<Mountpath>,
    pub conf_dir: PathBuf,
    _dirs: Vec<TempDir>,
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub net: Arc<Loopback>,
    pub smap: Arc<Smap>,
}

/// Timeouts tuned so failure paths resolve in seconds, not minutes.
pub fn test_config(batch_size: usize) -> RebConfig {
    RebConfig {
        ec: EcConf {
            batch_size,
            obj_size_limit: 1024,
            data_slices: 2,
            parity_slices: 1,
        },
        rebalance: RebalanceConf {
            multiplier: 2,
            dest_retry: Duration::from_secs(5),
            quiesce: Duration::from_millis(300),
        },
        timeout: TimeoutConf {
            cplane_op: Duration::from_millis(50),
            max_keepalive: Duration::from_millis(100),
            stream_connect: Duration::from_secs(1),
        },
    }
}

pub async fn cluster(n: usize, config: RebConfig) -> TestCluster {
    let net = Arc::new(Loopback::default());

    let mut targets = BTreeMap::new();
    for i in 0..n {
        let id = TargetId::new(format!("t{i}"));
        targets.insert(
            id.clone(),
            TargetNode {
                id,
                data_addr: "127.0.0.1:0".parse().unwrap(),
                ctrl_addr: "127.0.0.1:0".parse().unwrap(),
            },
        );
    }
    let smap = Arc::new(Smap { version: 1, targets });

    let mut nodes = Vec::new();
    for i in 0..n {
        let id = TargetId::new(format!("t{i}"));
        let conf = TempDir::new().unwrap();
        let mp1 = TempDir::new().unwrap();
        let mp2 = TempDir::new().unwrap();
        let mpaths = vec![Mountpath::new(mp1.path()), Mountpath::new(mp2.path())];

        let mgr = RebManager::new(RebManagerArgs {
            local: id.clone(),
            mpaths: mpaths.clone(),
            conf_dir: conf.path().to_path_buf(),
            smap_owner: SmapOwner::new((*smap).clone()),
            transport: net.clone(),
            client: net.clone(),
            health: Arc::new(NoopFsHealth),
            config: config.clone(),
        });
        net.register(id.clone(), mgr.clone());

        nodes.push(TestNode {
            id,
            mgr,
            mpaths,
            conf_dir: conf.path().to_path_buf(),
            _dirs: vec![conf, mp1, mp2],
        });
    }

    TestCluster { nodes, net, smap }
}

impl TestCluster {
    pub fn node(&self, id: &TargetId) -> &TestNode {
        self.nodes.iter().find(|n| n.id == *id).unwrap()
    }

    /// HRW target order for an object, as the engine computes it.
    pub fn hrw_order(&self, bck: &Bucket, obj: &str) -> Vec<TargetId> {
        self.smap.hrw_targets(&bck.uname(obj), self.smap.len())
    }

    /// Run the rebalance on every node concurrently.
    pub async fn run_all(&self, buckets: &[Bucket]) -> Vec<Result<(), RebError>> {
        let mut handles = Vec::new();
        for node in &self.nodes {
            let mgr = node.mgr.clone();
            let buckets = buckets.to_vec();
            handles.push(tokio::spawn(async move {
                mgr.run_rebalance(&buckets).await
            }));
        }
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

}

// ---------------------------------------------------------------------------
// Seeding and inspection
// ---------------------------------------------------------------------------

/// Deterministic pseudo-random payload.
pub fn test_data(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.r#gen()).collect()
}

pub fn make_meta(data: &[u8], d: u16, p: u16, slice_id: u16) -> EcMetadata {
    EcMetadata {
        obj_size: data.len() as u64,
        data_slices: d,
        parity_slices: p,
        slice_id,
        obj_cksum: xxhash_hex(data),
        cksum_type: CKSUM_XXHASH.into(),
        obj_version: "1".into(),
    }
}

/// Write one fragment + its sidecar on a node, at the HRW-correct
/// mountpath.
pub async fn write_fragment(
    node: &TestNode,
    bck: &Bucket,
    obj: &str,
    meta: &EcMetadata,
    bytes: &[u8],
) {
    let uname = bck.uname(obj);
    let mpath = hrw_mountpath(&node.mpaths, &uname).unwrap().clone();
    write_fragment_on(&mpath, bck, obj, meta, bytes).await;
}

/// Write one fragment + its sidecar on an explicit mountpath (for
/// misplaced-fragment setups).
pub async fn write_fragment_on(
    mpath: &Mountpath,
    bck: &Bucket,
    obj: &str,
    meta: &EcMetadata,
    bytes: &[u8],
) {
    let kind = if meta.slice_id == 0 {
        ContentKind::Object
    } else {
        ContentKind::Slice
    };

    let frag = content_path(mpath, kind, bck, obj);
    tokio::fs::create_dir_all(frag.parent().unwrap()).await.unwrap();
    tokio::fs::write(&frag, bytes).await.unwrap();

    let meta_path = content_path(mpath, ContentKind::Metadata, bck, obj);
    tokio::fs::create_dir_all(meta_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&meta_path, serde_json::to_vec(meta).unwrap())
        .await
        .unwrap();
}

/// Write a plain (non-EC) object on a node at the given mountpath index.
pub async fn write_plain_object(node: &TestNode, mpath_idx: usize, bck: &Bucket, obj: &str, bytes: &[u8]) {
    let path = content_path(&node.mpaths[mpath_idx], ContentKind::Object, bck, obj);
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, bytes).await.unwrap();
}

/// The node's HRW mountpath index for an object.
pub fn hrw_mpath_idx(node: &TestNode, uname: &str) -> usize {
    let m = hrw_mountpath(&node.mpaths, uname).unwrap();
    node.mpaths.iter().position(|p| p.label() == m.label()).unwrap()
}

/// Encode an object and place every fragment where HRW wants it:
/// full object on main, slice `i` on the `i`-th non-main HRW target.
///
/// Returns the HRW target order.
pub async fn put_ec_object(
    cluster: &TestCluster,
    bck: &Bucket,
    obj: &str,
    data: &[u8],
    d: u16,
    p: u16,
) -> Vec<TargetId> {
    let order = cluster.hrw_order(bck, obj);
    assert!(order.len() >= (d + p) as usize + 1, "cluster too small");

    let full_meta = make_meta(data, d, p, 0);
    write_fragment(cluster.node(&order[0]), bck, obj, &full_meta, data).await;

    let slices = tessera_erasure::encode(data, d as usize, p as usize).unwrap();
    for (i, slice) in slices.iter().enumerate() {
        let meta = make_meta(data, d, p, (i + 1) as u16);
        write_fragment(cluster.node(&order[i + 1]), bck, obj, &meta, slice).await;
    }
    order
}

/// Place a replicated (below the EC size threshold) object: one copy on
/// each of the first `p + 1` HRW targets.
pub async fn put_replicated_object(
    cluster: &TestCluster,
    bck: &Bucket,
    obj: &str,
    data: &[u8],
    p: u16,
) -> Vec<TargetId> {
    let order = cluster.hrw_order(bck, obj);
    let meta = make_meta(data, 0, p, 0);
    for tid in order.iter().take(p as usize + 1) {
        write_fragment(cluster.node(tid), bck, obj, &meta, data).await;
    }
    order
}

/// Read a fragment from any of the node's mountpaths.
pub async fn read_fragment(
    node: &TestNode,
    bck: &Bucket,
    obj: &str,
    kind: ContentKind,
) -> Option<Vec<u8>> {
    for mpath in &node.mpaths {
        let path = content_path(mpath, kind, bck, obj);
        if let Ok(data) = tokio::fs::read(&path).await {
            return Some(data);
        }
    }
    None
}

/// Delete a fragment (and optionally its sidecar) wherever it sits.
pub async fn delete_fragment(
    node: &TestNode,
    bck: &Bucket,
    obj: &str,
    kind: ContentKind,
    with_meta: bool,
) {
    for mpath in &node.mpaths {
        let path = content_path(mpath, kind, bck, obj);
        let _ = tokio::fs::remove_file(&path).await;
        if with_meta {
            let meta = content_path(mpath, ContentKind::Metadata, bck, obj);
            let _ = tokio::fs::remove_file(&meta).await;
        }
    }
}

/// Digest of every file under the node's mountpaths: `relpath -> hash`.
pub async fn tree_digest(node: &TestNode) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for mpath in &node.mpaths {
        for file in tessera_fs::walk_files(mpath.path()).await.unwrap() {
            let rel = file.strip_prefix(mpath.path()).unwrap();
            let key = format!("{}:{}", mpath.label(), rel.to_string_lossy());
            let data = tokio::fs::read(&file).await.unwrap();
            out.insert(key, xxhash_hex(&data));
        }
    }
    out
}

/// Assert the cluster holds a correct EC layout for the object: the full
/// object on main, and each slice id on exactly one distinct target.
pub async fn assert_ec_layout(
    cluster: &TestCluster,
    bck: &Bucket,
    obj: &str,
    data: &[u8],
    d: u16,
    p: u16,
) {
    let order = cluster.hrw_order(bck, obj);
    let main = cluster.node(&order[0]);
    let full = read_fragment(main, bck, obj, ContentKind::Object)
        .await
        .expect("main must hold the full object");
    assert_eq!(full, data, "full object bytes must match");

    let expected = tessera_erasure::encode(data, d as usize, p as usize).unwrap();
    let mut holders: HashMap<u16, Vec<TargetId>> = HashMap::new();
    for node in &cluster.nodes {
        if let Some(bytes) = read_fragment(node, bck, obj, ContentKind::Slice).await {
            let meta_path = node
                .mpaths
                .iter()
                .map(|m| content_path(m, ContentKind::Metadata, bck, obj))
                .find(|p| p.exists())
                .expect("slice without sidecar");
            let meta: EcMetadata =
                serde_json::from_slice(&tokio::fs::read(&meta_path).await.unwrap()).unwrap();
            assert!(meta.slice_id >= 1 && meta.slice_id <= d + p);
            assert_eq!(
                bytes,
                expected[(meta.slice_id - 1) as usize].to_vec(),
                "slice {} bytes must match the canonical encoding",
                meta.slice_id
            );
            holders.entry(meta.slice_id).or_default().push(node.id.clone());
        }
    }

    for sid in 1..=(d + p) {
        let h = holders.get(&sid).map(|v| v.len()).unwrap_or(0);
        assert_eq!(h, 1, "slice {sid} must live on exactly one target");
    }
}
