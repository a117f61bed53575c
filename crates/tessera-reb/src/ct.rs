//! Content fragments, object aggregates and ACK bookkeeping.
//!
//! A [`CtRecord`] describes one EC artifact on some target and is what
//! travels in the namespace exchange. [`RebCt`] wraps a record with the
//! local-only context (paths, parsed metadata). [`RebObject`] aggregates
//! every fragment reported cluster-wide for one object together with the
//! placement facts derived from HRW.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_fs::Mountpath;
use tessera_types::{Bucket, EcMetadata, TargetId};

// ---------------------------------------------------------------------------
// Object readiness
// ---------------------------------------------------------------------------

/// Not enough fragments received to act on the object.
pub const OBJ_WAITING: u8 = 0;
/// Enough fragments received; reconstruction may start.
pub const OBJ_RECEIVED: u8 = 1;
/// Nothing more to do for this object on this target.
pub const OBJ_DONE: u8 = 2;

// ---------------------------------------------------------------------------
// Content fragments
// ---------------------------------------------------------------------------

/// One EC artifact on some target, as exchanged between peers.
///
/// Sufficient for any receiver to decide placement and repair actions; the
/// sender's local paths never travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtRecord {
    /// Bucket the object lives in.
    pub bucket: Bucket,
    /// Object name.
    pub obj_name: String,
    /// The target holding this fragment.
    pub daemon_id: TargetId,
    /// Content digest of the full object; groups fragments into versions.
    pub obj_hash: String,
    /// Full object size in bytes.
    pub obj_size: u64,
    /// 0 = full object/replica, >=1 = data or parity slice.
    pub slice_id: u16,
    /// Data slice count encoded in the fragment's metadata.
    pub data_slices: u16,
    /// Parity slice count encoded in the fragment's metadata.
    pub parity_slices: u16,
}

impl CtRecord {
    /// Canonical uname of the object this fragment belongs to.
    pub fn uname(&self) -> String {
        self.bucket.uname(&self.obj_name)
    }
}

/// A fragment with its local context attached.
///
/// For fragments discovered by the local walker, `real_path` is where the
/// fragment actually is and `hrw_path` where HRW says it should be; both
/// are `None` for fragments reported by peers.
#[derive(Debug, Clone)]
pub struct RebCt {
    /// The exchanged record.
    pub rec: CtRecord,
    /// Actual fragment location on local disk.
    pub real_path: Option<PathBuf>,
    /// HRW-correct fragment location on local disk.
    pub hrw_path: Option<PathBuf>,
    /// Mountpath the fragment was found on.
    pub src_mpath: Option<Mountpath>,
    /// Parsed metadata sidecar (local fragments only, until a push arrives).
    pub meta: Option<EcMetadata>,
}

impl RebCt {
    /// A fragment known only from a peer's report.
    pub fn remote(rec: CtRecord) -> Self {
        Self {
            rec,
            real_path: None,
            hrw_path: None,
            src_mpath: None,
            meta: None,
        }
    }

    /// True when the fragment sits on the wrong local path.
    pub fn is_misplaced(&self) -> bool {
        match (&self.real_path, &self.hrw_path) {
            (Some(real), Some(hrw)) => real != hrw,
            _ => false,
        }
    }

    /// The path to read when sending this fragment from disk.
    ///
    /// Local resilvering runs before repair, so the HRW location wins when
    /// known.
    pub fn send_path(&self) -> Option<&PathBuf> {
        self.hrw_path.as_ref().or(self.real_path.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Object aggregates
// ---------------------------------------------------------------------------

/// Fragments of one object grouped by content hash, pre-classification.
#[derive(Debug)]
pub struct ObjDraft {
    /// Bucket the object lives in.
    pub bucket: Bucket,
    /// Object name.
    pub obj_name: String,
    /// The object's HRW main target.
    pub main_daemon: TargetId,
    /// Fragments grouped by content hash.
    pub groups: BTreeMap<String, Vec<RebCt>>,
}

impl ObjDraft {
    /// The newest fragment group: largest cardinality wins, ties go to the
    /// lexicographically smaller hash.
    ///
    /// Cardinality is a heuristic — a replicated overwrite of an EC'ed
    /// object can briefly produce fewer fragments than the stale version.
    /// Proper EC versioning would subsume this.
    pub fn newest(&self) -> &[RebCt] {
        let mut best: Option<&Vec<RebCt>> = None;
        for cts in self.groups.values() {
            // BTreeMap iterates hashes ascending, so `>` keeps the smaller
            // hash on ties.
            if best.map_or(true, |b| cts.len() > b.len()) {
                best = Some(cts);
            }
        }
        best.map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// One slot of an object's cluster-wide fragment table: the fragment a
/// given target contributes, plus the payload received from it (if any).
#[derive(Debug)]
pub struct CtSlot {
    /// The fragment.
    pub ct: RebCt,
    /// Received payload, attached by the data receiver.
    pub buf: Option<Bytes>,
}

/// The mutable per-object fragment table, guarded by the object's lock.
#[derive(Debug, Default)]
pub struct LocCt {
    /// Unique fragment per contributing target.
    pub by_daemon: HashMap<TargetId, CtSlot>,
}

impl LocCt {
    /// How many slots have a non-empty received payload.
    pub fn buffered(&self) -> usize {
        self.by_daemon
            .values()
            .filter(|s| s.buf.as_ref().is_some_and(|b| !b.is_empty()))
            .count()
    }
}

/// Cluster-wide aggregate of one object, with derived placement facts.
#[derive(Debug)]
pub struct RebObject {
    /// Bucket the object lives in.
    pub bucket: Bucket,
    /// Object name.
    pub obj_name: String,
    /// Canonical uname; every fragment of the object shares it.
    pub uid: String,
    /// Full object size.
    pub obj_size: u64,
    /// Size of one slice.
    pub slice_size: usize,
    /// Data slice count.
    pub data_slices: u16,
    /// Parity slice count.
    pub parity_slices: u16,
    /// Replicated rather than erasure coded (below the size threshold).
    pub is_ec_copy: bool,
    /// The object's HRW main target.
    pub main_daemon: TargetId,
    /// Targets that should host a fragment, in HRW order.
    pub hrw_targets: Vec<TargetId>,
    /// The unique target responsible for pushing a replica, if any.
    pub sender: Option<TargetId>,
    /// Main target holds some fragment.
    pub main_has_any: bool,
    /// Slice id of the fragment on main (meaningful with `main_has_any`).
    pub main_slice_id: u16,
    /// The local target holds some fragment.
    pub has_ct: bool,
    /// The local target is the main target.
    pub is_main: bool,
    /// HRW expects the local target to hold a fragment.
    pub in_hrw_list: bool,
    /// Some target holds the full object.
    pub full_obj_found: bool,
    /// All `data + parity` slices existed before the rebalance.
    pub has_all_slices: bool,
    /// Fragments found cluster-wide (one per contributing target).
    pub found_ct: usize,
    /// Presence bitmap indexed by slice id.
    pub ct_exist: Vec<bool>,
    /// Readiness state; use the accessors, not the field.
    pub ready: AtomicU8,
    /// Fragment table; also serializes payload attach and reconstruction.
    pub loc: tokio::sync::Mutex<LocCt>,
}

impl RebObject {
    /// How many fragments (full object included) the object must have.
    pub fn required_ct(&self) -> usize {
        if self.is_ec_copy {
            self.parity_slices as usize + 1
        } else {
            (self.data_slices + self.parity_slices) as usize + 1
        }
    }

    /// Current readiness state.
    pub fn ready(&self) -> u8 {
        self.ready.load(Ordering::Acquire)
    }

    /// Force a readiness state (terminal transitions).
    pub fn set_ready(&self, state: u8) {
        self.ready.store(state, Ordering::Release);
    }

    /// `Waiting -> Received`, exactly once.
    pub fn mark_received(&self) -> bool {
        self.ready
            .compare_exchange(OBJ_WAITING, OBJ_RECEIVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// HRW targets that hold no fragment, in HRW order, skipping `skip`.
    pub fn empty_targets(&self, loc: &LocCt, skip: &TargetId) -> Vec<TargetId> {
        self.hrw_targets
            .iter()
            .filter(|t| *t != skip && !loc.by_daemon.contains_key(*t))
            .cloned()
            .collect()
    }
}

/// One bucket's objects in the global CT view.
#[derive(Debug, Default)]
pub struct RebBck {
    /// Objects keyed by name; BTreeMap keeps iteration deterministic.
    pub objs: BTreeMap<String, ObjDraft>,
}

/// The cluster-global CT view: native and remote buckets kept apart.
#[derive(Debug, Default)]
pub struct GlobalCtList {
    /// Native buckets by name.
    pub ais: BTreeMap<String, RebBck>,
    /// Remote buckets by name.
    pub remote: BTreeMap<String, RebBck>,
}

// ---------------------------------------------------------------------------
// Pending ACKs
// ---------------------------------------------------------------------------

/// One outbound fragment awaiting the receiver's confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// Destination target.
    pub daemon_id: TargetId,
    /// Bucket of the fragment's object.
    pub bucket: Bucket,
    /// Object name.
    pub obj_name: String,
    /// Slice id sent.
    pub slice_id: u16,
}

/// Pending ACKs of the current batch.
///
/// A batch holds at most `batch_size * parity` entries (tens, not
/// thousands), so linear search wins over anything fancier.
#[derive(Debug, Default)]
pub struct AckTable {
    inner: Mutex<Vec<PendingAck>>,
}

impl AckTable {
    /// Register an outbound fragment.
    pub fn add(&self, ack: PendingAck) {
        debug_assert!(!ack.obj_name.is_empty() && !ack.bucket.name.is_empty());
        self.inner.lock().expect("ack table poisoned").push(ack);
    }

    /// Remove a confirmed (or failed) entry. Returns whether it was present.
    pub fn remove(&self, ack: &PendingAck) -> bool {
        let mut v = self.inner.lock().expect("ack table poisoned");
        if let Some(idx) = v.iter().position(|a| a == ack) {
            v.swap_remove(idx);
            true
        } else {
            false
        }
    }

    /// Number of unconfirmed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ack table poisoned").len()
    }

    /// True when no entry is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every remaining entry (end-of-batch logging).
    pub fn drain(&self) -> Vec<PendingAck> {
        std::mem::take(&mut *self.inner.lock().expect("ack table poisoned"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(daemon: &str, hash: &str, slice_id: u16) -> RebCt {
        RebCt::remote(CtRecord {
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            daemon_id: TargetId::new(daemon),
            obj_hash: hash.into(),
            obj_size: 1024,
            slice_id,
            data_slices: 2,
            parity_slices: 1,
        })
    }

    #[test]
    fn test_newest_picks_largest_group() {
        let mut draft = ObjDraft {
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            main_daemon: TargetId::new("t0"),
            groups: BTreeMap::new(),
        };
        draft
            .groups
            .insert("aaa".into(), vec![rec("t1", "aaa", 1)]);
        draft.groups.insert(
            "bbb".into(),
            vec![rec("t1", "bbb", 1), rec("t2", "bbb", 2), rec("t3", "bbb", 3)],
        );

        let newest = draft.newest();
        assert_eq!(newest.len(), 3);
        assert_eq!(newest[0].rec.obj_hash, "bbb");
    }

    #[test]
    fn test_newest_tie_prefers_smaller_hash() {
        let mut draft = ObjDraft {
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            main_daemon: TargetId::new("t0"),
            groups: BTreeMap::new(),
        };
        draft
            .groups
            .insert("zzz".into(), vec![rec("t1", "zzz", 1), rec("t2", "zzz", 2)]);
        draft
            .groups
            .insert("mmm".into(), vec![rec("t3", "mmm", 1), rec("t4", "mmm", 2)]);

        assert_eq!(draft.newest()[0].rec.obj_hash, "mmm");
    }

    #[test]
    fn test_misplaced_and_send_path() {
        let mut ct = rec("t1", "h", 1);
        assert!(!ct.is_misplaced());
        ct.real_path = Some("/mp1/slice/ais/b/o".into());
        ct.hrw_path = Some("/mp2/slice/ais/b/o".into());
        assert!(ct.is_misplaced());
        assert_eq!(ct.send_path(), ct.hrw_path.as_ref());

        ct.hrw_path = None;
        assert_eq!(ct.send_path(), ct.real_path.as_ref());
    }

    #[test]
    fn test_ready_transitions() {
        let obj = test_obj();
        assert_eq!(obj.ready(), OBJ_WAITING);
        assert!(obj.mark_received());
        assert!(!obj.mark_received(), "CAS must fire once");
        obj.set_ready(OBJ_DONE);
        assert_eq!(obj.ready(), OBJ_DONE);
    }

    fn test_obj() -> RebObject {
        RebObject {
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            uid: "ais/b/o".into(),
            obj_size: 1024,
            slice_size: 512,
            data_slices: 2,
            parity_slices: 1,
            is_ec_copy: false,
            main_daemon: TargetId::new("t0"),
            hrw_targets: vec![
                TargetId::new("t0"),
                TargetId::new("t1"),
                TargetId::new("t2"),
                TargetId::new("t3"),
            ],
            sender: None,
            main_has_any: false,
            main_slice_id: 0,
            has_ct: false,
            is_main: false,
            in_hrw_list: false,
            full_obj_found: false,
            has_all_slices: false,
            found_ct: 0,
            ct_exist: vec![false; 4],
            ready: AtomicU8::new(OBJ_WAITING),
            loc: tokio::sync::Mutex::new(LocCt::default()),
        }
    }

    #[test]
    fn test_required_ct() {
        let mut obj = test_obj();
        assert_eq!(obj.required_ct(), 4); // 2 + 1 + full object
        obj.is_ec_copy = true;
        assert_eq!(obj.required_ct(), 2); // parity + 1 replicas
    }

    #[tokio::test]
    async fn test_empty_targets_order_and_skip() {
        let obj = test_obj();
        {
            let mut loc = obj.loc.lock().await;
            loc.by_daemon.insert(
                TargetId::new("t1"),
                CtSlot {
                    ct: rec("t1", "h", 1),
                    buf: None,
                },
            );
        }
        let loc = obj.loc.lock().await;
        let free = obj.empty_targets(&loc, &TargetId::new("t0"));
        assert_eq!(free, vec![TargetId::new("t2"), TargetId::new("t3")]);
    }

    #[test]
    fn test_ack_table_add_remove() {
        let table = AckTable::default();
        let ack = PendingAck {
            daemon_id: TargetId::new("t2"),
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            slice_id: 3,
        };
        table.add(ack.clone());
        table.add(PendingAck {
            slice_id: 4,
            ..ack.clone()
        });
        assert_eq!(table.len(), 2);

        assert!(table.remove(&ack));
        assert!(!table.remove(&ack), "double remove must miss");
        assert_eq!(table.len(), 1);

        let left = table.drain();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].slice_id, 4);
        assert!(table.is_empty());
    }

    #[test]
    fn test_pending_ack_structural_equality() {
        let a = PendingAck {
            daemon_id: TargetId::new("t1"),
            bucket: Bucket::ais("b"),
            obj_name: "o".into(),
            slice_id: 1,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.daemon_id = TargetId::new("t2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_ct_record_postcard_roundtrip() {
        let r = rec("t9", "hash", 2).rec;
        let encoded = postcard::to_allocvec(&r).unwrap();
        let decoded: CtRecord = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(r, decoded);
    }
}
