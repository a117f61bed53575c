//! Plain object migration ("vanilla" rebalance).
//!
//! Per-mountpath joggers walk every object file; objects whose HRW target
//! is a different node are streamed there and tracked in a sharded ACK
//! table until the destination confirms durable storage. Confirmed objects
//! are deleted locally; unconfirmed ones are probed with HEAD and resent.
//! Source copies stay readable until their ACK so neighbor reads keep
//! working mid-rebalance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tessera_fs::{content_path, hrw_mountpath, save_atomic, workfile_path, ContentKind, Mountpath};
use tessera_net::{DataHdr, Opaque};
use tessera_types::{uname_shard, xxhash_hex, Bucket, ObjAttrs, Stage, TargetId, CKSUM_XXHASH};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

/// Shard count of the in-flight object table. Sharding keeps walker
/// parallelism from serializing on one lock.
const LOM_ACK_SHARDS: usize = 256;

/// A migrated object awaiting its destination's confirmation.
#[derive(Debug, Clone)]
pub struct ObjHandle {
    /// Bucket of the object.
    pub bucket: Bucket,
    /// Object name.
    pub obj_name: String,
    /// Canonical uname (table key).
    pub uname: String,
    /// Local path of the still-present source copy.
    pub path: PathBuf,
    /// Object size in bytes.
    pub size: u64,
}

/// Sharded table of objects on the wire, keyed by uname.
pub struct LomAckTable {
    shards: Vec<Mutex<HashMap<String, ObjHandle>>>,
}

impl LomAckTable {
    /// An empty table with the default shard count.
    pub fn new() -> Self {
        Self {
            shards: (0..LOM_ACK_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, uname: &str) -> &Mutex<HashMap<String, ObjHandle>> {
        &self.shards[uname_shard(uname, LOM_ACK_SHARDS - 1)]
    }

    /// Register an object as on-the-wire.
    pub fn insert(&self, handle: ObjHandle) {
        self.shard(&handle.uname)
            .lock()
            .expect("lom ack shard poisoned")
            .insert(handle.uname.clone(), handle);
    }

    /// Confirm (or give up on) an object.
    pub fn remove(&self, uname: &str) -> Option<ObjHandle> {
        self.shard(uname)
            .lock()
            .expect("lom ack shard poisoned")
            .remove(uname)
    }

    /// Number of unconfirmed objects.
    pub fn pending(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("lom ack shard poisoned").len())
            .sum()
    }

    /// Snapshot of every unconfirmed object.
    pub fn collect(&self) -> Vec<ObjHandle> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .expect("lom ack shard poisoned")
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Drop everything (start of a new run).
    pub fn clear(&self) {
        for s in &self.shards {
            s.lock().expect("lom ack shard poisoned").clear();
        }
    }
}

impl Default for LomAckTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RebManager {
    // -----------------------------------------------------------------
    // Traverse
    // -----------------------------------------------------------------

    /// Walk every mountpath and stream misplaced objects to their owners.
    pub(crate) async fn run_vanilla_traverse(
        self: &Arc<Self>,
        ctx: &RunCtx,
    ) -> Result<(), RebError> {
        let mut handles = Vec::new();
        for mpath in &self.mpaths {
            let this = self.clone();
            let mpath = mpath.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { this.jog(&ctx, &mpath).await }));
        }
        for h in handles {
            h.await.map_err(|e| RebError::Net(e.to_string()))??;
        }
        Ok(())
    }

    /// One mountpath jogger.
    async fn jog(self: &Arc<Self>, ctx: &RunCtx, mpath: &Mountpath) -> Result<(), RebError> {
        let multiplier = ctx.config.rebalance.effective_multiplier();
        let sema = Arc::new(Semaphore::new(multiplier));
        let mut senders = Vec::new();

        for (bck, obj, path) in self.walk_objects(mpath).await? {
            if self.is_aborted() {
                return Err(RebError::Aborted("vanilla traverse".into()));
            }
            // A newer map invalidates every placement decision of this run.
            if self.smap_owner.get().version > ctx.smap.version {
                self.abort();
                return Err(RebError::Aborted("newer cluster map during traverse".into()));
            }

            // Objects with an EC sidecar belong to the EC repair pipeline.
            let meta = content_path(mpath, ContentKind::Metadata, &bck, &obj);
            if tokio::fs::metadata(&meta).await.is_ok() {
                continue;
            }

            let uname = bck.uname(&obj);
            let Some(main) = ctx.smap.main_target(&uname) else {
                continue;
            };
            if main == self.local {
                continue;
            }

            // Per-file errors (e.g. deleted mid-walk) are skipped, not fatal.
            let size = match tokio::fs::metadata(&path).await {
                Ok(md) => md.len(),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "object vanished mid-walk");
                    continue;
                }
            };
            let handle = ObjHandle {
                bucket: bck,
                obj_name: obj,
                uname,
                path,
                size,
            };

            let permit = sema
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| RebError::Net(e.to_string()))?;
            let this = self.clone();
            let ctx = ctx.clone();
            senders.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = this.send_vanilla(&ctx, handle, &main).await {
                    // One failed send is not fatal: the ACK never comes and
                    // the retransmit sweep takes over.
                    warn!(error = %e, "object send failed");
                }
            }));
        }

        for s in senders {
            let _ = s.await;
        }
        Ok(())
    }

    /// Stream one object to its HRW owner.
    async fn send_vanilla(
        self: &Arc<Self>,
        ctx: &RunCtx,
        handle: ObjHandle,
        to: &TargetId,
    ) -> Result<(), RebError> {
        let data = {
            let _guard = self.locker.exclusive(&handle.uname).await;
            Bytes::from(tokio::fs::read(&handle.path).await?)
        };

        let hdr = DataHdr {
            bucket: handle.bucket.clone(),
            obj_name: handle.obj_name.clone(),
            attrs: ObjAttrs {
                size: data.len() as u64,
                cksum_type: CKSUM_XXHASH.to_string(),
                cksum_value: xxhash_hex(&data),
                ..ObjAttrs::default()
            },
            opaque: Opaque::ObjPush {
                daemon_id: self.local.clone(),
                reb_id: ctx.reb_id,
            },
        };
        debug!(uname = %handle.uname, %to, size = data.len(), "migrating object");

        // Optimistically registered before the send; removed on failure.
        let uname = handle.uname.clone();
        self.lom_acks.insert(handle);

        let size = data.len() as u64;
        self.on_air.fetch_add(1, Ordering::AcqRel);
        let res = self.transport.send_data(to, hdr, data).await;
        self.on_air.fetch_sub(1, Ordering::AcqRel);

        match res {
            Ok(()) => {
                self.stats.add_tx(size);
                Ok(())
            }
            Err(e) => {
                self.lom_acks.remove(&uname);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------

    /// Store an inbound migrated object and confirm it.
    pub(crate) async fn recv_vanilla_obj(
        self: &Arc<Self>,
        hdr: &DataHdr,
        daemon_id: TargetId,
        reb_id: u64,
        payload: Bytes,
    ) -> Result<(), RebError> {
        let Some(ctx) = self.current_ctx() else {
            warn!(uname = %hdr.uname(), "object received while not rebalancing, dropping");
            return Ok(());
        };
        if reb_id != ctx.reb_id {
            warn!(uname = %hdr.uname(), got = reb_id, current = ctx.reb_id, "object for a different rebalance");
            return Ok(());
        }

        let uname = hdr.uname();
        if !hdr.attrs.cksum_value.is_empty()
            && hdr.attrs.cksum_type == CKSUM_XXHASH
            && xxhash_hex(&payload) != hdr.attrs.cksum_value
        {
            // No ACK: the sender's retransmit sweep will resend.
            self.stats.add_cksum_error();
            return Err(RebError::BadChecksum { uname, slice_id: 0 });
        }

        let mpath = hrw_mountpath(&self.mpaths, &uname)
            .ok_or_else(|| RebError::MissingMeta(format!("{uname}: no mountpaths")))?;
        let dst = content_path(mpath, ContentKind::Object, &hdr.bucket, &hdr.obj_name);
        let work = workfile_path(mpath, &hdr.bucket, &hdr.obj_name, "put");
        {
            let _guard = self.locker.exclusive(&uname).await;
            if let Err(e) = save_atomic(&dst, &work, &payload).await {
                self.report_fs_error(&e, &dst);
                return Err(e.into());
            }
        }
        self.stats.add_rx(payload.len() as u64);
        debug!(%uname, from = %daemon_id, "migrated object stored");

        // Confirm, unless the run is already winding down.
        let stage = self.stages.self_mark().stage;
        if stage >= Stage::Fin || stage == Stage::Inactive {
            return Ok(());
        }
        let ack_hdr = DataHdr {
            bucket: hdr.bucket.clone(),
            obj_name: hdr.obj_name.clone(),
            attrs: ObjAttrs::default(),
            opaque: Opaque::ObjAck {
                daemon_id: self.local.clone(),
            },
        };
        if let Err(e) = self.transport.send_ack(&daemon_id, ack_hdr).await {
            error!(%uname, to = %daemon_id, error = %e, "failed to send object ack");
        }
        Ok(())
    }

    /// The destination confirmed an object: delete the local source.
    pub(crate) async fn recv_vanilla_ack(self: &Arc<Self>, hdr: &DataHdr, from: TargetId) {
        let uname = hdr.uname();
        let Some(handle) = self.lom_acks.remove(&uname) else {
            debug!(%uname, %from, "ack for unknown object");
            return;
        };
        debug!(%uname, %from, "object acknowledged, removing source");

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = this.locker.exclusive(&handle.uname).await;
            if let Err(e) = tokio::fs::remove_file(&handle.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        uname = %handle.uname,
                        path = %handle.path.display(),
                        error = %e,
                        "failed to remove migrated object"
                    );
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // WaitAck and retransmission
    // -----------------------------------------------------------------

    /// Wait for all object ACKs; retransmit and repeat while needed.
    pub(crate) async fn wait_obj_acks(self: &Arc<Self>, ctx: &RunCtx) -> Result<(), RebError> {
        loop {
            self.poll_acks_drained(ctx).await?;
            self.poll_peers_done(ctx).await?;
            let resent = self.retransmit(ctx).await?;
            if resent == 0 {
                return Ok(());
            }
            info!(target_id = %self.local, resent, "objects resent, repeating ack wait");
        }
    }

    async fn poll_acks_drained(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let sleep = ctx.config.timeout.cplane_op;
        let base = ctx.config.rebalance.dest_retry;
        let scaled = base + Duration::from_secs(60) * (ctx.smap.len() as u32 / 10);
        let maxwt = scaled.min(base * 2);
        let deadline = tokio::time::Instant::now() + maxwt;

        loop {
            let cnt = self.lom_acks.pending();
            if cnt == 0 {
                debug!(target_id = %self.local, "all object acks received");
                return Ok(());
            }
            if self.is_aborted() {
                return Err(RebError::Aborted("waiting for object acks".into()));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(target_id = %self.local, pending = cnt, "timed out waiting for object acks");
                return Ok(());
            }
            debug!(target_id = %self.local, pending = cnt, "waiting for object acks");
            tokio::time::sleep(sleep).await;
        }
    }

    /// Wait for each peer to pass its own ack wait (or to stop waiting for
    /// us).
    async fn poll_peers_done(&self, ctx: &RunCtx) -> Result<(), RebError> {
        for peer in ctx.smap.targets.keys() {
            if *peer == self.local {
                continue;
            }
            let deadline = tokio::time::Instant::now() + ctx.config.rebalance.dest_retry;
            loop {
                if self.is_aborted() {
                    return Err(RebError::Aborted("polling peers".into()));
                }
                match self.client.reb_status(peer).await {
                    Ok(st) => {
                        if st.smap_version > ctx.smap.version {
                            self.abort();
                            return Err(RebError::Aborted(format!(
                                "peer {peer} has newer cluster map v{}",
                                st.smap_version
                            )));
                        }
                        if st.stage > Stage::WaitAck
                            || !st.ack_waiting.contains(&self.local)
                        {
                            break;
                        }
                        debug!(%peer, stage = %st.stage, "peer still waits for our acks");
                    }
                    Err(e) => debug!(%peer, error = %e, "peer status poll failed"),
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(%peer, "gave up waiting for peer completion");
                    break;
                }
                tokio::time::sleep(ctx.config.timeout.max_keepalive).await;
            }
        }
        Ok(())
    }

    /// Probe destinations for every unconfirmed object; resend misses.
    ///
    /// Returns how many objects were resent.
    async fn retransmit(self: &Arc<Self>, ctx: &RunCtx) -> Result<usize, RebError> {
        let mut resent = 0usize;
        for handle in self.lom_acks.collect() {
            if self.is_aborted()
                || self.smap_owner.get().version > ctx.smap.version
            {
                return Ok(0);
            }

            // The source may be gone (deleted by a racing ack).
            if tokio::fs::metadata(&handle.path).await.is_err() {
                self.lom_acks.remove(&handle.uname);
                continue;
            }

            let Some(main) = ctx.smap.main_target(&handle.uname) else {
                self.lom_acks.remove(&handle.uname);
                continue;
            };

            match self
                .client
                .head_object(&main, &handle.bucket, &handle.obj_name)
                .await
            {
                Ok(true) => {
                    debug!(uname = %handle.uname, %main, "destination has the object");
                    self.lom_acks.remove(&handle.uname);
                }
                Ok(false) | Err(_) => {
                    warn!(uname = %handle.uname, %main, "resending object");
                    let uname = handle.uname.clone();
                    if let Err(e) = self.send_vanilla(ctx, handle, &main).await {
                        error!(%uname, error = %e, "resend failed");
                    } else {
                        resent += 1;
                    }
                }
            }
        }
        Ok(resent)
    }
}
