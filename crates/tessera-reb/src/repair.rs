//! EC repair executor: the batched per-object repair state machine.
//!
//! The broken list is processed in fixed-size batches. Within a batch each
//! target classifies every object (skip / send from disk / wait for
//! fragments), streams what it owes to the object's main target, and the
//! main reconstructs via Reed-Solomon and redistributes regenerated slices
//! to fragment-free targets. A batch ends with a quiescence wait, a
//! re-request sweep for anything still missing, and a cluster-wide batch
//! barrier; only then is its scratch state released.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tessera_fs::{content_path, hrw_mountpath, save_atomic, save_meta, workfile_path, ContentKind};
use tessera_net::{DataHdr, Opaque};
use tessera_types::{
    xxhash_hex, EcMetadata, ObjAttrs, Stage, StageMark, TargetId, CKSUM_XXHASH,
};
use tracing::{debug, error, info, warn};

use crate::ct::{LocCt, PendingAck, RebCt, RebObject, OBJ_DONE, OBJ_RECEIVED, OBJ_WAITING};
use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

impl RebManager {
    // -----------------------------------------------------------------
    // Batch loop
    // -----------------------------------------------------------------

    /// Repair the whole broken list, batch by batch.
    pub(crate) async fn run_ec_batches(self: &Arc<Self>, ctx: &RunCtx) -> Result<(), RebError> {
        let total = self.ec.broken.read().expect("broken poisoned").len();
        let batch_size = ctx.config.ec.batch_size.max(1);
        let mut start = 0usize;

        while start < total {
            if self.is_aborted() {
                return Err(RebError::Aborted("ec batch loop".into()));
            }
            self.ec.curr_batch.store(start, Ordering::Release);
            debug!(target_id = %self.local, batch = start, batch_size, total, "starting batch");

            let res = self.run_one_batch(ctx, start).await;
            self.cleanup_batch(ctx, start).await;
            res?;

            start += batch_size;
        }
        self.ec.curr_batch.store(start, Ordering::Release);
        Ok(())
    }

    async fn run_one_batch(self: &Arc<Self>, ctx: &RunCtx, start: usize) -> Result<(), RebError> {
        self.rebalance_batch(ctx, start).await?;
        self.finalize_batch(ctx, start).await
    }

    /// Classify and act on every object of the batch.
    async fn rebalance_batch(self: &Arc<Self>, ctx: &RunCtx, start: usize) -> Result<(), RebError> {
        let batch = self.batch_objects(ctx, start, 1);
        for obj in batch {
            if self.is_aborted() {
                return Err(RebError::Aborted("rebalance batch".into()));
            }
            debug!(target_id = %self.local, uname = %obj.uid, "processing object");
            self.rebalance_object(ctx, &obj).await?;
        }
        Ok(())
    }

    /// Objects in `[start, start + window * batch_size)`.
    fn batch_objects(&self, ctx: &RunCtx, start: usize, window: usize) -> Vec<Arc<RebObject>> {
        let broken = self.ec.broken.read().expect("broken poisoned");
        let end = (start + window * ctx.config.ec.batch_size.max(1)).min(broken.len());
        broken[start.min(broken.len())..end].to_vec()
    }

    // -----------------------------------------------------------------
    // Per-object classification
    // -----------------------------------------------------------------

    /// The local target has nothing to do for this object.
    fn should_skip_obj(&self, obj: &RebObject) -> bool {
        let any_on_main = obj.main_has_any && obj.main_slice_id == 0;
        let no_on_secondary = !obj.has_ct && !obj.is_main;
        let not_sender = obj.is_ec_copy
            && !obj.is_main
            && obj.sender.as_ref().is_some_and(|s| *s != self.local);
        any_on_main || no_on_secondary || not_sender
    }

    /// Ordinal of `daemon` among HRW targets (main excluded) that hold a
    /// fragment. `None` when the daemon holds nothing.
    fn target_index(&self, daemon: &TargetId, obj: &RebObject, loc: &LocCt) -> Option<usize> {
        let mut cnt = 0usize;
        for tgt in obj.hrw_targets.iter().skip(1) {
            if !loc.by_daemon.contains_key(tgt) {
                continue;
            }
            if tgt == daemon {
                return Some(cnt);
            }
            cnt += 1;
        }
        None
    }

    /// Should this target ship its slice to the main for a rebuild?
    ///
    /// Only the first `data_slices` holders (by HRW) send: the main needs
    /// exactly that many slices to reconstruct, so any further senders
    /// would burn bandwidth to save nothing.
    fn should_send_slice(&self, obj: &RebObject, loc: &LocCt) -> (bool, bool) {
        if obj.is_main {
            return (false, false);
        }
        let idx = self.target_index(&self.local, obj, loc);
        let should_send = idx.is_some_and(|i| i < obj.data_slices as usize);
        let has_slice = obj.has_ct && !obj.is_main && !obj.is_ec_copy && !obj.full_obj_found;
        (has_slice, should_send)
    }

    /// This target holds the full object while the main does not.
    fn has_full_obj_misplaced(&self, obj: &RebObject, loc: &LocCt) -> bool {
        let Some(slot) = loc.by_daemon.get(&self.local) else {
            return false;
        };
        !obj.is_ec_copy
            && !obj.is_main
            && slot.ct.rec.slice_id == 0
            && (!obj.main_has_any || obj.main_slice_id != 0)
    }

    /// Decide and perform this target's part for one object.
    async fn rebalance_object(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
    ) -> Result<(), RebError> {
        let loc = obj.loc.lock().await;

        // Case 0: this target is main and has the full object, but some
        // slices are gone cluster-wide. Regenerate them straight from the
        // on-disk object and push to fragment-free targets.
        if obj.is_main
            && obj.main_has_any
            && obj.main_slice_id == 0
            && !obj.is_ec_copy
            && !obj.has_all_slices
        {
            let local_ct = loc.by_daemon.get(&self.local).map(|s| s.ct.clone());
            let free = obj.empty_targets(&loc, &self.local);
            drop(loc);
            let res = self.rebuild_from_disk(ctx, obj, local_ct, free).await;
            obj.set_ready(OBJ_DONE);
            return res;
        }

        // Case 1: nothing to do here.
        if self.should_skip_obj(obj) {
            debug!(uname = %obj.uid, "skipping");
            obj.set_ready(OBJ_DONE);
            return Ok(());
        }

        // Case 2: this target holds someone else's full object.
        if self.has_full_obj_misplaced(obj, &loc) {
            if let Some(slot) = loc.by_daemon.get(&self.local) {
                let ct = slot.ct.clone();
                drop(loc);
                obj.set_ready(OBJ_DONE);
                return self.send_local_data(ctx, obj, ct, None).await;
            }
        }

        // Case 3: the full object is gone and this target holds a slice.
        let (has_slice, should_send) = self.should_send_slice(obj, &loc);
        if !obj.full_obj_found && has_slice {
            let local_ct = loc.by_daemon.get(&self.local).map(|s| s.ct.clone());
            drop(loc);
            obj.set_ready(OBJ_DONE);
            if should_send {
                let ct = local_ct.ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;
                return self.send_local_data(ctx, obj, ct, None).await;
            }
            return Ok(());
        }

        // Case 4: replicated object.
        if obj.is_ec_copy {
            let local_ct = loc.by_daemon.get(&self.local).map(|s| s.ct.clone());
            drop(loc);
            return self.restore_replica(ctx, obj, local_ct).await;
        }

        // Case 5.1: not main, and either holds its slice already or HRW
        // wants nothing here.
        if !obj.is_main && (obj.has_ct || !obj.in_hrw_list) {
            debug!(uname = %obj.uid, "secondary target satisfied");
            obj.set_ready(OBJ_DONE);
            return Ok(());
        }

        // Case 5.3: main without the full object — wait for fragments.
        let no_replica_on_main = !obj.main_has_any || obj.main_slice_id != 0;
        if obj.is_main && no_replica_on_main {
            debug!(uname = %obj.uid, "main waiting for fragments");
            return Ok(());
        }

        // Anything else means the object should not be on the broken list.
        warn!(
            uname = %obj.uid,
            is_main = obj.is_main,
            main_has_any = obj.main_has_any,
            main_slice_id = obj.main_slice_id,
            "unexpected broken-object state"
        );
        Ok(())
    }

    /// Replica path: the unique sender pushes its copy to the main.
    async fn restore_replica(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
        local_ct: Option<RebCt>,
    ) -> Result<(), RebError> {
        if obj.is_main && obj.main_has_any {
            obj.set_ready(OBJ_DONE);
            return Ok(());
        }
        if obj.is_main {
            // Stay in waiting: the sender's replica is on its way.
            debug!(uname = %obj.uid, "main waiting for replica");
            return Ok(());
        }
        obj.set_ready(OBJ_DONE);
        if obj.sender.as_ref() != Some(&self.local) {
            return Ok(());
        }
        let ct = local_ct.ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;
        self.send_local_data(ctx, obj, ct, None).await
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Send the local fragment of `obj` from disk, to `target` or to main.
    async fn send_local_data(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
        ct: RebCt,
        target: Option<TargetId>,
    ) -> Result<(), RebError> {
        self.laterx.store(true, Ordering::Release);
        let target = target.unwrap_or_else(|| obj.main_daemon.clone());
        debug!(
            uname = %obj.uid,
            slice_id = ct.rec.slice_id,
            to = %target,
            "sending local fragment"
        );
        self.send_from_disk(ctx, &ct, &target).await
    }

    /// Read a fragment from disk and push it on the data bundle.
    pub(crate) async fn send_from_disk(
        self: &Arc<Self>,
        ctx: &RunCtx,
        ct: &RebCt,
        target: &TargetId,
    ) -> Result<(), RebError> {
        let meta = ct
            .meta
            .clone()
            .ok_or_else(|| RebError::MissingMeta(ct.rec.uname()))?;

        // The resilver has already moved local fragments home, so prefer
        // the HRW location when the file is there.
        let path = match (&ct.hrw_path, &ct.real_path) {
            (Some(hrw), _) if tokio::fs::metadata(hrw).await.is_ok() => hrw.clone(),
            (_, Some(real)) => real.clone(),
            (Some(hrw), None) => hrw.clone(),
            (None, None) => return Err(RebError::MissingMeta(ct.rec.uname())),
        };
        let data = Bytes::from(tokio::fs::read(&path).await?);

        let mut attrs = ObjAttrs {
            size: data.len() as u64,
            version: meta.obj_version.clone(),
            ..ObjAttrs::default()
        };
        if ct.rec.slice_id == 0 {
            attrs.cksum_type = CKSUM_XXHASH.to_string();
            attrs.cksum_value = xxhash_hex(&data);
        }

        let hdr = DataHdr {
            bucket: ct.rec.bucket.clone(),
            obj_name: ct.rec.obj_name.clone(),
            attrs,
            opaque: Opaque::EcPush {
                daemon_id: self.local.clone(),
                stage: Stage::EcRepair,
                reb_id: ctx.reb_id,
                meta,
            },
        };

        self.send_ct(ctx, hdr, data, target, ct.rec.slice_id).await
    }

    /// Push a regenerated slice from memory.
    async fn send_rebuilt_slice(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &RebObject,
        slice_id: u16,
        data: Bytes,
        meta_template: &EcMetadata,
        target: &TargetId,
    ) -> Result<(), RebError> {
        let mut meta = meta_template.clone();
        meta.slice_id = slice_id;

        let hdr = DataHdr {
            bucket: obj.bucket.clone(),
            obj_name: obj.obj_name.clone(),
            attrs: ObjAttrs {
                size: data.len() as u64,
                version: meta.obj_version.clone(),
                cksum_type: CKSUM_XXHASH.to_string(),
                cksum_value: xxhash_hex(&data),
                atime: 0,
            },
            opaque: Opaque::EcPush {
                daemon_id: self.local.clone(),
                stage: Stage::EcRepair,
                reb_id: ctx.reb_id,
                meta,
            },
        };
        debug!(
            uname = %obj.uid,
            slice_id,
            to = %target,
            size = data.len(),
            "sending regenerated slice"
        );
        self.send_ct(ctx, hdr, data, target, slice_id).await
    }

    /// Common send path: register the pending ACK, account in-flight,
    /// hand the frame to the transport.
    async fn send_ct(
        self: &Arc<Self>,
        _ctx: &RunCtx,
        hdr: DataHdr,
        data: Bytes,
        target: &TargetId,
        slice_id: u16,
    ) -> Result<(), RebError> {
        let ack = PendingAck {
            daemon_id: target.clone(),
            bucket: hdr.bucket.clone(),
            obj_name: hdr.obj_name.clone(),
            slice_id,
        };
        self.ec.acks.add(ack.clone());

        let size = data.len() as u64;
        self.on_air.fetch_add(1, Ordering::AcqRel);
        let res = self.transport.send_data(target, hdr, data).await;
        self.on_air.fetch_sub(1, Ordering::AcqRel);

        match res {
            Ok(()) => {
                self.stats.add_tx(size);
                Ok(())
            }
            Err(e) => {
                self.ec.acks.remove(&ack);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------

    /// Handle an inbound EC fragment push.
    pub(crate) async fn receive_ct(
        self: &Arc<Self>,
        hdr: &DataHdr,
        daemon_id: TargetId,
        reb_id: u64,
        meta: EcMetadata,
        payload: Bytes,
    ) -> Result<(), RebError> {
        let Some(ctx) = self.current_ctx() else {
            warn!(uname = %hdr.uname(), "fragment received while not rebalancing, dropping");
            return Ok(());
        };
        if reb_id != ctx.reb_id {
            warn!(
                uname = %hdr.uname(),
                got = reb_id,
                current = ctx.reb_id,
                "fragment for a different rebalance, dropping"
            );
            return Ok(());
        }

        let uid = hdr.uname();
        let Some(obj) = self.obj_by_uid(&ctx, &uid) else {
            // The sender can be up to one batch ahead; anything further is
            // stale and dropped.
            warn!(%uid, from = %daemon_id, slice_id = meta.slice_id, "fragment arrived too late?");
            return Ok(());
        };

        let mut loc = obj.loc.lock().await;
        if !loc.by_daemon.contains_key(&daemon_id) {
            // A regenerated fragment pushed to a target that had nothing:
            // persist it and confirm.
            drop(loc);
            match self.save_ct_to_disk(&ctx, hdr, &meta, &payload).await {
                Ok(()) => {
                    self.stats.add_rx(payload.len() as u64);
                    self.send_ec_ack(hdr, &daemon_id, meta.slice_id).await;
                    Ok(())
                }
                Err(e) => {
                    error!(%uid, slice_id = meta.slice_id, error = %e, "failed to save fragment");
                    if obj.is_main {
                        self.abort();
                        return Err(e);
                    }
                    Ok(())
                }
            }
        } else {
            // A known holder may relay a *different* fragment than the one
            // it contributed (main regenerating slices from its full
            // object). That is a store-and-confirm, not a slot fill.
            let relayed = loc
                .by_daemon
                .get(&daemon_id)
                .is_some_and(|s| s.ct.rec.slice_id != meta.slice_id);
            if relayed {
                drop(loc);
                match self.save_ct_to_disk(&ctx, hdr, &meta, &payload).await {
                    Ok(()) => {
                        self.stats.add_rx(payload.len() as u64);
                        self.send_ec_ack(hdr, &daemon_id, meta.slice_id).await;
                        return Ok(());
                    }
                    Err(e) => {
                        error!(%uid, slice_id = meta.slice_id, error = %e, "failed to save fragment");
                        return Ok(());
                    }
                }
            }

            let Some(slot) = loc.by_daemon.get_mut(&daemon_id) else {
                return Ok(());
            };
            if slot.buf.is_some() || obj.ready() != OBJ_WAITING {
                debug!(%uid, slice_id = meta.slice_id, "fragment already handled, dropping");
                return Ok(());
            }

            if !hdr.attrs.cksum_value.is_empty()
                && hdr.attrs.cksum_type == CKSUM_XXHASH
                && xxhash_hex(&payload) != hdr.attrs.cksum_value
            {
                self.stats.add_cksum_error();
                return Err(RebError::BadChecksum {
                    uname: uid,
                    slice_id: meta.slice_id,
                });
            }

            slot.buf = Some(payload.clone());
            slot.ct.meta = Some(meta.clone());
            self.stats.add_rx(payload.len() as u64);

            let save_to_disk = slot.ct.rec.slice_id == 0 || !obj.is_main;
            if save_to_disk {
                obj.set_ready(OBJ_DONE);
                drop(loc);
                if let Err(e) = self.save_ct_to_disk(&ctx, hdr, &meta, &payload).await {
                    error!(%uid, slice_id = meta.slice_id, error = %e, "failed to save fragment");
                    if obj.is_main {
                        self.abort();
                        return Err(e);
                    }
                    // Secondary targets swallow the failure: the main never
                    // sees an ACK and the scrubber reconciles later.
                    return Ok(());
                }
            } else {
                Self::update_rebuild_info(&obj, &loc);
                drop(loc);
            }

            self.send_ec_ack(hdr, &daemon_id, meta.slice_id).await;
            Ok(())
        }
    }

    async fn send_ec_ack(&self, hdr: &DataHdr, to: &TargetId, slice_id: u16) {
        let ack_hdr = DataHdr {
            bucket: hdr.bucket.clone(),
            obj_name: hdr.obj_name.clone(),
            attrs: ObjAttrs::default(),
            opaque: Opaque::EcAck {
                daemon_id: self.local.clone(),
                slice_id,
            },
        };
        if let Err(e) = self.transport.send_ack(to, ack_hdr).await {
            error!(uname = %hdr.uname(), %to, error = %e, "failed to send ack");
        }
    }

    /// Persist a received fragment if this target should hold it.
    ///
    /// Full objects are always saved; slices only on non-main targets (the
    /// main keeps slices in memory purely to rebuild). The metadata sidecar
    /// lands first so a torn write leaves a discoverable state.
    pub(crate) async fn save_ct_to_disk(
        &self,
        ctx: &RunCtx,
        hdr: &DataHdr,
        meta: &EcMetadata,
        payload: &[u8],
    ) -> Result<(), RebError> {
        let uname = hdr.uname();
        let need_save = meta.slice_id == 0
            || ctx.smap.main_target(&uname).as_ref() != Some(&self.local);
        if !need_save {
            return Ok(());
        }

        if meta.slice_id == 0
            && hdr.attrs.cksum_type == CKSUM_XXHASH
            && !hdr.attrs.cksum_value.is_empty()
            && xxhash_hex(payload) != hdr.attrs.cksum_value
        {
            self.stats.add_cksum_error();
            return Err(RebError::BadChecksum {
                uname,
                slice_id: 0,
            });
        }

        let mpath = hrw_mountpath(&self.mpaths, &uname)
            .ok_or_else(|| RebError::MissingMeta(format!("{uname}: no mountpaths")))?;
        let kind = if meta.slice_id == 0 {
            ContentKind::Object
        } else {
            ContentKind::Slice
        };
        let ct_path = content_path(mpath, kind, &hdr.bucket, &hdr.obj_name);
        let meta_path = content_path(mpath, ContentKind::Metadata, &hdr.bucket, &hdr.obj_name);

        let guard = if meta.slice_id == 0 {
            Some(self.locker.exclusive(&uname).await)
        } else {
            None
        };

        let meta_work = workfile_path(mpath, &hdr.bucket, &hdr.obj_name, "meta");
        if let Err(e) = save_meta(&meta_path, &meta_work, meta).await {
            self.report_fs_error(&e, &meta_path);
            return Err(e.into());
        }

        let data_work = workfile_path(mpath, &hdr.bucket, &hdr.obj_name, "ec");
        if let Err(e) = save_atomic(&ct_path, &data_work, payload).await {
            self.report_fs_error(&e, &ct_path);
            for p in [&meta_path, &ct_path] {
                if let Err(rm) = tokio::fs::remove_file(p).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        error!(path = %p.display(), error = %rm, "cleanup after failed save");
                    }
                }
            }
            return Err(e.into());
        }
        drop(guard);

        debug!(%uname, slice_id = meta.slice_id, path = %ct_path.display(), "fragment persisted");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Re-request sweep and rebuild bookkeeping
    // -----------------------------------------------------------------

    /// Fetch fragments that were promised but never arrived.
    async fn rerequest_obj(&self, _ctx: &RunCtx, obj: &Arc<RebObject>) -> Result<(), RebError> {
        if obj.ready() == OBJ_DONE {
            return Ok(());
        }

        let to_request: Vec<(TargetId, u16)> = {
            let loc = obj.loc.lock().await;
            loc.by_daemon
                .iter()
                .filter(|(_, slot)| slot.buf.is_none())
                .map(|(tid, slot)| (tid.clone(), slot.ct.rec.slice_id))
                .collect()
        };
        if !to_request.is_empty() {
            debug!(uname = %obj.uid, missing = to_request.len(), "re-requesting fragments");
        }

        let mut fetched = Vec::new();
        for (tid, slice_id) in to_request {
            match self
                .client
                .fetch_ct(&tid, &obj.bucket, &obj.obj_name, slice_id)
                .await
            {
                Ok(Some((meta, data))) => fetched.push((tid, meta, data)),
                Ok(None) => {
                    warn!(uname = %obj.uid, from = %tid, slice_id, "peer no longer has the fragment")
                }
                Err(e) => {
                    // One or a few failed reads are fine; what matters is
                    // whether enough fragments end up present.
                    error!(uname = %obj.uid, from = %tid, slice_id, error = %e, "fragment fetch failed");
                }
            }
        }

        let state = {
            let mut loc = obj.loc.lock().await;
            for (tid, meta, data) in fetched {
                if let Some(slot) = loc.by_daemon.get_mut(&tid) {
                    if slot.buf.is_none() {
                        slot.ct.meta = Some(meta);
                        slot.buf = Some(data);
                    }
                }
            }
            Self::update_rebuild_info(obj, &loc);
            drop(loc);
            obj.ready()
        };

        if state == OBJ_WAITING {
            return Err(RebError::InsufficientSlices {
                uname: obj.uid.clone(),
            });
        }
        Ok(())
    }

    /// Advance the object's readiness from what has been received so far.
    pub(crate) fn update_rebuild_info(obj: &RebObject, loc: &LocCt) {
        if obj.ready() != OBJ_WAITING {
            return;
        }
        let cnt = loc.buffered();
        if cnt != 0 && !obj.is_main {
            // A secondary target needs exactly one fragment.
            obj.set_ready(OBJ_DONE);
        } else if obj.is_main && obj.is_ec_copy && cnt != 0 {
            obj.set_ready(OBJ_RECEIVED);
        } else if cnt >= obj.data_slices as usize {
            obj.mark_received();
        }
    }

    /// Re-request missing fragments for every still-waiting object of the
    /// batch, then rebuild whatever became ready.
    async fn all_ct_received(self: &Arc<Self>, ctx: &RunCtx, start: usize) -> Result<(), RebError> {
        let (to_wait, to_rebuild) = self.to_wait(ctx, start);
        if to_wait == 0 && to_rebuild == 0 {
            return Ok(());
        }

        if to_wait != 0 {
            for obj in self.batch_objects(ctx, start, 1) {
                if self.is_aborted() {
                    return Err(RebError::Aborted("re-request sweep".into()));
                }
                if let Err(e) = self.rerequest_obj(ctx, &obj).await {
                    error!(uname = %obj.uid, error = %e, "re-request failed");
                    self.abort();
                    return Err(e);
                }
            }
        }

        self.rebuild_received(ctx, start).await
    }

    /// Objects of the batch still waiting / ready to rebuild.
    fn to_wait(&self, ctx: &RunCtx, start: usize) -> (usize, usize) {
        let mut wait = 0;
        let mut rebuild = 0;
        for obj in self.batch_objects(ctx, start, 1) {
            match obj.ready() {
                OBJ_WAITING => wait += 1,
                OBJ_RECEIVED => rebuild += 1,
                _ => {}
            }
        }
        (wait, rebuild)
    }

    /// Find a batch object by uname. The window is two batches wide — a
    /// peer may already be sending for the next batch.
    pub(crate) fn obj_by_uid(&self, ctx: &RunCtx, uid: &str) -> Option<Arc<RebObject>> {
        let start = self.ec.curr_batch.load(Ordering::Acquire);
        self.batch_objects(ctx, start, 2)
            .into_iter()
            .find(|o| o.uid == uid)
    }

    /// First batch object with enough fragments to rebuild.
    fn first_ready(&self, ctx: &RunCtx, start: usize) -> Option<Arc<RebObject>> {
        self.batch_objects(ctx, start, 1)
            .into_iter()
            .find(|o| o.ready() == OBJ_RECEIVED)
    }

    // -----------------------------------------------------------------
    // Reconstruction
    // -----------------------------------------------------------------

    /// Rebuild every object of the batch that has enough fragments.
    async fn rebuild_received(self: &Arc<Self>, ctx: &RunCtx, start: usize) -> Result<(), RebError> {
        while let Some(obj) = self.first_ready(ctx, start) {
            if self.is_aborted() {
                return Err(RebError::Aborted("rebuild".into()));
            }
            let res = self.rebuild_and_send(ctx, &obj).await;
            obj.set_ready(OBJ_DONE);
            if let Err(e) = res {
                error!(uname = %obj.uid, error = %e, "rebuild failed");
                self.abort();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Rebuild one object: a received replica short-circuits the RS path.
    async fn rebuild_and_send(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
    ) -> Result<(), RebError> {
        let replica = {
            let loc = obj.loc.lock().await;
            loc.by_daemon.values().find_map(|slot| {
                match (&slot.buf, slot.ct.rec.slice_id, &slot.ct.meta) {
                    (Some(buf), 0, Some(meta)) if !buf.is_empty() => {
                        Some((meta.clone(), buf.clone()))
                    }
                    _ => None,
                }
            })
        };

        if let Some((meta, data)) = replica {
            let hdr = DataHdr {
                bucket: obj.bucket.clone(),
                obj_name: obj.obj_name.clone(),
                attrs: ObjAttrs {
                    size: obj.obj_size,
                    version: meta.obj_version.clone(),
                    ..ObjAttrs::default()
                },
                opaque: Opaque::EcPush {
                    daemon_id: self.local.clone(),
                    stage: Stage::EcRepair,
                    reb_id: ctx.reb_id,
                    meta: meta.clone(),
                },
            };
            return self.save_ct_to_disk(ctx, &hdr, &meta, &data).await;
        }

        self.rebuild_from_slices(ctx, obj).await
    }

    /// Reconstruct the object from buffered slices, persist it, and send
    /// regenerated slices to fragment-free targets.
    async fn rebuild_from_slices(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
    ) -> Result<(), RebError> {
        let (present, meta_template, free_targets) = {
            let loc = obj.loc.lock().await;
            let mut present: Vec<(u16, Bytes)> = Vec::new();
            let mut meta_template = None;
            for slot in loc.by_daemon.values() {
                let (Some(buf), sid) = (&slot.buf, slot.ct.rec.slice_id) else {
                    continue;
                };
                if sid == 0 || buf.is_empty() {
                    continue;
                }
                present.push((sid, buf.clone()));
                if meta_template.is_none() {
                    meta_template = slot.ct.meta.clone();
                }
            }
            (present, meta_template, obj.empty_targets(&loc, &self.local))
        };

        let meta_template =
            meta_template.ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;
        info!(
            target_id = %self.local,
            uname = %obj.uid,
            slices = present.len(),
            "reconstructing object"
        );

        let rebuilt = tessera_erasure::reconstruct(
            obj.data_slices as usize,
            obj.parity_slices as usize,
            &present,
            obj.obj_size,
        )?;

        self.restore_object(obj, &meta_template, &rebuilt.object).await?;

        let mut free = free_targets.into_iter();
        let total = obj.data_slices + obj.parity_slices;
        for slice_id in 1..=total {
            if obj
                .ct_exist
                .get(slice_id as usize)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            let Some(target) = free.next() else {
                return Err(RebError::NoFreeTarget {
                    uname: obj.uid.clone(),
                    slice_id,
                });
            };
            let data = rebuilt.slices[(slice_id - 1) as usize].clone();
            self.send_rebuilt_slice(ctx, obj, slice_id, data, &meta_template, &target)
                .await?;
        }
        Ok(())
    }

    /// Regenerate missing slices from the full object already on disk and
    /// distribute them to fragment-free targets.
    async fn rebuild_from_disk(
        self: &Arc<Self>,
        ctx: &RunCtx,
        obj: &Arc<RebObject>,
        local_ct: Option<RebCt>,
        free_targets: Vec<TargetId>,
    ) -> Result<(), RebError> {
        let ct = local_ct.ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;
        let meta_template = ct
            .meta
            .clone()
            .ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;
        let path = ct
            .send_path()
            .cloned()
            .ok_or_else(|| RebError::MissingMeta(obj.uid.clone()))?;

        let data = tokio::fs::read(&path).await?;
        info!(
            target_id = %self.local,
            uname = %obj.uid,
            size = data.len(),
            "regenerating missing slices from the local object"
        );
        let slices =
            tessera_erasure::encode(&data, obj.data_slices as usize, obj.parity_slices as usize)?;

        let mut free = free_targets.into_iter();
        let total = obj.data_slices + obj.parity_slices;
        for slice_id in 1..=total {
            if obj
                .ct_exist
                .get(slice_id as usize)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            let Some(target) = free.next() else {
                return Err(RebError::NoFreeTarget {
                    uname: obj.uid.clone(),
                    slice_id,
                });
            };
            let data = slices[(slice_id - 1) as usize].clone();
            self.send_rebuilt_slice(ctx, obj, slice_id, data, &meta_template, &target)
                .await?;
        }
        Ok(())
    }

    /// Persist the reconstructed full object and its metadata on this
    /// (main) target.
    async fn restore_object(
        &self,
        obj: &RebObject,
        meta_template: &EcMetadata,
        data: &[u8],
    ) -> Result<(), RebError> {
        let mpath = hrw_mountpath(&self.mpaths, &obj.uid)
            .ok_or_else(|| RebError::MissingMeta(format!("{}: no mountpaths", obj.uid)))?;
        let obj_path = content_path(mpath, ContentKind::Object, &obj.bucket, &obj.obj_name);
        let meta_path = content_path(mpath, ContentKind::Metadata, &obj.bucket, &obj.obj_name);

        let mut meta = meta_template.clone();
        meta.slice_id = 0;

        let _guard = self.locker.exclusive(&obj.uid).await;

        let meta_work = workfile_path(mpath, &obj.bucket, &obj.obj_name, "meta");
        if let Err(e) = save_meta(&meta_path, &meta_work, &meta).await {
            self.report_fs_error(&e, &meta_path);
            return Err(e.into());
        }

        let data_work = workfile_path(mpath, &obj.bucket, &obj.obj_name, "ec");
        if let Err(e) = save_atomic(&obj_path, &data_work, data).await {
            self.report_fs_error(&e, &obj_path);
            if let Err(rm) = tokio::fs::remove_file(&meta_path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %meta_path.display(), error = %rm, "cleanup after failed restore");
                }
            }
            return Err(e.into());
        }

        info!(uname = %obj.uid, size = data.len(), path = %obj_path.display(), "object restored");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Batch finalization
    // -----------------------------------------------------------------

    /// Quiesce, sweep, rebuild, drain ACKs, and pass the batch barrier.
    async fn finalize_batch(self: &Arc<Self>, ctx: &RunCtx, start: usize) -> Result<(), RebError> {
        if self.wait_quiesce(ctx, ctx.config.rebalance.quiesce).await {
            return Err(RebError::Aborted("finalize batch".into()));
        }
        self.all_ct_received(ctx, start).await?;
        self.wait_ec_ack(ctx).await?;

        let mark = StageMark::batch(start as u64);
        debug!(target_id = %self.local, %mark, "batch done, waiting for the cluster");
        self.set_stage(mark);
        self.wait_all_stage(ctx, mark).await
    }

    /// Wait until everything handed to the transport has left, then log
    /// whatever never got acknowledged.
    async fn wait_ec_ack(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let sleep = ctx.config.timeout.cplane_op;
        while self.on_air.load(Ordering::Acquire) > 0 {
            if self.is_aborted() {
                self.on_air.store(0, Ordering::Release);
                return Ok(());
            }
            tokio::time::sleep(sleep).await;
        }

        if self.wait_quiesce(ctx, sleep).await {
            return Ok(());
        }
        self.log_no_ack();
        Ok(())
    }

    /// Unacknowledged sends are logged and dropped — the next rebalance
    /// pass or the scrubber picks them up.
    fn log_no_ack(&self) {
        for ack in self.ec.acks.drain() {
            warn!(
                target_id = %self.local,
                to = %ack.daemon_id,
                bucket = %ack.bucket,
                obj = %ack.obj_name,
                slice_id = ack.slice_id,
                "fragment never acknowledged"
            );
        }
    }

    /// Free batch scratch state: payload buffers and leftover ACK entries.
    async fn cleanup_batch(&self, ctx: &RunCtx, start: usize) {
        for obj in self.batch_objects(ctx, start, 1) {
            let mut loc = obj.loc.lock().await;
            for slot in loc.by_daemon.values_mut() {
                slot.buf = None;
            }
        }
        let _ = self.ec.acks.drain();
    }
}
