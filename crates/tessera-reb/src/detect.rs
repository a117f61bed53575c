//! Builder, classifier and broken-object detector.
//!
//! Once every peer's CT inventory is in, each target independently merges
//! the lists into one global view, computes per-object placement facts and
//! extracts the deterministically ordered list of objects that need repair.
//! Determinism is a protocol invariant: batched object indices must agree
//! across the whole cluster, so everything here is a pure function of the
//! inventories and the map snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ct::{
    CtSlot, GlobalCtList, LocCt, ObjDraft, RebCt, RebObject, OBJ_WAITING,
};
use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

impl RebManager {
    /// Merge, classify, detect: fills the broken list and local actions.
    pub(crate) async fn check_cts(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let global = self.merge_cts(ctx);
        let broken = self.detect_broken(ctx, &global);
        info!(
            target_id = %self.local,
            broken = broken.len(),
            local_moves = self.ec.local_actions.lock().expect("local actions poisoned").len(),
            "broken-object detection complete"
        );
        self.set_last_broken(broken.len());
        *self.ec.broken.write().expect("broken poisoned") = broken;
        Ok(())
    }

    /// Merge every target's inventory into the global CT view.
    ///
    /// Also records local fragments whose real path differs from their HRW
    /// path — those become resilver moves.
    pub(crate) fn merge_cts(&self, ctx: &RunCtx) -> GlobalCtList {
        let mut global = GlobalCtList::default();

        let by_node = {
            let cts = self.ec.cts.lock().expect("ec cts poisoned");
            cts.clone()
        };

        // smap key order makes the merge identical on every target.
        for tid in ctx.smap.targets.keys() {
            let Some(list) = by_node.get(tid) else {
                continue;
            };
            let local = *tid == self.local;

            for ct in list {
                let uname = ct.rec.uname();

                // Main targets host the full object, never a slice. A slice
                // reported by the object's main is an orphan left behind by
                // an earlier failure; it is skipped here, not cleaned up.
                if ct.rec.slice_id != 0 {
                    if let Some(main) = ctx.smap.main_target(&uname) {
                        if ct.rec.daemon_id == main {
                            info!(
                                %uname,
                                slice_id = ct.rec.slice_id,
                                daemon = %ct.rec.daemon_id,
                                "skipping slice on main target"
                            );
                            continue;
                        }
                    }
                }

                add_ct(&mut global, ctx, ct.clone());

                if local && ct.is_misplaced() {
                    debug!(%uname, slice_id = ct.rec.slice_id, "local fragment misplaced");
                    self.ec
                        .local_actions
                        .lock()
                        .expect("local actions poisoned")
                        .push(ct.clone());
                }
            }
        }
        global
    }

    /// Compute the placement facts the local target derives for one object.
    pub(crate) fn calc_local_props(
        &self,
        ctx: &RunCtx,
        draft: &ObjDraft,
    ) -> Result<RebObject, RebError> {
        let uname = draft.bucket.uname(&draft.obj_name);
        let cts = draft.newest();
        let first = cts
            .first()
            .ok_or_else(|| RebError::MissingMeta(uname.clone()))?;

        let obj_size = first.rec.obj_size;
        let data_slices = first.rec.data_slices;
        let parity_slices = first.rec.parity_slices;
        let is_ec_copy = ctx.config.ec.is_replicated(obj_size);
        let slice_size = tessera_erasure::slice_size(obj_size, data_slices.max(1) as usize);
        let required = if is_ec_copy {
            parity_slices as usize + 1
        } else {
            (data_slices + parity_slices) as usize + 1
        };

        let mut loc = LocCt::default();
        let mut ct_exist = vec![false; required];
        let mut has_ct = false;
        let mut main_has_any = false;
        let mut main_slice_id = 0u16;
        let mut full_obj_found = false;
        let mut slice_cnt = 0u16;

        for ct in cts {
            let sid = ct.rec.slice_id as usize;
            if sid >= required {
                warn!(%uname, slice_id = sid, required, "slice id out of range, skipping fragment");
                continue;
            }
            if ct.rec.daemon_id == self.local {
                has_ct = true;
            }
            if ct.rec.daemon_id == draft.main_daemon {
                main_has_any = true;
                main_slice_id = ct.rec.slice_id;
            }
            if ct.rec.slice_id == 0 {
                full_obj_found = true;
            } else {
                slice_cnt += 1;
            }
            ct_exist[sid] = true;
            loc.by_daemon.insert(
                ct.rec.daemon_id.clone(),
                CtSlot {
                    ct: ct.clone(),
                    buf: None,
                },
            );
        }

        let found_ct = loc.by_daemon.len();
        let has_all_slices = slice_cnt >= data_slices + parity_slices;

        let gen_count = required.max(ctx.smap.len());
        let hrw_targets = ctx.smap.hrw_targets(&uname, gen_count);

        // Does HRW want a fragment on this target? Only the first
        // `required` positions matter, and only as many of them as there
        // are fragments still unplaced.
        let mut in_hrw_list = false;
        let mut to_check = required.saturating_sub(found_ct);
        for t in hrw_targets.iter().take(required) {
            if to_check == 0 {
                break;
            }
            if *t == self.local {
                in_hrw_list = true;
                break;
            }
            if !loc.by_daemon.contains_key(t) {
                to_check -= 1;
            }
        }

        // The replica sender: first HRW target actually holding a fragment.
        let sender = hrw_targets
            .iter()
            .find(|t| loc.by_daemon.contains_key(*t))
            .cloned();
        if sender.is_none() {
            return Err(RebError::MissingMeta(format!(
                "{uname}: no holder among HRW targets"
            )));
        }

        let is_main = draft.main_daemon == self.local;
        debug!(
            %uname,
            has_ct,
            full_obj_found,
            is_main,
            main_has_any,
            main_slice_id,
            found = found_ct,
            required,
            has_all_slices,
            in_hrw_list,
            "object classified"
        );

        Ok(RebObject {
            bucket: draft.bucket.clone(),
            obj_name: draft.obj_name.clone(),
            uid: uname,
            obj_size,
            slice_size,
            data_slices,
            parity_slices,
            is_ec_copy,
            main_daemon: draft.main_daemon.clone(),
            hrw_targets,
            sender,
            main_has_any,
            main_slice_id,
            has_ct,
            is_main,
            in_hrw_list,
            full_obj_found,
            has_all_slices,
            found_ct,
            ct_exist,
            ready: AtomicU8::new(OBJ_WAITING),
            loc: tokio::sync::Mutex::new(loc),
        })
    }

    /// Extract the broken-object list in deterministic order.
    pub(crate) fn detect_broken(&self, ctx: &RunCtx, global: &GlobalCtList) -> Vec<Arc<RebObject>> {
        let mut broken = Vec::new();

        for bcks in [&global.ais, &global.remote] {
            for rb in bcks.values() {
                for draft in rb.objs.values() {
                    let obj = match self.calc_local_props(ctx, draft) {
                        Ok(o) => o,
                        Err(e) => {
                            warn!(error = %e, "classification failed, skipping object");
                            continue;
                        }
                    };

                    // An object whose main holds the full object (or, for
                    // replicated objects, any copy) needs no transfer to
                    // main — but an EC object missing slices still needs
                    // them regenerated.
                    let main_has_object =
                        (obj.main_slice_id == 0 || obj.is_ec_copy) && obj.main_has_any;
                    if main_has_object && (obj.is_ec_copy || obj.has_all_slices) {
                        debug!(uname = %obj.uid, "main has the object, skipping");
                        continue;
                    }
                    broken.push(Arc::new(obj));
                }
            }
        }

        // Provider class first (native before remote), then bucket, then
        // object name — identical on every target by construction.
        broken.sort_by(|a, b| {
            (a.bucket.provider, &a.bucket.name, &a.obj_name).cmp(&(
                b.bucket.provider,
                &b.bucket.name,
                &b.obj_name,
            ))
        });
        broken
    }

    /// Drop per-run EC temporaries once repair is complete.
    pub(crate) fn cleanup_ec(&self) {
        self.ec.cts.lock().expect("ec cts poisoned").clear();
        self.ec
            .local_actions
            .lock()
            .expect("local actions poisoned")
            .clear();
        self.ec.broken.write().expect("broken poisoned").clear();
    }
}

/// Merge one fragment into the global view.
///
/// Non-zero slice ids must be unique within an object's hash group; on a
/// collision the HRW-earlier holder wins so every target resolves the
/// duplicate identically. When the winner changes, the local paths travel
/// with the record so a local winner can still send from disk. Zero-slice
/// duplicates (several full copies) are all kept — that is valid input for
/// the detector.
fn add_ct(global: &mut GlobalCtList, ctx: &RunCtx, ct: RebCt) {
    let uname = ct.rec.uname();
    let bcks = match ct.rec.bucket.provider {
        tessera_types::Provider::Ais => &mut global.ais,
        tessera_types::Provider::Remote => &mut global.remote,
    };
    let bck = bcks.entry(ct.rec.bucket.name.clone()).or_default();
    let draft = bck
        .objs
        .entry(ct.rec.obj_name.clone())
        .or_insert_with(|| ObjDraft {
            bucket: ct.rec.bucket.clone(),
            obj_name: ct.rec.obj_name.clone(),
            main_daemon: ctx
                .smap
                .main_target(&uname)
                .unwrap_or_else(|| ct.rec.daemon_id.clone()),
            groups: BTreeMap::new(),
        });

    if ct.rec.slice_id != 0 {
        if let Some(group) = draft.groups.get_mut(&ct.rec.obj_hash) {
            if let Some(found) = group.iter_mut().find(|c| c.rec.slice_id == ct.rec.slice_id) {
                let order = ctx.smap.hrw_targets(&uname, ctx.smap.len());
                for t in &order {
                    if *t == found.rec.daemon_id {
                        warn!(
                            %uname,
                            slice_id = ct.rec.slice_id,
                            loser = %ct.rec.daemon_id,
                            "duplicated slice discarded"
                        );
                        return;
                    }
                    if *t == ct.rec.daemon_id {
                        warn!(
                            %uname,
                            slice_id = ct.rec.slice_id,
                            loser = %found.rec.daemon_id,
                            winner = %ct.rec.daemon_id,
                            "duplicated slice replaced"
                        );
                        found.rec.daemon_id = ct.rec.daemon_id.clone();
                        if found.meta.is_none() {
                            found.meta = ct.meta.clone();
                        }
                        found.real_path = ct.real_path.clone();
                        found.hrw_path = ct.hrw_path.clone();
                        found.src_mpath = ct.src_mpath.clone();
                        return;
                    }
                }
                return;
            }
        }
    }

    draft
        .groups
        .entry(ct.rec.obj_hash.clone())
        .or_default()
        .push(ct);
}
