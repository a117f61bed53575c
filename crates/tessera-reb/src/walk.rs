//! CT walker: enumerate every EC fragment reachable on local disk.
//!
//! One walker task per mountpath descends the metadata subtree of every
//! EC-enabled bucket. For each sidecar it loads the record, verifies the
//! companion fragment exists, computes the HRW-correct location and emits a
//! [`RebCt`] tagged with the local daemon id. Traversal order is
//! irrelevant — determinism is re-established by the global sort later.

use std::path::Path;
use std::sync::Arc;

use tessera_fs::{content_path, hrw_mountpath, load_meta, walk_files, ContentKind, Mountpath};
use tessera_types::Bucket;
use tracing::{debug, warn};

use crate::ct::{CtRecord, RebCt};
use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

impl RebManager {
    /// Walk every mountpath and collect the local CT inventory.
    pub(crate) async fn run_ec_walk(
        self: &Arc<Self>,
        ctx: &RunCtx,
        buckets: &[Bucket],
    ) -> Result<(), RebError> {
        let mut handles = Vec::new();
        for mpath in &self.mpaths {
            let this = self.clone();
            let mpath = mpath.clone();
            let buckets = buckets.to_vec();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                this.jog_ec(&ctx, &mpath, &buckets).await
            }));
        }

        let mut cts = Vec::new();
        for h in handles {
            let part = h.await.map_err(|e| RebError::Net(e.to_string()))??;
            cts.extend(part);
        }

        debug!(target_id = %self.local, found = cts.len(), "local CT walk complete");
        self.ec
            .cts
            .lock()
            .expect("ec cts poisoned")
            .insert(self.local.clone(), cts);
        Ok(())
    }

    /// Walk the metadata subtrees of one mountpath.
    async fn jog_ec(
        &self,
        ctx: &RunCtx,
        mpath: &Mountpath,
        buckets: &[Bucket],
    ) -> Result<Vec<RebCt>, RebError> {
        let mut out = Vec::new();
        for bck in buckets {
            let root = content_path(mpath, ContentKind::Metadata, bck, "");
            let files = match walk_files(&root).await {
                Ok(f) => f,
                Err(e) => {
                    // A bucket-level failure halts traversal for this
                    // bucket only.
                    warn!(bucket = %bck, mpath = mpath.label(), error = %e, "bucket traversal failed");
                    continue;
                }
            };

            for meta_path in files {
                if self.is_aborted() {
                    return Err(RebError::Aborted("ct walk".into()));
                }
                if let Some(ct) = self.walk_one(ctx, mpath, bck, &root, &meta_path).await {
                    out.push(ct);
                }
            }
        }
        Ok(out)
    }

    /// Turn one metadata sidecar into a CT record, or skip it.
    async fn walk_one(
        &self,
        _ctx: &RunCtx,
        mpath: &Mountpath,
        bck: &Bucket,
        meta_root: &Path,
        meta_path: &Path,
    ) -> Option<RebCt> {
        let obj_name = meta_path
            .strip_prefix(meta_root)
            .ok()?
            .to_string_lossy()
            .into_owned();

        let md = match load_meta(meta_path).await {
            Ok(md) => md,
            Err(e) => {
                warn!(path = %meta_path.display(), error = %e, "damaged metadata sidecar, skipping");
                return None;
            }
        };

        let kind = if md.is_replica() {
            ContentKind::Object
        } else {
            ContentKind::Slice
        };
        let real = content_path(mpath, kind, bck, &obj_name);
        if tokio::fs::metadata(&real).await.is_err() {
            warn!(
                path = %real.display(),
                slice_id = md.slice_id,
                "metadata without companion fragment, skipping"
            );
            return None;
        }

        let uname = bck.uname(&obj_name);
        let hrw_mp = hrw_mountpath(&self.mpaths, &uname)?;
        let hrw = content_path(hrw_mp, kind, bck, &obj_name);

        Some(RebCt {
            rec: CtRecord {
                bucket: bck.clone(),
                obj_name,
                daemon_id: self.local.clone(),
                obj_hash: md.obj_cksum.clone(),
                obj_size: md.obj_size,
                slice_id: md.slice_id,
                data_slices: md.data_slices,
                parity_slices: md.parity_slices,
            },
            real_path: Some(real),
            hrw_path: Some(hrw),
            src_mpath: Some(mpath.clone()),
            meta: Some(md),
        })
    }

    /// The local CT list collected by the walk, as wire records.
    pub(crate) fn local_ct_records(&self) -> Vec<CtRecord> {
        self.ec
            .cts
            .lock()
            .expect("ec cts poisoned")
            .get(&self.local)
            .map(|v| v.iter().map(|ct| ct.rec.clone()).collect())
            .unwrap_or_default()
    }
}
