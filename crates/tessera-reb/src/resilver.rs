//! Local resilvering: move fragments to their HRW-correct mountpath.
//!
//! Two flavors share the machinery. The EC local-actions pass runs inside
//! a rebalance, moving fragments the merge discovered on the wrong
//! mountpath (metadata first, then the fragment, then the sources are
//! removed). The standalone resilver walks the object trees and copies
//! misplaced objects to their correct mountpath, keeping the source — the
//! space reclaimer removes obsolete copies later.

use std::sync::Arc;

use tessera_fs::{
    clear_marker, content_path, copy_atomic, hrw_mountpath, put_marker, workfile_path,
    ContentKind, Marker, Mountpath,
};
use tessera_types::{Bucket, Provider};
use tracing::{debug, error, info, warn};

use crate::ct::RebCt;
use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

impl RebManager {
    /// Execute the local-actions list produced by the merge.
    ///
    /// Failures feed the filesystem health checker and abort the current
    /// rebalance: a target that cannot trust its disks must not keep
    /// shipping fragments around.
    pub(crate) async fn resilver_local_actions(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let actions: Vec<RebCt> = {
            let mut acts = self.ec.local_actions.lock().expect("local actions poisoned");
            std::mem::take(&mut *acts)
        };
        if actions.is_empty() {
            return Ok(());
        }
        info!(target_id = %self.local, moves = actions.len(), "resilvering misplaced fragments");

        for act in actions {
            if self.is_aborted() {
                return Err(RebError::Aborted("local resilver".into()));
            }
            if let Err(e) = self.resilver_one(ctx, &act).await {
                error!(
                    uname = %act.rec.uname(),
                    slice_id = act.rec.slice_id,
                    error = %e,
                    "local resilver failed"
                );
                self.abort();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn resilver_one(&self, _ctx: &RunCtx, act: &RebCt) -> Result<(), RebError> {
        let uname = act.rec.uname();
        let (real, src_mpath) = match (&act.real_path, &act.src_mpath) {
            (Some(r), Some(m)) => (r, m),
            _ => return Ok(()), // nothing local to move
        };
        let Some(dst_mpath) = hrw_mountpath(&self.mpaths, &uname) else {
            return Ok(());
        };
        let hrw = match &act.hrw_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        debug!(%uname, from = %real.display(), to = %hrw.display(), "moving fragment");

        let bck = &act.rec.bucket;
        let obj = &act.rec.obj_name;
        let meta_src = content_path(src_mpath, ContentKind::Metadata, bck, obj);
        let meta_dst = content_path(dst_mpath, ContentKind::Metadata, bck, obj);

        // Metadata travels first so a crash between the two copies leaves
        // a discoverable fragment, not an orphan.
        let meta_work = workfile_path(dst_mpath, bck, obj, "meta");
        if let Err(e) = copy_atomic(&meta_src, &meta_dst, &meta_work).await {
            self.report_fs_error(&e, &meta_dst);
            return Err(e.into());
        }

        let is_object = act.rec.slice_id == 0;
        let data_work = workfile_path(dst_mpath, bck, obj, "resilver");
        let copy_res = if is_object {
            // Whole objects move under the exclusive name lock shared with
            // foreground I/O.
            let _guard = self.locker.exclusive(&uname).await;
            copy_atomic(real, &hrw, &data_work).await
        } else {
            copy_atomic(real, &hrw, &data_work).await
        };

        if let Err(e) = copy_res {
            self.report_fs_error(&e, &hrw);
            if let Err(rm) = tokio::fs::remove_file(&meta_dst).await {
                warn!(path = %meta_dst.display(), error = %rm, "cleanup of copied metadata failed");
            }
            return Err(e.into());
        }

        // Sources go last; leftover sources are harmless duplicates.
        if let Err(e) = tokio::fs::remove_file(real).await {
            warn!(path = %real.display(), error = %e, "failed to remove moved fragment");
        }
        if meta_src != meta_dst {
            if let Err(e) = tokio::fs::remove_file(&meta_src).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %meta_src.display(), error = %e, "failed to remove moved metadata");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn report_fs_error(&self, err: &tessera_fs::FsError, path: &std::path::Path) {
        if let tessera_fs::FsError::Io(io) = err {
            self.health.on_error(io, path);
        }
    }

    // -----------------------------------------------------------------
    // Standalone resilver
    // -----------------------------------------------------------------

    /// Copy every locally misplaced object to its HRW-correct mountpath.
    ///
    /// Sources are kept: a concurrently running rebalance may still read
    /// them, and the space reclaimer removes obsolete copies.
    pub async fn run_resilver(self: &Arc<Self>) -> Result<(), RebError> {
        put_marker(&self.conf_dir, Marker::Resilver).await?;
        info!(target_id = %self.local, mpaths = self.mpaths.len(), "resilver starting");

        let mut handles = Vec::new();
        for mpath in &self.mpaths {
            let this = self.clone();
            let mpath = mpath.clone();
            handles.push(tokio::spawn(async move { this.resilver_jog(&mpath).await }));
        }

        let mut res = Ok(());
        for h in handles {
            match h.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => res = Err(e),
                Err(e) => res = Err(RebError::Net(e.to_string())),
            }
        }

        if res.is_ok() {
            clear_marker(&self.conf_dir, Marker::Resilver).await?;
        }
        info!(target_id = %self.local, ok = res.is_ok(), "resilver finished");
        res
    }

    async fn resilver_jog(&self, mpath: &Mountpath) -> Result<(), RebError> {
        for (bck, obj, path) in self.walk_objects(mpath).await? {
            // EC fragments move via the rebalance local-actions pass.
            let meta = content_path(mpath, ContentKind::Metadata, &bck, &obj);
            if tokio::fs::metadata(&meta).await.is_ok() {
                continue;
            }
            let uname = bck.uname(&obj);
            let Some(correct) = hrw_mountpath(&self.mpaths, &uname) else {
                continue;
            };
            if correct.label() == mpath.label() {
                continue;
            }

            let dst = content_path(correct, ContentKind::Object, &bck, &obj);
            let work = workfile_path(correct, &bck, &obj, "resilver");
            debug!(%uname, from = %path.display(), to = %dst.display(), "copying misplaced object");

            let _guard = self.locker.exclusive(&uname).await;
            if let Err(e) = copy_atomic(&path, &dst, &work).await {
                self.report_fs_error(&e, &dst);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Enumerate `(bucket, object, path)` for every object file on a
    /// mountpath.
    pub(crate) async fn walk_objects(
        &self,
        mpath: &Mountpath,
    ) -> Result<Vec<(Bucket, String, std::path::PathBuf)>, RebError> {
        let mut out = Vec::new();
        for provider in [Provider::Ais, Provider::Remote] {
            let provider_root = mpath
                .path()
                .join(ContentKind::Object.dir())
                .join(provider.to_string());
            let mut buckets = match tokio::fs::read_dir(&provider_root).await {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = buckets.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let bck_name = entry.file_name().to_string_lossy().into_owned();
                let bck = Bucket {
                    name: bck_name,
                    provider,
                };
                let bck_root = entry.path();
                for file in tessera_fs::walk_files(&bck_root).await? {
                    let Ok(rel) = file.strip_prefix(&bck_root) else {
                        continue;
                    };
                    out.push((bck.clone(), rel.to_string_lossy().into_owned(), file));
                }
            }
        }
        Ok(out)
    }
}
