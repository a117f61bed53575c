//! Rebalance status reporting and local control-plane queries.

use bytes::Bytes;
use tessera_fs::{content_path, load_meta, ContentKind};
use tessera_types::{Bucket, EcMetadata, RebStatus, Stage, TargetId};
use tracing::debug;

use crate::manager::RebManager;

impl RebManager {
    /// Build the status report served on `rebstatus` queries.
    pub fn status(&self) -> RebStatus {
        let mark = self.stages.self_mark();
        let smap = self.smap_owner.get();
        let delta = self.stats.snapshot().delta_since(&self.begin_snapshot());

        let mut status = RebStatus {
            stage: mark.stage,
            batch: mark.batch,
            smap_version: smap.version,
            reb_version: self.reb_version(),
            reb_id: self.current_ctx().map(|c| c.reb_id).unwrap_or(0),
            aborted: self.is_aborted(),
            running: self.is_running(),
            ack_waiting: Vec::new(),
            stats: delta,
        };

        // During the ack wait, report which targets this node still awaits
        // object confirmations from — peers use it to decide whether they
        // may finish.
        if mark.stage == Stage::WaitAck {
            if let Some(ctx) = self.current_ctx() {
                let mut waiting: Vec<TargetId> = self
                    .lom_acks
                    .collect()
                    .into_iter()
                    .filter_map(|h| ctx.smap.main_target(&h.uname))
                    .collect();
                waiting.sort();
                waiting.dedup();
                status.ack_waiting = waiting;
            }
        }
        status
    }

    /// Presence probe: does any local mountpath hold the full object?
    pub async fn head_object(&self, bucket: &Bucket, obj_name: &str) -> bool {
        for mpath in &self.mpaths {
            let path = content_path(mpath, ContentKind::Object, bucket, obj_name);
            if tokio::fs::metadata(&path).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Serve a fragment and its metadata from local disk.
    ///
    /// `slice_id` 0 asks for the full object; otherwise the stored slice
    /// must match the requested id.
    pub async fn fetch_ct(
        &self,
        bucket: &Bucket,
        obj_name: &str,
        slice_id: u16,
    ) -> Option<(EcMetadata, Bytes)> {
        for mpath in &self.mpaths {
            let meta_path = content_path(mpath, ContentKind::Metadata, bucket, obj_name);
            let md = match load_meta(&meta_path).await {
                Ok(md) => md,
                Err(_) => continue,
            };
            if md.slice_id != slice_id {
                debug!(
                    uname = %bucket.uname(obj_name),
                    stored = md.slice_id,
                    requested = slice_id,
                    "fragment id mismatch"
                );
                continue;
            }
            let kind = if slice_id == 0 {
                ContentKind::Object
            } else {
                ContentKind::Slice
            };
            let path = content_path(mpath, kind, bucket, obj_name);
            match tokio::fs::read(&path).await {
                Ok(data) => return Some((md, Bytes::from(data))),
                Err(_) => continue,
            }
        }
        None
    }
}
