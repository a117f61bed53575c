//! Namespace exchange: ship the local CT inventory to every peer.
//!
//! Each target pushes its CT list to all peers with a bounded number of
//! retries, re-attempting only the peers whose send failed. A target that
//! stays unreachable after the final round is fatal to the local run. The
//! receive side stores a peer's list verbatim and marks the peer as having
//! reached the namespace stage.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_net::{DataHdr, Opaque};
use tessera_types::{Bucket, ObjAttrs, Stage, StageMark, TargetId};
use tracing::{debug, error, warn};

use crate::ct::{CtRecord, RebCt};
use crate::error::RebError;
use crate::manager::{RebManager, RunCtx};

/// Send rounds before giving up on a peer.
const EXCHANGE_RETRIES: usize = 3;
/// Delay between send rounds.
const EXCHANGE_RETRY_SLEEP: Duration = Duration::from_secs(5);

impl RebManager {
    /// Push the local CT inventory to every peer, with retries.
    pub(crate) async fn exchange_namespace(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let records = self.local_ct_records();
        let payload = Bytes::from(
            postcard::to_allocvec(&records).map_err(|e| RebError::Net(e.to_string()))?,
        );

        let mut pending: Vec<TargetId> = ctx
            .smap
            .targets
            .keys()
            .filter(|t| **t != self.local)
            .cloned()
            .collect();

        for round in 0..EXCHANGE_RETRIES {
            let mut failed = Vec::new();
            for peer in &pending {
                if self.is_aborted() {
                    return Err(RebError::Aborted("namespace exchange".into()));
                }
                let hdr = DataHdr {
                    bucket: Bucket::ais(""),
                    obj_name: String::new(),
                    attrs: ObjAttrs {
                        size: payload.len() as u64,
                        ..ObjAttrs::default()
                    },
                    opaque: Opaque::EcNamespace {
                        daemon_id: self.local.clone(),
                        reb_id: ctx.reb_id,
                    },
                };
                match self.transport.send_data(peer, hdr, payload.clone()).await {
                    Ok(()) => {
                        self.stats.add_tx(payload.len() as u64);
                        debug!(target_id = %self.local, %peer, cts = records.len(), "namespace sent");
                    }
                    Err(e) => {
                        error!(target_id = %self.local, %peer, error = %e, "namespace send failed");
                        failed.push(peer.clone());
                    }
                }
            }

            if failed.is_empty() {
                return Ok(());
            }
            pending = failed;
            if round + 1 < EXCHANGE_RETRIES {
                tokio::time::sleep(EXCHANGE_RETRY_SLEEP).await;
            }
        }

        self.abort();
        Err(RebError::Exchange {
            unreached: pending.len(),
        })
    }

    /// Store a peer's pushed inventory and advance its stage mark.
    pub(crate) fn recv_namespace(&self, daemon_id: TargetId, reb_id: u64, payload: Bytes) {
        let current = self.current_ctx().map(|c| c.reb_id).unwrap_or(0);
        if reb_id != current {
            // The peer raced ahead of our own start; the namespace wait
            // will pull the inventory back once we are running.
            warn!(
                target_id = %self.local,
                from = %daemon_id,
                got = reb_id,
                current,
                "namespace for a different rebalance, dropping"
            );
            return;
        }
        self.store_namespace(daemon_id, &payload);
    }

    fn store_namespace(&self, daemon_id: TargetId, payload: &[u8]) {
        let records: Vec<CtRecord> = match postcard::from_bytes(payload) {
            Ok(r) => r,
            Err(e) => {
                error!(from = %daemon_id, error = %e, "failed to decode namespace");
                return;
            }
        };
        debug!(target_id = %self.local, from = %daemon_id, cts = records.len(), "namespace received");

        let cts = records.into_iter().map(RebCt::remote).collect();
        self.ec
            .cts
            .lock()
            .expect("ec cts poisoned")
            .insert(daemon_id.clone(), cts);
        self.stages
            .set(&daemon_id, StageMark::new(Stage::EcNamespace));
    }

    /// The encoded local inventory, servable to peers pulling it.
    ///
    /// `None` outside the window where the inventory is valid: before the
    /// walk finished, or once cleanup may have released it.
    pub fn namespace_payload(&self) -> Option<Bytes> {
        if !self.is_running() {
            return None;
        }
        let mark = self.stages.self_mark();
        if mark.stage < Stage::EcNamespace || mark.stage >= Stage::EcCleanup {
            return None;
        }
        let records = self.local_ct_records();
        postcard::to_allocvec(&records).ok().map(Bytes::from)
    }

    /// True when `peer`'s inventory has arrived.
    fn has_namespace_from(&self, peer: &TargetId) -> bool {
        self.ec
            .cts
            .lock()
            .expect("ec cts poisoned")
            .contains_key(peer)
    }

    /// Block until every peer's inventory is present locally.
    ///
    /// Stage reports alone are not enough — the merge needs the data, so
    /// the barrier checks arrival. Laggards are status-polled to catch
    /// aborts and newer cluster maps.
    pub(crate) async fn wait_namespaces(&self, ctx: &RunCtx) -> Result<(), RebError> {
        let deadline = tokio::time::Instant::now() + ctx.config.rebalance.dest_retry;
        loop {
            if self.is_aborted() {
                return Err(RebError::Aborted("waiting for namespaces".into()));
            }

            let missing: Vec<TargetId> = ctx
                .smap
                .targets
                .keys()
                .filter(|t| **t != self.local && !self.has_namespace_from(t))
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(());
            }

            for peer in &missing {
                if let Ok(st) = self.client.reb_status(peer).await {
                    if st.smap_version > ctx.smap.version {
                        self.abort();
                        return Err(RebError::Aborted(format!(
                            "peer {peer} has newer cluster map v{}",
                            st.smap_version
                        )));
                    }
                    // The peer passed its exchange but our copy of its push
                    // got lost (e.g. we started late): pull it back.
                    if st.stage >= Stage::EcNamespace && st.reb_version == ctx.smap.version {
                        if let Ok(Some(payload)) = self.client.fetch_namespace(peer).await {
                            self.store_namespace(peer.clone(), &payload);
                        }
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.abort();
                return Err(RebError::Timeout(format!(
                    "namespaces from {} peers",
                    missing.len()
                )));
            }
            tokio::time::sleep(ctx.config.timeout.cplane_op).await;
        }
    }
}
