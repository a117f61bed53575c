//! The rebalance manager: state, lifecycle and stage sequencing.
//!
//! One [`RebManager`] per target owns every moving part of a rebalance run:
//! the stage table, the EC state, the vanilla ack table, the transport
//! seams and the abort flag. A run is strictly serialized — the stage CAS
//! guarantees at most one active run per target — and captures immutable
//! snapshots of the cluster map and configuration at start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tessera_cluster::{Smap, SmapOwner};
use tessera_fs::{
    clear_marker, put_marker, FsHealth, Marker, Mountpath, NameLocker,
};
use tessera_net::{DataHdr, Opaque};
use tessera_types::{
    Bucket, RebConfig, RebStats, RebStatsSnapshot, Stage, StageMark, TargetId,
};
use tracing::{debug, error, info, warn};

use crate::ct::{AckTable, PendingAck, RebCt, RebObject};
use crate::error::RebError;
use crate::stage::StageTracker;
use crate::transport::{PeerClient, RebTransport};
use crate::vanilla::LomAckTable;

/// Everything a [`RebManager`] needs at construction.
pub struct RebManagerArgs {
    /// This target's id.
    pub local: TargetId,
    /// Local mountpaths.
    pub mpaths: Vec<Mountpath>,
    /// Config directory for persistent markers.
    pub conf_dir: PathBuf,
    /// Cluster map handle.
    pub smap_owner: Arc<SmapOwner>,
    /// Outbound stream bundles.
    pub transport: Arc<dyn RebTransport>,
    /// Control-plane client.
    pub client: Arc<dyn PeerClient>,
    /// Filesystem health sink.
    pub health: Arc<dyn FsHealth>,
    /// Engine configuration.
    pub config: RebConfig,
}

/// EC-specific rebalance state, reset per run.
#[derive(Default)]
pub(crate) struct EcState {
    /// CT inventories per target (self included).
    pub cts: Mutex<HashMap<TargetId, Vec<RebCt>>>,
    /// Broken objects in deterministic order.
    pub broken: RwLock<Vec<Arc<RebObject>>>,
    /// Local fragments sitting on the wrong mountpath.
    pub local_actions: Mutex<Vec<RebCt>>,
    /// Outbound EC fragments awaiting confirmation.
    pub acks: AckTable,
    /// Index of the first object of the current batch.
    pub curr_batch: AtomicUsize,
}

impl EcState {
    fn reset(&self) {
        self.cts.lock().expect("ec cts poisoned").clear();
        self.broken.write().expect("broken poisoned").clear();
        self.local_actions
            .lock()
            .expect("local actions poisoned")
            .clear();
        self.acks.drain();
        self.curr_batch.store(0, Ordering::Release);
    }
}

/// Immutable context of one rebalance run.
#[derive(Clone)]
pub(crate) struct RunCtx {
    /// Cluster map snapshot the run operates on.
    pub smap: Arc<Smap>,
    /// Configuration snapshot.
    pub config: Arc<RebConfig>,
    /// Monotonic run id.
    pub reb_id: u64,
}

/// Per-target rebalance engine.
pub struct RebManager {
    pub(crate) local: TargetId,
    pub(crate) mpaths: Vec<Mountpath>,
    pub(crate) conf_dir: PathBuf,
    pub(crate) smap_owner: Arc<SmapOwner>,
    pub(crate) transport: Arc<dyn RebTransport>,
    pub(crate) client: Arc<dyn PeerClient>,
    pub(crate) health: Arc<dyn FsHealth>,
    pub(crate) locker: NameLocker,
    pub(crate) stages: StageTracker,
    pub(crate) stats: RebStats,
    begin_stats: Mutex<RebStatsSnapshot>,
    config: RwLock<Arc<RebConfig>>,
    reb_id: AtomicU64,
    reb_smap: RwLock<Option<Arc<Smap>>>,
    run_config: RwLock<Arc<RebConfig>>,
    aborted: AtomicBool,
    running: AtomicBool,
    /// Fragments handed to the transport but not yet confirmed sent.
    pub(crate) on_air: AtomicI64,
    /// Set on every inbound frame; cleared by quiescence probes.
    pub(crate) laterx: AtomicBool,
    pub(crate) ec: EcState,
    pub(crate) lom_acks: LomAckTable,
    last_broken: AtomicUsize,
}

impl RebManager {
    /// Build a manager.
    pub fn new(args: RebManagerArgs) -> Arc<Self> {
        let config = Arc::new(args.config);
        Arc::new(Self {
            stages: StageTracker::new(args.local.clone()),
            local: args.local,
            mpaths: args.mpaths,
            conf_dir: args.conf_dir,
            smap_owner: args.smap_owner,
            transport: args.transport,
            client: args.client,
            health: args.health,
            locker: NameLocker::new(),
            stats: RebStats::default(),
            begin_stats: Mutex::new(RebStatsSnapshot::default()),
            config: RwLock::new(config.clone()),
            reb_id: AtomicU64::new(0),
            reb_smap: RwLock::new(None),
            run_config: RwLock::new(config),
            aborted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            on_air: AtomicI64::new(0),
            laterx: AtomicBool::new(false),
            ec: EcState::default(),
            lom_acks: LomAckTable::new(),
            last_broken: AtomicUsize::new(0),
        })
    }

    /// This target's id.
    pub fn local_id(&self) -> &TargetId {
        &self.local
    }

    /// Replace the engine configuration for future runs.
    pub fn set_config(&self, config: RebConfig) {
        *self.config.write().expect("config poisoned") = Arc::new(config);
    }

    /// Abort the current run. Idempotent.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            warn!(target_id = %self.local, "rebalance aborted");
        }
    }

    /// True once the current run has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// True while a run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Broken objects detected by the last completed detection pass.
    pub fn last_broken_count(&self) -> usize {
        self.last_broken.load(Ordering::Acquire)
    }

    /// Outbound EC fragments still awaiting acknowledgment.
    pub fn ec_acks_pending(&self) -> usize {
        self.ec.acks.len()
    }

    /// Migrated objects still awaiting acknowledgment.
    pub fn lom_acks_pending(&self) -> usize {
        self.lom_acks.pending()
    }

    /// Every stage mark the local target went through, in order.
    pub fn stage_history(&self) -> Vec<StageMark> {
        self.stages.self_history()
    }

    pub(crate) fn set_last_broken(&self, n: usize) {
        self.last_broken.store(n, Ordering::Release);
    }

    pub(crate) fn set_stage(&self, mark: StageMark) {
        debug!(target_id = %self.local, %mark, "stage transition");
        self.stages.set_self(mark);
    }

    /// Snapshot of the running rebalance context, if any.
    pub(crate) fn current_ctx(&self) -> Option<RunCtx> {
        let smap = self.reb_smap.read().expect("reb smap poisoned").clone()?;
        let config = self.run_config.read().expect("run config poisoned").clone();
        Some(RunCtx {
            smap,
            config,
            reb_id: self.reb_id.load(Ordering::Acquire),
        })
    }

    /// Version of the map this run was started against (0 when idle).
    pub(crate) fn reb_version(&self) -> u64 {
        self.reb_smap
            .read()
            .expect("reb smap poisoned")
            .as_ref()
            .map(|s| s.version)
            .unwrap_or(0)
    }

    pub(crate) fn begin_snapshot(&self) -> RebStatsSnapshot {
        *self.begin_stats.lock().expect("begin stats poisoned")
    }

    // -----------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------

    /// Run a full cluster rebalance against the current map.
    ///
    /// `ec_buckets` is the list of EC-enabled buckets whose fragment
    /// namespaces take part in the EC repair pipeline; plain object
    /// migration covers everything found on disk regardless.
    pub async fn run_rebalance(self: &Arc<Self>, ec_buckets: &[Bucket]) -> Result<(), RebError> {
        let smap = self.smap_owner.get();
        let config = self.config.read().expect("config poisoned").clone();

        // Every peer must be reachable before any state changes hands.
        self.ping_all(&smap, &config).await?;

        if !self.serialize(&smap, &config).await {
            return Ok(());
        }

        let reb_id = self.reb_id.fetch_add(1, Ordering::AcqRel) + 1;
        let ctx = RunCtx {
            smap: smap.clone(),
            config: config.clone(),
            reb_id,
        };
        info!(
            target_id = %self.local,
            reb_id,
            smap_version = smap.version,
            targets = smap.len(),
            "rebalance starting"
        );

        self.begin_run(&ctx).await?;
        let res = self.run_stages(&ctx, ec_buckets).await;
        self.finish_run(&ctx, res).await
    }

    /// Wait until the stage table lets a new run begin.
    ///
    /// Returns false when a newer map appeared while waiting — the caller
    /// gives up, the newer map will trigger its own run.
    async fn serialize(&self, smap: &Smap, config: &RebConfig) -> bool {
        loop {
            if self
                .stages
                .cas_self(&[Stage::Inactive, Stage::Done], Stage::Init)
            {
                return true;
            }
            let cur = self.smap_owner.get();
            if cur.version > smap.version {
                warn!(
                    target_id = %self.local,
                    stale = smap.version,
                    current = cur.version,
                    "not rebalancing: newer cluster map exists"
                );
                return false;
            }
            debug!(target_id = %self.local, stage = %self.stages.self_mark(), "waiting for previous run");
            tokio::time::sleep(config.timeout.cplane_op).await;
        }
    }

    /// Poll every peer concurrently until it answers or the retry budget
    /// runs out.
    async fn ping_all(
        self: &Arc<Self>,
        smap: &Arc<Smap>,
        config: &Arc<RebConfig>,
    ) -> Result<(), RebError> {
        let mut handles = Vec::new();
        for peer in smap.targets.keys().filter(|t| **t != self.local) {
            let peer = peer.clone();
            let this = self.clone();
            let config = config.clone();
            handles.push(tokio::spawn(
                async move { this.ping_one(&peer, &config).await },
            ));
        }
        for h in handles {
            h.await.map_err(|e| RebError::Net(e.to_string()))??;
        }
        Ok(())
    }

    async fn ping_one(&self, peer: &TargetId, config: &RebConfig) -> Result<(), RebError> {
        let deadline = tokio::time::Instant::now() + config.rebalance.dest_retry;
        loop {
            match self.client.reb_status(peer).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        error!(target_id = %self.local, %peer, error = %e, "peer unreachable");
                        return Err(RebError::Timeout(format!("ping {peer}")));
                    }
                    debug!(%peer, error = %e, "waiting for peer");
                    tokio::time::sleep(config.timeout.cplane_op).await;
                }
            }
        }
    }

    async fn begin_run(&self, ctx: &RunCtx) -> Result<(), RebError> {
        self.aborted.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        self.on_air.store(0, Ordering::Release);
        self.laterx.store(false, Ordering::Release);
        self.ec.reset();
        self.lom_acks.clear();
        self.stages.reset_peers();
        *self.begin_stats.lock().expect("begin stats poisoned") = self.stats.snapshot();
        *self.reb_smap.write().expect("reb smap poisoned") = Some(ctx.smap.clone());
        *self.run_config.write().expect("run config poisoned") = ctx.config.clone();

        put_marker(&self.conf_dir, Marker::Rebalance).await?;
        Ok(())
    }

    async fn run_stages(self: &Arc<Self>, ctx: &RunCtx, ec_buckets: &[Bucket]) -> Result<(), RebError> {
        self.set_stage(StageMark::new(Stage::Traverse));

        // Both walkers: plain object migration and the EC CT inventory.
        self.run_vanilla_traverse(ctx).await?;
        self.run_ec_walk(ctx, ec_buckets).await?;

        self.set_stage(StageMark::new(Stage::EcNamespace));
        self.exchange_namespace(ctx).await?;
        self.set_stage(StageMark::new(Stage::EcDetect));
        self.wait_namespaces(ctx).await?;

        self.check_cts(ctx).await?;
        self.resilver_local_actions(ctx).await?;

        self.set_stage(StageMark::new(Stage::EcRepair));
        self.wait_all_stage(ctx, StageMark::new(Stage::EcRepair)).await?;
        self.run_ec_batches(ctx).await?;

        self.set_stage(StageMark::new(Stage::EcCleanup));
        self.cleanup_ec();

        self.set_stage(StageMark::new(Stage::WaitAck));
        self.wait_obj_acks(ctx).await?;

        self.set_stage(StageMark::new(Stage::Fin));
        Ok(())
    }

    async fn finish_run(&self, ctx: &RunCtx, res: Result<(), RebError>) -> Result<(), RebError> {
        if res.is_err() {
            self.abort();
        }

        // Outbound quiescence: the in-flight counter must stay at zero for
        // a few consecutive polls before streams can be torn down.
        let sleep = ctx.config.timeout.cplane_op;
        let mut quiescent = 0u32;
        let mut waited = Duration::ZERO;
        let maxwt = sleep * 16;
        while waited < maxwt {
            if self.on_air.load(Ordering::Acquire) <= 0 {
                quiescent += 1;
            } else {
                quiescent = 0;
            }
            if quiescent >= 3 {
                break;
            }
            tokio::time::sleep(sleep).await;
            waited += sleep;
        }

        let aborted = self.is_aborted();
        if !aborted {
            clear_marker(&self.conf_dir, Marker::Rebalance).await?;
        }
        self.running.store(false, Ordering::Release);
        self.set_stage(StageMark::new(Stage::Done));

        let delta = self.stats.snapshot().delta_since(&self.begin_snapshot());
        info!(
            target_id = %self.local,
            reb_id = ctx.reb_id,
            aborted,
            tx_count = delta.tx_count,
            tx_bytes = delta.tx_bytes,
            rx_count = delta.rx_count,
            rx_bytes = delta.rx_bytes,
            "rebalance finished"
        );
        res
    }

    // -----------------------------------------------------------------
    // Barriers
    // -----------------------------------------------------------------

    /// Block until every target reports at least `want`.
    ///
    /// Laggards are polled directly over the control plane; a peer holding
    /// a newer cluster map aborts the local run.
    pub(crate) async fn wait_all_stage(&self, ctx: &RunCtx, want: StageMark) -> Result<(), RebError> {
        let deadline = tokio::time::Instant::now() + ctx.config.rebalance.dest_retry;
        loop {
            if self.is_aborted() {
                return Err(RebError::Aborted(format!("barrier {want}")));
            }
            if self.stages.all_in_stage(&ctx.smap, want) {
                return Ok(());
            }

            for lag in self.stages.laggards(&ctx.smap, want) {
                match self.client.reb_status(&lag).await {
                    Ok(st) => {
                        if st.smap_version > ctx.smap.version {
                            self.abort();
                            return Err(RebError::Aborted(format!(
                                "peer {lag} has newer cluster map v{}",
                                st.smap_version
                            )));
                        }
                        self.stages.set(
                            &lag,
                            StageMark {
                                stage: st.stage,
                                batch: st.batch,
                            },
                        );
                    }
                    Err(e) => debug!(peer = %lag, error = %e, "laggard poll failed"),
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.abort();
                return Err(RebError::Timeout(format!("barrier {want}")));
            }
            tokio::time::sleep(ctx.config.timeout.cplane_op).await;
        }
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    /// Handle one data-bundle frame.
    pub async fn recv_data(self: &Arc<Self>, hdr: DataHdr, payload: Bytes) {
        self.laterx.store(true, Ordering::Release);
        match hdr.opaque.clone() {
            Opaque::EcNamespace { daemon_id, reb_id } => {
                self.recv_namespace(daemon_id, reb_id, payload);
            }
            Opaque::EcPush {
                daemon_id,
                reb_id,
                meta,
                ..
            } => {
                if let Err(e) = self.receive_ct(&hdr, daemon_id, reb_id, meta, payload).await {
                    error!(
                        target_id = %self.local,
                        uname = %hdr.uname(),
                        error = %e,
                        "failed to receive fragment"
                    );
                }
            }
            Opaque::ObjPush { daemon_id, reb_id } => {
                if let Err(e) = self.recv_vanilla_obj(&hdr, daemon_id, reb_id, payload).await {
                    error!(
                        target_id = %self.local,
                        uname = %hdr.uname(),
                        error = %e,
                        "failed to receive object"
                    );
                }
            }
            other => {
                warn!(target_id = %self.local, ?other, "unexpected opaque on data bundle");
            }
        }
    }

    /// Handle one ack-bundle frame.
    pub async fn recv_ack(self: &Arc<Self>, hdr: DataHdr) {
        match hdr.opaque.clone() {
            Opaque::EcAck {
                daemon_id,
                slice_id,
            } => {
                let ack = PendingAck {
                    daemon_id,
                    bucket: hdr.bucket.clone(),
                    obj_name: hdr.obj_name.clone(),
                    slice_id,
                };
                if !self.ec.acks.remove(&ack) {
                    debug!(uname = %hdr.uname(), slice_id, "ack for unknown fragment");
                }
            }
            Opaque::ObjAck { daemon_id } => {
                self.recv_vanilla_ack(&hdr, daemon_id).await;
            }
            other => {
                warn!(target_id = %self.local, ?other, "unexpected opaque on ack bundle");
            }
        }
    }

    // -----------------------------------------------------------------
    // Quiescence
    // -----------------------------------------------------------------

    /// Wait until no inbound activity occurred for `max_idle`.
    ///
    /// Returns true when the run was aborted while waiting.
    pub(crate) async fn wait_quiesce(&self, ctx: &RunCtx, max_idle: Duration) -> bool {
        let step = ctx.config.timeout.cplane_op.min(max_idle).max(Duration::from_millis(1));
        let mut idle = Duration::ZERO;
        while idle < max_idle {
            if self.is_aborted() {
                return true;
            }
            tokio::time::sleep(step).await;
            if self.laterx.swap(false, Ordering::AcqRel) {
                idle = Duration::ZERO;
            } else {
                idle += step;
            }
        }
        false
    }
}

