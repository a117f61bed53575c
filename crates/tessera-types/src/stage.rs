//! Rebalance protocol stages.
//!
//! Targets gossip their current stage so peers can gate their own progress
//! at stage boundaries. Stage transitions observed by peers are monotonic:
//! a target never reports an earlier stage than one it already reported.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named point in the rebalance protocol, in protocol order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Stage {
    /// No rebalance running.
    Inactive = 0,
    /// A rebalance is being set up.
    Init,
    /// Mountpath walkers are enumerating local content.
    Traverse,
    /// Local CT inventory has been sent to all peers.
    EcNamespace,
    /// Cluster-wide CT view assembled, broken objects being detected.
    EcDetect,
    /// EC repair is running.
    EcRepair,
    /// A repair batch boundary; pairs with a batch id.
    EcBatch,
    /// EC repair finished, temporary state being released.
    EcCleanup,
    /// Waiting for object ACKs from peers.
    WaitAck,
    /// Winding down: draining streams.
    Fin,
    /// Rebalance finished.
    Done,
}

impl Stage {
    /// Short name used in logs and status responses.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Inactive => "inactive",
            Stage::Init => "init",
            Stage::Traverse => "traverse",
            Stage::EcNamespace => "ec-namespace",
            Stage::EcDetect => "ec-detect",
            Stage::EcRepair => "ec-repair",
            Stage::EcBatch => "ec-batch",
            Stage::EcCleanup => "ec-cleanup",
            Stage::WaitAck => "wait-ack",
            Stage::Fin => "fin",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stage together with the batch id it applies to.
///
/// The batch id is meaningful only for [`Stage::EcBatch`]; every other stage
/// carries batch 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMark {
    /// Reported stage.
    pub stage: Stage,
    /// Batch id within the stage.
    pub batch: u64,
}

impl StageMark {
    /// A mark at the given stage, batch 0.
    pub fn new(stage: Stage) -> Self {
        Self { stage, batch: 0 }
    }

    /// A mark at [`Stage::EcBatch`] with the given batch id.
    pub fn batch(batch: u64) -> Self {
        Self {
            stage: Stage::EcBatch,
            batch,
        }
    }

    /// True when a target that reported `self` has reached `want`.
    ///
    /// Stages are monotone, so any later stage satisfies an earlier one;
    /// within the same stage the batch id must have caught up.
    pub fn satisfies(&self, want: StageMark) -> bool {
        self.stage > want.stage || (self.stage == want.stage && self.batch >= want.batch)
    }
}

impl fmt::Display for StageMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stage == Stage::EcBatch {
            write!(f, "{}[{}]", self.stage, self.batch)
        } else {
            fmt::Display::fmt(&self.stage, f)
        }
    }
}
