//! Stage coordination across targets.
//!
//! Each target keeps a local table of the last `(stage, batch)` every peer
//! reported — via namespace pushes, fragment pushes or explicit status
//! polls. Barriers ask "has everyone reached at least this mark"; laggards
//! are polled directly so a lost notification cannot wedge the cluster.

use std::collections::HashMap;
use std::sync::Mutex;

use tessera_cluster::Smap;
use tessera_types::{Stage, StageMark, TargetId};
use tracing::debug;

/// Table of the highest stage mark observed per target (self included).
pub struct StageTracker {
    local: TargetId,
    marks: Mutex<HashMap<TargetId, StageMark>>,
    history: Mutex<Vec<StageMark>>,
}

impl StageTracker {
    /// A tracker for the given local target.
    pub fn new(local: TargetId) -> Self {
        Self {
            local,
            marks: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Record a mark reported by (or observed about) `target`.
    ///
    /// Marks only move forward; a stale report never rewinds the table.
    pub fn set(&self, target: &TargetId, mark: StageMark) {
        let mut marks = self.marks.lock().expect("stage table poisoned");
        let entry = marks
            .entry(target.clone())
            .or_insert(StageMark::new(Stage::Inactive));
        if !entry.satisfies(mark) {
            debug!(%target, %mark, "stage advanced");
            *entry = mark;
        }
    }

    /// The highest mark observed for `target`.
    pub fn get(&self, target: &TargetId) -> StageMark {
        self.marks
            .lock()
            .expect("stage table poisoned")
            .get(target)
            .copied()
            .unwrap_or(StageMark::new(Stage::Inactive))
    }

    /// Record the local target's own transition.
    pub fn set_self(&self, mark: StageMark) {
        self.history
            .lock()
            .expect("stage history poisoned")
            .push(mark);
        let local = self.local.clone();
        self.set(&local, mark);
    }

    /// The local target's current mark.
    pub fn self_mark(&self) -> StageMark {
        self.get(&self.local)
    }

    /// Atomically move the local stage from one of `from` to `to`.
    ///
    /// Serializes rebalance runs: exactly one caller wins the transition.
    pub fn cas_self(&self, from: &[Stage], to: Stage) -> bool {
        let mut marks = self.marks.lock().expect("stage table poisoned");
        let cur = marks
            .get(&self.local)
            .copied()
            .unwrap_or(StageMark::new(Stage::Inactive));
        if from.contains(&cur.stage) {
            marks.insert(self.local.clone(), StageMark::new(to));
            self.history
                .lock()
                .expect("stage history poisoned")
                .push(StageMark::new(to));
            true
        } else {
            false
        }
    }

    /// True when every target in `smap` (self included) reached `want`.
    pub fn all_in_stage(&self, smap: &Smap, want: StageMark) -> bool {
        let marks = self.marks.lock().expect("stage table poisoned");
        smap.targets.keys().all(|t| {
            marks
                .get(t)
                .copied()
                .unwrap_or(StageMark::new(Stage::Inactive))
                .satisfies(want)
        })
    }

    /// Targets in `smap` that have not reached `want`, excluding self.
    pub fn laggards(&self, smap: &Smap, want: StageMark) -> Vec<TargetId> {
        let marks = self.marks.lock().expect("stage table poisoned");
        smap.targets
            .keys()
            .filter(|t| {
                **t != self.local
                    && !marks
                        .get(*t)
                        .copied()
                        .unwrap_or(StageMark::new(Stage::Inactive))
                        .satisfies(want)
            })
            .cloned()
            .collect()
    }

    /// Every mark the local target went through, in order.
    pub fn self_history(&self) -> Vec<StageMark> {
        self.history.lock().expect("stage history poisoned").clone()
    }

    /// Forget every peer mark (start of a new run). Self marks survive.
    pub fn reset_peers(&self) {
        let mut marks = self.marks.lock().expect("stage table poisoned");
        let own = marks.get(&self.local).copied();
        marks.clear();
        if let Some(own) = own {
            marks.insert(self.local.clone(), own);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tessera_cluster::TargetNode;

    fn smap(n: u8) -> Smap {
        let mut targets = BTreeMap::new();
        for i in 0..n {
            let id = TargetId::new(format!("t{i}"));
            targets.insert(
                id.clone(),
                TargetNode {
                    id,
                    data_addr: "127.0.0.1:0".parse().unwrap(),
                    ctrl_addr: "127.0.0.1:0".parse().unwrap(),
                },
            );
        }
        Smap { version: 1, targets }
    }

    #[test]
    fn test_marks_monotonic() {
        let t = StageTracker::new(TargetId::new("t0"));
        let peer = TargetId::new("t1");
        t.set(&peer, StageMark::new(Stage::EcDetect));
        t.set(&peer, StageMark::new(Stage::Traverse)); // stale, ignored
        assert_eq!(t.get(&peer).stage, Stage::EcDetect);

        t.set(&peer, StageMark::batch(8));
        t.set(&peer, StageMark::batch(0)); // stale batch, ignored
        assert_eq!(t.get(&peer), StageMark::batch(8));
    }

    #[test]
    fn test_all_in_stage_and_laggards() {
        let s = smap(3);
        let t = StageTracker::new(TargetId::new("t0"));
        t.set_self(StageMark::new(Stage::EcNamespace));
        t.set(&TargetId::new("t1"), StageMark::new(Stage::EcNamespace));

        let want = StageMark::new(Stage::EcNamespace);
        assert!(!t.all_in_stage(&s, want));
        assert_eq!(t.laggards(&s, want), vec![TargetId::new("t2")]);

        t.set(&TargetId::new("t2"), StageMark::new(Stage::EcDetect));
        assert!(t.all_in_stage(&s, want));
        assert!(t.laggards(&s, want).is_empty());
    }

    #[test]
    fn test_cas_self_serializes() {
        let t = StageTracker::new(TargetId::new("t0"));
        assert!(t.cas_self(&[Stage::Inactive, Stage::Done], Stage::Init));
        assert!(!t.cas_self(&[Stage::Inactive, Stage::Done], Stage::Init));
        t.set_self(StageMark::new(Stage::Done));
        assert!(t.cas_self(&[Stage::Inactive, Stage::Done], Stage::Init));
    }

    #[test]
    fn test_history_records_transitions() {
        let t = StageTracker::new(TargetId::new("t0"));
        t.set_self(StageMark::new(Stage::Traverse));
        t.set_self(StageMark::batch(0));
        t.set_self(StageMark::batch(8));
        let h = t.self_history();
        assert_eq!(
            h,
            vec![
                StageMark::new(Stage::Traverse),
                StageMark::batch(0),
                StageMark::batch(8)
            ]
        );
    }

    #[test]
    fn test_reset_peers_keeps_self() {
        let t = StageTracker::new(TargetId::new("t0"));
        t.set_self(StageMark::new(Stage::Done));
        t.set(&TargetId::new("t1"), StageMark::new(Stage::Done));
        t.reset_peers();
        assert_eq!(t.self_mark().stage, Stage::Done);
        assert_eq!(t.get(&TargetId::new("t1")).stage, Stage::Inactive);
    }
}
