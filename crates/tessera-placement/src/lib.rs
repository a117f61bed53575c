//! Highest-Random-Weight (HRW) placement.
//!
//! Every placement decision in Tessera is a pure function of `(key,
//! candidates)`: each candidate gets a pseudo-random weight from hashing the
//! key together with the candidate's name, and candidates are ranked by
//! descending weight. Two nodes holding the same candidate set therefore
//! always compute identical orderings — the property the rebalance protocol
//! depends on.
//!
//! Weights use XXH3-64. Ties (astronomically unlikely with distinct names)
//! break on the candidate name so the order stays total.

use tessera_types::TargetId;

/// Weight of `name` for `key`.
fn weight(key: &str, name: &str) -> u64 {
    let mut buf = Vec::with_capacity(key.len() + name.len() + 1);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0xff);
    buf.extend_from_slice(name.as_bytes());
    xxhash_rust::xxh3::xxh3_64(&buf)
}

/// Full HRW order of `targets` for the object uname `key`.
///
/// The first entry is the object's main target. Deterministic for a given
/// `(key, targets)` pair regardless of input order.
pub fn hrw_order(targets: &[TargetId], key: &str) -> Vec<TargetId> {
    let mut ranked: Vec<(u64, &TargetId)> = targets
        .iter()
        .map(|t| (weight(key, t.as_str()), t))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    ranked.into_iter().map(|(_, t)| t.clone()).collect()
}

/// The main target for `key`: the top of the HRW order.
pub fn hrw_main(targets: &[TargetId], key: &str) -> Option<TargetId> {
    targets
        .iter()
        .max_by(|a, b| {
            weight(key, a.as_str())
                .cmp(&weight(key, b.as_str()))
                .then_with(|| b.cmp(a))
        })
        .cloned()
}

/// Pick the highest-weight item from `items`, labeling each with `label`.
///
/// Used for mountpath selection, where candidates are not targets.
pub fn hrw_pick<'a, T>(items: &'a [T], label: impl Fn(&T) -> &str, key: &str) -> Option<&'a T> {
    items.iter().max_by(|a, b| {
        weight(key, label(a))
            .cmp(&weight(key, label(b)))
            .then_with(|| label(b).cmp(label(a)))
    })
}
