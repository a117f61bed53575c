//! EC-aware rebalance, resilver and repair engine.
//!
//! Each storage target runs one [`RebManager`]. When cluster membership
//! changes, every target rebalances: plain objects migrate to their new
//! HRW owners with ACK tracking and retransmission, while erasure-coded
//! content goes through the full repair pipeline — local CT discovery,
//! cluster-wide namespace exchange, deterministic broken-object detection,
//! local resilvering, and batched repair with Reed-Solomon reconstruction.
//!
//! The engine talks to the node framework through two seams: the
//! [`RebTransport`] stream bundles and the [`PeerClient`] control plane.
//! Cluster membership arrives as immutable [`tessera_cluster::Smap`]
//! snapshots; a newer map observed mid-run aborts the run, and the
//! persistent rebalance marker makes the next one pick up the work.

pub mod ct;
mod detect;
mod error;
mod exchange;
mod manager;
mod repair;
mod resilver;
pub mod stage;
mod status;
pub mod transport;
mod vanilla;
mod walk;

pub use ct::{CtRecord, PendingAck, RebCt};
pub use error::RebError;
pub use manager::{RebManager, RebManagerArgs};
pub use stage::StageTracker;
pub use transport::{PeerClient, RebTransport};
pub use vanilla::{LomAckTable, ObjHandle};

#[cfg(test)]
mod tests;
