//! Trait seams between the engine and the node framework.
//!
//! The engine never talks to sockets directly: production wires these
//! traits to the stream bundles and control client in `tessera-net`, tests
//! wire them to an in-process loopback router.

use bytes::Bytes;
use tessera_net::DataHdr;
use tessera_types::{Bucket, EcMetadata, RebStatus, TargetId};

use crate::error::RebError;

/// Outbound side of the two stream bundles.
///
/// Guarantees per bundle: frames to one peer arrive in send order and
/// byte-exact; a send either succeeds or fails before any byte reaches the
/// peer.
#[async_trait::async_trait]
pub trait RebTransport: Send + Sync {
    /// Send a header + payload pair on the data bundle.
    async fn send_data(&self, to: &TargetId, hdr: DataHdr, payload: Bytes)
        -> Result<(), RebError>;

    /// Send a header-only frame on the ack bundle.
    async fn send_ack(&self, to: &TargetId, hdr: DataHdr) -> Result<(), RebError>;
}

/// Control-plane client toward one peer at a time.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetch the peer's rebalance status.
    async fn reb_status(&self, to: &TargetId) -> Result<RebStatus, RebError>;

    /// Does the peer hold the full object?
    async fn head_object(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
    ) -> Result<bool, RebError>;

    /// Fetch one fragment (and its metadata) from the peer.
    ///
    /// `slice_id` 0 requests the full object. `None` means the peer does
    /// not hold the fragment.
    async fn fetch_ct(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
        slice_id: u16,
    ) -> Result<Option<(EcMetadata, Bytes)>, RebError>;

    /// Fetch the peer's encoded CT inventory.
    ///
    /// `None` while the peer has not completed its local walk. Used as
    /// stall recovery when the pushed inventory was lost.
    async fn fetch_namespace(&self, to: &TargetId) -> Result<Option<Bytes>, RebError>;
}
