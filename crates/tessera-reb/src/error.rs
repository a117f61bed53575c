//! Error types for the rebalance engine.

use tessera_erasure::ErasureError;
use tessera_fs::FsError;

/// Errors surfaced by the rebalance engine.
///
/// Leaf errors (one walk entry, one send) are logged and absorbed where the
/// protocol tolerates them; anything returned from the batch loop is fatal
/// to the whole run and triggers cleanup.
#[derive(Debug, thiserror::Error)]
pub enum RebError {
    /// The run was aborted (newer cluster map, fatal error, or user).
    #[error("rebalance aborted: {0}")]
    Aborted(String),

    /// Content-tree I/O failed.
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    /// Raw I/O failure outside the content tree.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Reed-Solomon reconstruction failed.
    #[error("erasure error: {0}")]
    Erasure(#[from] ErasureError),

    /// A transport operation failed.
    #[error("transport error: {0}")]
    Net(String),

    /// The namespace exchange could not reach every peer.
    #[error("namespace exchange failed: {unreached} peers unreached")]
    Exchange {
        /// Peers that never acknowledged the inventory.
        unreached: usize,
    },

    /// Too few fragments survive to restore an object.
    #[error("insufficient slices to restore {uname}")]
    InsufficientSlices {
        /// The object that cannot be restored.
        uname: String,
    },

    /// No fragment-free target is left to place a regenerated slice on.
    #[error("no free target for slice {slice_id} of {uname}")]
    NoFreeTarget {
        /// The object being redistributed.
        uname: String,
        /// The slice that has no home.
        slice_id: u16,
    },

    /// A received fragment failed checksum verification.
    #[error("checksum mismatch on {uname} slice {slice_id}")]
    BadChecksum {
        /// The object the fragment belongs to.
        uname: String,
        /// The offending slice.
        slice_id: u16,
    },

    /// Fragment metadata that must exist is missing.
    #[error("missing metadata for {0}")]
    MissingMeta(String),

    /// A barrier or poll loop exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl From<tessera_net::NetError> for RebError {
    fn from(e: tessera_net::NetError) -> Self {
        RebError::Net(e.to_string())
    }
}
