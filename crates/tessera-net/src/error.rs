//! Error types for the transport layer.

use std::net::SocketAddr;

/// Errors from stream bundles, framing and the control client.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Underlying socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A message failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame section exceeded the transport limit.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Offending section size.
        len: usize,
        /// The limit.
        max: usize,
    },

    /// Connecting to a peer did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// An inbound connection announced an unknown bundle.
    #[error("unknown bundle tag {0}")]
    BadBundleTag(u8),
}
