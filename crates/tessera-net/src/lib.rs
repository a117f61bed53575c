//! Intra-cluster transport for Tessera.
//!
//! Two unidirectional stream bundles connect every pair of targets: "data"
//! carries object and slice payloads, "ack" carries small fixed
//! acknowledgments. A third, short-lived connection kind serves
//! control-plane request/response (status polls, presence probes, fragment
//! fetches). All frames are length-prefixed postcard.

mod error;
mod frame;
mod message;
mod transport;

pub use error::NetError;
pub use frame::{read_ctrl, read_frame, write_ctrl, write_frame, MAX_FRAME};
pub use message::{BundleKind, CtrlRequest, CtrlResponse, DataHdr, Opaque};
pub use transport::{serve, CtrlClient, InboundHandler, StreamBundle};

#[cfg(test)]
mod tests;
