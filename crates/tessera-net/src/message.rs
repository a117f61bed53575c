//! Wire messages for the rebalance protocol.
//!
//! A data/ack frame is a [`DataHdr`] followed by a raw payload. The header
//! carries the object identity and attributes plus an [`Opaque`] section the
//! rebalance engine interprets; the transport itself never looks inside.

use serde::{Deserialize, Serialize};
use tessera_types::{Bucket, EcMetadata, ObjAttrs, RebStatus, Stage, TargetId};

/// Which bundle a connection belongs to. Sent as a single tag byte right
/// after connect, before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// Object and slice payloads.
    Data,
    /// Fixed small acknowledgments, empty payloads.
    Ack,
    /// Control-plane request/response.
    Ctrl,
}

impl BundleKind {
    /// Bundle name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            BundleKind::Data => "data",
            BundleKind::Ack => "ack",
            BundleKind::Ctrl => "ctrl",
        }
    }

    /// Wire tag for this bundle.
    pub fn tag(self) -> u8 {
        match self {
            BundleKind::Data => 0,
            BundleKind::Ack => 1,
            BundleKind::Ctrl => 2,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BundleKind::Data),
            1 => Some(BundleKind::Ack),
            2 => Some(BundleKind::Ctrl),
            _ => None,
        }
    }
}

/// Header of every data/ack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHdr {
    /// Bucket of the object the frame is about.
    pub bucket: Bucket,
    /// Object name within the bucket.
    pub obj_name: String,
    /// Object attributes (size of the payload, version, checksum).
    pub attrs: ObjAttrs,
    /// Engine-interpreted section.
    pub opaque: Opaque,
}

impl DataHdr {
    /// Canonical uname of the object this header refers to.
    pub fn uname(&self) -> String {
        self.bucket.uname(&self.obj_name)
    }
}

/// The engine-interpreted part of a frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opaque {
    /// Payload is a postcard-encoded local CT inventory.
    EcNamespace {
        /// Sender.
        daemon_id: TargetId,
        /// Rebalance run the inventory belongs to.
        reb_id: u64,
    },
    /// Payload is one EC fragment (full object, replica or slice).
    EcPush {
        /// Sender.
        daemon_id: TargetId,
        /// Sender's stage at send time.
        stage: Stage,
        /// Rebalance run the push belongs to.
        reb_id: u64,
        /// Metadata of the pushed fragment.
        meta: EcMetadata,
    },
    /// Empty payload; confirms durable storage of one EC fragment.
    EcAck {
        /// The target that stored the fragment.
        daemon_id: TargetId,
        /// Slice id that was stored.
        slice_id: u16,
    },
    /// Payload is a whole object migrating to its HRW target.
    ObjPush {
        /// Sender.
        daemon_id: TargetId,
        /// Rebalance run the push belongs to.
        reb_id: u64,
    },
    /// Empty payload; confirms durable storage of a migrated object.
    ObjAck {
        /// The target that stored the object.
        daemon_id: TargetId,
    },
}

impl Opaque {
    /// The daemon that produced this frame.
    pub fn daemon_id(&self) -> &TargetId {
        match self {
            Opaque::EcNamespace { daemon_id, .. }
            | Opaque::EcPush { daemon_id, .. }
            | Opaque::EcAck { daemon_id, .. }
            | Opaque::ObjPush { daemon_id, .. }
            | Opaque::ObjAck { daemon_id } => daemon_id,
        }
    }
}

/// Control-plane requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlRequest {
    /// Report the local rebalance status.
    RebStatus,
    /// Does the target hold this object?
    HeadObject {
        /// Bucket of the object.
        bucket: Bucket,
        /// Object name.
        obj_name: String,
    },
    /// Fetch a fragment and its metadata (slice id 0 = full object).
    FetchCt {
        /// Bucket of the object.
        bucket: Bucket,
        /// Object name.
        obj_name: String,
        /// Fragment to fetch.
        slice_id: u16,
    },
    /// Fetch the target's CT inventory (stall recovery for lost pushes).
    FetchNamespace,
}

/// Control-plane responses, matched to [`CtrlRequest`] variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlResponse {
    /// Status of the remote rebalance.
    RebStatus(RebStatus),
    /// Presence probe result.
    Head {
        /// True when the remote holds the object.
        exists: bool,
    },
    /// Fragment fetch result; `meta` is `None` when the remote lacks it.
    FetchCt {
        /// Fragment metadata.
        meta: Option<EcMetadata>,
        /// Fragment bytes; empty when `meta` is `None`.
        payload: Vec<u8>,
    },
    /// CT inventory; `None` while the target has not finished its walk.
    Namespace {
        /// Encoded inventory records.
        payload: Option<Vec<u8>>,
    },
}
