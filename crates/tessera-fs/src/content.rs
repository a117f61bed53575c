//! Content kinds and path resolution.
//!
//! Every on-disk artifact is one of four kinds, each rooted in its own
//! subtree of a mountpath. Path resolution is total and injective over
//! `(kind, bucket, object)`, so a walker can parse a path back into the
//! identity of the artifact it belongs to.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tessera_types::Bucket;

use crate::mountpath::Mountpath;

/// The kind of an on-disk artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Full object (or whole-object replica).
    Object,
    /// An erasure-coded data or parity slice.
    Slice,
    /// EC metadata sidecar.
    Metadata,
    /// In-progress write, renamed into place on completion.
    Workfile,
}

impl ContentKind {
    /// Subtree name under the mountpath root.
    pub fn dir(self) -> &'static str {
        match self {
            ContentKind::Object => "obj",
            ContentKind::Slice => "slice",
            ContentKind::Metadata => "meta",
            ContentKind::Workfile => "work",
        }
    }
}

/// Resolve the path of an artifact on a given mountpath.
pub fn content_path(mpath: &Mountpath, kind: ContentKind, bck: &Bucket, obj: &str) -> PathBuf {
    mpath
        .path()
        .join(kind.dir())
        .join(bck.provider.to_string())
        .join(&bck.name)
        .join(obj)
}

static WORK_SEQ: AtomicU64 = AtomicU64::new(0);

/// A unique workfile path for an in-progress write of `obj`.
///
/// Lives in the workfile subtree of the same mountpath as the final
/// destination, so the finishing rename never crosses filesystems.
pub fn workfile_path(mpath: &Mountpath, bck: &Bucket, obj: &str, tag: &str) -> PathBuf {
    let seq = WORK_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!("{obj}.{tag}.{seq}");
    content_path(mpath, ContentKind::Workfile, bck, &name)
}
