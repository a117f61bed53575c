//! Mountpaths, on-disk content layout and durable file I/O.
//!
//! A target owns a set of [`Mountpath`]s, each the root of a content tree.
//! Every stored artifact belongs to one [`ContentKind`] and its location is
//! a pure function of `(mountpath, kind, bucket, object)` — see
//! [`content_path`]. Which mountpath an object belongs on is decided by HRW
//! over the mountpath labels ([`hrw_mountpath`]).

mod content;
mod error;
mod health;
mod io;
mod lock;
mod markers;
mod meta;
mod mountpath;

pub use content::{content_path, workfile_path, ContentKind};
pub use error::FsError;
pub use health::{FsHealth, NoopFsHealth};
pub use io::{copy_atomic, save_atomic, walk_files};
pub use lock::NameLocker;
pub use markers::{
    clear_marker, marker_present, note_node_restart, put_marker, Marker, NODE_RESTARTED_MARKER,
    NODE_RESTARTED_PREV,
};
pub use meta::{load_meta, save_meta};
pub use mountpath::{hrw_mountpath, Mountpath};
