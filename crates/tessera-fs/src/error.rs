//! Error types for filesystem operations.

use std::path::PathBuf;

/// Errors from content-tree I/O.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata sidecar could not be parsed or serialized.
    #[error("bad metadata sidecar {path}: {source}")]
    Meta {
        /// Sidecar path.
        path: PathBuf,
        /// Parse or serialize failure.
        source: serde_json::Error,
    },
}
