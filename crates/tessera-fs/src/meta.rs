//! EC metadata sidecar I/O.
//!
//! One JSON sidecar per fragment, stored in the metadata subtree at the
//! same relative path as the fragment it describes.

use std::path::Path;

use tessera_types::EcMetadata;

use crate::error::FsError;
use crate::io::save_atomic;

/// Load and parse a metadata sidecar.
pub async fn load_meta(path: &Path) -> Result<EcMetadata, FsError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|source| FsError::Meta {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist a metadata sidecar durably via the given workfile.
pub async fn save_meta(path: &Path, work: &Path, md: &EcMetadata) -> Result<(), FsError> {
    let raw = serde_json::to_vec(md).map_err(|source| FsError::Meta {
        path: path.to_path_buf(),
        source,
    })?;
    save_atomic(path, work, &raw).await
}
