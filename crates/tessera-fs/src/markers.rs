//! Persistent progress markers under the node's config directory.
//!
//! A marker's presence on startup means the corresponding operation was
//! interrupted and must be rerun. Markers are empty files; only their
//! existence matters.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::FsError;

/// Marker for an in-progress cluster rebalance.
pub const REBALANCE_MARKER: &str = "rebalance-marker";
/// Marker for an in-progress local resilver.
pub const RESILVER_MARKER: &str = "resilver-marker";
/// Rewritten on every start; its prior presence means the node restarted.
pub const NODE_RESTARTED_MARKER: &str = "node-restarted-marker";
/// Where a re-observed restart marker is promoted to.
pub const NODE_RESTARTED_PREV: &str = "node-restarted-prev";

/// Operations that leave a persistent in-progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Cluster rebalance.
    Rebalance,
    /// Local resilver.
    Resilver,
}

impl Marker {
    fn file_name(self) -> &'static str {
        match self {
            Marker::Rebalance => REBALANCE_MARKER,
            Marker::Resilver => RESILVER_MARKER,
        }
    }

    fn path(self, conf_dir: &Path) -> PathBuf {
        conf_dir.join(self.file_name())
    }
}

/// Create the marker (idempotent).
pub async fn put_marker(conf_dir: &Path, marker: Marker) -> Result<(), FsError> {
    tokio::fs::create_dir_all(conf_dir).await?;
    tokio::fs::write(marker.path(conf_dir), b"").await?;
    debug!(marker = marker.file_name(), "marker created");
    Ok(())
}

/// Remove the marker; absence is not an error.
pub async fn clear_marker(conf_dir: &Path, marker: Marker) -> Result<(), FsError> {
    match tokio::fs::remove_file(marker.path(conf_dir)).await {
        Ok(()) => {
            debug!(marker = marker.file_name(), "marker cleared");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True when the marker exists.
pub async fn marker_present(conf_dir: &Path, marker: Marker) -> bool {
    tokio::fs::metadata(marker.path(conf_dir)).await.is_ok()
}

/// Rewrite the restart marker; promote an existing one to the `prev` name.
///
/// Returns true when the marker already existed, i.e. this is not the
/// node's first start since the marker was last cleaned.
pub async fn note_node_restart(conf_dir: &Path) -> Result<bool, FsError> {
    tokio::fs::create_dir_all(conf_dir).await?;
    let current = conf_dir.join(NODE_RESTARTED_MARKER);
    let prev = conf_dir.join(NODE_RESTARTED_PREV);

    let existed = tokio::fs::metadata(&current).await.is_ok();
    if existed {
        tokio::fs::rename(&current, &prev).await?;
    }
    tokio::fs::write(&current, b"").await?;
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let dir = TempDir::new().unwrap();
        assert!(!marker_present(dir.path(), Marker::Rebalance).await);

        put_marker(dir.path(), Marker::Rebalance).await.unwrap();
        assert!(marker_present(dir.path(), Marker::Rebalance).await);
        assert!(!marker_present(dir.path(), Marker::Resilver).await);

        clear_marker(dir.path(), Marker::Rebalance).await.unwrap();
        assert!(!marker_present(dir.path(), Marker::Rebalance).await);

        // Clearing an absent marker is fine.
        clear_marker(dir.path(), Marker::Rebalance).await.unwrap();
    }

    #[tokio::test]
    async fn test_node_restart_promotion() {
        let dir = TempDir::new().unwrap();

        let was_restarted = note_node_restart(dir.path()).await.unwrap();
        assert!(!was_restarted, "first start");
        assert!(dir.path().join(NODE_RESTARTED_MARKER).exists());

        let was_restarted = note_node_restart(dir.path()).await.unwrap();
        assert!(was_restarted, "second start");
        assert!(dir.path().join(NODE_RESTARTED_PREV).exists());
        assert!(dir.path().join(NODE_RESTARTED_MARKER).exists());
    }
}
