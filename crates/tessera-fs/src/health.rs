//! Filesystem health reporting hook.

use std::path::Path;

use tracing::warn;

/// Sink for filesystem write failures.
///
/// The node framework plugs in its health checker here; a failing mountpath
/// may get disabled as a result. The engine only reports.
pub trait FsHealth: Send + Sync {
    /// Report a filesystem error observed at `path`.
    fn on_error(&self, err: &std::io::Error, path: &Path);
}

/// Default sink: log and move on.
pub struct NoopFsHealth;

impl FsHealth for NoopFsHealth {
    fn on_error(&self, err: &std::io::Error, path: &Path) {
        warn!(path = %path.display(), error = %err, "filesystem error reported");
    }
}
