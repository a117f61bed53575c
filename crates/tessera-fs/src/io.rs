//! Durable file writes and directory traversal.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::FsError;

/// Write `data` durably to `path` via `work`: write + fsync the workfile,
/// then rename into place. A crash can leave a stale workfile but never a
/// half-written destination. `work` must live on the same filesystem.
pub async fn save_atomic(path: &Path, work: &Path, data: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Some(parent) = work.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut f = tokio::fs::File::create(work).await?;
    f.write_all(data).await?;
    f.sync_all().await?;
    drop(f);

    tokio::fs::rename(work, path).await?;
    debug!(path = %path.display(), size = data.len(), "saved file atomically");
    Ok(())
}

/// Copy `src` to `dst` with the same durability as [`save_atomic`].
pub async fn copy_atomic(src: &Path, dst: &Path, work: &Path) -> Result<(), FsError> {
    let data = tokio::fs::read(src).await?;
    save_atomic(dst, work, &data).await
}

/// Collect every regular file under `root`, unsorted.
///
/// A missing root yields an empty list; per-entry read errors bubble up.
pub async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, FsError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let ft = entry.file_type().await?;
            if ft.is_dir() {
                stack.push(entry.path());
            } else if ft.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_atomic_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/final");
        let work = dir.path().join("work/final.0");

        save_atomic(&path, &work, b"payload").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");
        assert!(!work.exists(), "workfile should be renamed away");
    }

    #[tokio::test]
    async fn test_save_atomic_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("obj");
        save_atomic(&path, &dir.path().join("w0"), b"one")
            .await
            .unwrap();
        save_atomic(&path, &dir.path().join("w1"), b"two")
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_copy_atomic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        tokio::fs::write(&src, b"data").await.unwrap();

        let dst = dir.path().join("nested/dst");
        copy_atomic(&src, &dst, &dir.path().join("w")).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"data");
        assert!(src.exists(), "copy must keep the source");
    }

    #[tokio::test]
    async fn test_walk_files_recursive_and_missing_root() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
        tokio::fs::write(dir.path().join("f1"), b"1").await.unwrap();
        tokio::fs::write(dir.path().join("a/f2"), b"2").await.unwrap();
        tokio::fs::write(dir.path().join("a/b/f3"), b"3").await.unwrap();

        let mut files = walk_files(dir.path()).await.unwrap();
        files.sort();
        assert_eq!(files.len(), 3);

        let missing = walk_files(&dir.path().join("nope")).await.unwrap();
        assert!(missing.is_empty());
    }
}
