//! Mountpath identity and HRW mountpath selection.

use std::path::{Path, PathBuf};

use tessera_placement::hrw_pick;

/// A root directory on a dedicated filesystem owned by one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountpath {
    path: PathBuf,
    label: String,
}

impl Mountpath {
    /// Wrap a mountpath root. The directory itself is created lazily by
    /// writers; construction never touches the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path.to_string_lossy().into_owned();
        Self { path, label }
    }

    /// Root directory of this mountpath.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable label used as the HRW candidate name.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// The mountpath an object's fragments belong on, by HRW over labels.
pub fn hrw_mountpath<'a>(mpaths: &'a [Mountpath], uname: &str) -> Option<&'a Mountpath> {
    hrw_pick(mpaths, |m| m.label(), uname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_matches_path() {
        let m = Mountpath::new("/data/mp1");
        assert_eq!(m.label(), "/data/mp1");
        assert_eq!(m.path(), Path::new("/data/mp1"));
    }

    #[test]
    fn test_hrw_mountpath_deterministic() {
        let mpaths = vec![
            Mountpath::new("/data/mp1"),
            Mountpath::new("/data/mp2"),
            Mountpath::new("/data/mp3"),
        ];
        for i in 0..50 {
            let uname = format!("ais/b/obj{i}");
            assert_eq!(
                hrw_mountpath(&mpaths, &uname),
                hrw_mountpath(&mpaths, &uname)
            );
        }
    }

    #[test]
    fn test_hrw_mountpath_spreads() {
        let mpaths = vec![
            Mountpath::new("/data/mp1"),
            Mountpath::new("/data/mp2"),
            Mountpath::new("/data/mp3"),
            Mountpath::new("/data/mp4"),
        ];
        let mut used = std::collections::HashSet::new();
        for i in 0..400 {
            let uname = format!("ais/b/obj{i}");
            used.insert(hrw_mountpath(&mpaths, &uname).unwrap().label().to_string());
        }
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_hrw_mountpath_empty() {
        assert!(hrw_mountpath(&[], "ais/b/o").is_none());
    }
}
