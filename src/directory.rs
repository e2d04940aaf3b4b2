//! Index directory introspection.
//!
//! Read-path failures never propagate: a missing or corrupt manifest is
//! logged and degraded to sentinel values so callers polling the
//! watermark are not poisoned.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::available_space;
use tracing::error;

use crate::engine::disk::{Manifest, MANIFEST_FILE};
use crate::error::{FreshetError, Result};
use crate::event::Version;

pub struct DirectoryManager {
    dir: PathBuf,
}

impl DirectoryManager {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| FreshetError::Config(format!("index directory {:?}: {}", dir, e)))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).exists()
    }

    /// Last committed version on disk. Missing or corrupt state is logged
    /// and reported as version 0.
    pub fn version(&self) -> Version {
        match Manifest::load(&self.dir) {
            Ok(Some(manifest)) => manifest.version,
            Ok(None) => 0,
            Err(e) => {
                error!(path = %self.dir.display(), error = %e, "could not read index version");
                0
            }
        }
    }

    /// Modification time of the last commit, if any.
    pub fn last_index_modified_time(&self) -> Option<DateTime<Utc>> {
        let modified = fs::metadata(self.dir.join(MANIFEST_FILE))
            .and_then(|m| m.modified())
            .ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    /// Total size of the index directory in bytes.
    pub fn size_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path)
                    } else {
                        entry.metadata().map(|m| m.len()).unwrap_or(0)
                    }
                })
                .sum()
        }
        walk(&self.dir)
    }

    /// Free bytes on the filesystem holding the index; -1 when the
    /// directory is gone or the probe fails.
    pub fn free_space_bytes(&self) -> i64 {
        if !self.dir.exists() {
            return -1;
        }
        match available_space(&self.dir) {
            Ok(bytes) => bytes.min(i64::MAX as u64) as i64,
            Err(e) => {
                error!(path = %self.dir.display(), error = %e, "free space probe failed");
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::docid::DefaultDocIdMapperFactory;
    use crate::engine::DiskIndex;

    #[test]
    fn test_missing_index_degrades_to_zero() {
        let tmp = TempDir::new().unwrap();
        let mgr = DirectoryManager::new(tmp.path()).unwrap();
        assert!(!mgr.exists());
        assert_eq!(mgr.version(), 0);
        assert!(mgr.last_index_modified_time().is_none());
    }

    #[test]
    fn test_corrupt_manifest_degrades_to_zero() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), b"{ not json").unwrap();
        let mgr = DirectoryManager::new(tmp.path()).unwrap();
        assert_eq!(mgr.version(), 0);
    }

    #[test]
    fn test_version_reflects_commit() {
        let tmp = TempDir::new().unwrap();
        let disk = DiskIndex::open(tmp.path(), Arc::new(DefaultDocIdMapperFactory)).unwrap();
        disk.commit(11).unwrap();
        disk.close();

        let mgr = DirectoryManager::new(tmp.path()).unwrap();
        assert!(mgr.exists());
        assert_eq!(mgr.version(), 11);
        assert!(mgr.last_index_modified_time().is_some());
        assert!(mgr.size_bytes() > 0);
        assert!(mgr.free_space_bytes() >= -1);
    }
}
