// ABOUTME: Offset store for binlog replication progress
// ABOUTME: Persists the last committed (file, position) pair atomically to status.yaml

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ReplicateError;

const STATUS_FILE: &str = "status.yaml";

/// A point in the binlog: file name plus byte position within that file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

/// Replication progress persisted across runs.
///
/// The whole document is rewritten on every commit via a temp file renamed
/// over `status.yaml`, so a crash mid-commit leaves either the old or the new
/// offset on disk, never a torn mix.
#[derive(Debug)]
pub struct ReplicationState {
    path: PathBuf,
    current: Option<BinlogPosition>,
}

impl ReplicationState {
    /// Loads the persisted offset from `<dir>/status.yaml`. A missing file is
    /// a fresh start, not an error.
    pub fn load(dir: &Path) -> Result<Self, ReplicateError> {
        let path = dir.join(STATUS_FILE);
        if !path.exists() {
            return Ok(ReplicationState {
                path,
                current: None,
            });
        }
        let contents = fs::read_to_string(&path)?;
        let current: BinlogPosition = serde_yaml::from_str(&contents).map_err(|e| {
            ReplicateError::Configuration(format!("unreadable {}: {e}", path.display()))
        })?;
        Ok(ReplicationState {
            path,
            current: Some(current),
        })
    }

    /// The last committed offset, if any run has committed one.
    pub fn position(&self) -> Option<&BinlogPosition> {
        self.current.as_ref()
    }

    /// Durably replaces the stored offset.
    ///
    /// Called exactly once per successfully emitted non-empty batch, strictly
    /// after emission succeeded.
    pub fn commit(&mut self, position: &BinlogPosition) -> Result<(), ReplicateError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let document = serde_yaml::to_string(position).map_err(|e| {
            ReplicateError::Configuration(format!("unserializable offset: {e}"))
        })?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(document.as_bytes())?;
        staged.flush()?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        self.current = Some(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_absent_is_fresh_start() {
        let dir = tempdir().unwrap();
        let state = ReplicationState::load(dir.path()).unwrap();
        assert!(state.position().is_none());
    }

    #[test]
    fn test_commit_then_reload() {
        let dir = tempdir().unwrap();
        let mut state = ReplicationState::load(dir.path()).unwrap();
        let offset = BinlogPosition {
            file: "mysql-bin.000012".into(),
            position: 4096,
        };
        state.commit(&offset).unwrap();
        assert_eq!(state.position(), Some(&offset));

        let reloaded = ReplicationState::load(dir.path()).unwrap();
        assert_eq!(reloaded.position(), Some(&offset));
    }

    #[test]
    fn test_commit_overwrites_previous_document() {
        let dir = tempdir().unwrap();
        let mut state = ReplicationState::load(dir.path()).unwrap();
        state
            .commit(&BinlogPosition {
                file: "mysql-bin.000012".into(),
                position: 4096,
            })
            .unwrap();
        state
            .commit(&BinlogPosition {
                file: "mysql-bin.000013".into(),
                position: 4,
            })
            .unwrap();

        let contents = fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap();
        assert!(contents.contains("mysql-bin.000013"));
        assert!(!contents.contains("mysql-bin.000012"));
        assert!(contents.contains("position: 4"));
    }

    #[test]
    fn test_garbage_status_file_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STATUS_FILE), ": not : yaml : [").unwrap();
        assert!(matches!(
            ReplicationState::load(dir.path()),
            Err(ReplicateError::Configuration(_))
        ));
    }
}
