//! Elite list persistence
//!
//! A saved elite list is a versioned MessagePack envelope written wholesale
//! and read back wholesale. Only GASwarm itself reads these files.

use super::{EliteEntry, OptimizeDirection};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Format version of the persisted elite list
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted elite list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliteSnapshot {
    pub format_version: u32,
    /// RFC 3339 timestamp of the save
    pub saved_at: String,
    /// Direction the entries are ranked in
    pub optimize: OptimizeDirection,
    pub entries: Vec<EliteEntry>,
}

impl EliteSnapshot {
    pub fn new(optimize: OptimizeDirection, entries: Vec<EliteEntry>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            optimize,
            entries,
        }
    }
}

/// Write a snapshot, replacing any previous file
///
/// The data goes to a sibling temp file first and is renamed into place, so
/// a failed save never leaves a truncated list behind.
pub fn save_snapshot(path: &Path, snapshot: &EliteSnapshot) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(snapshot).context("Failed to serialize elite list")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    fs::write(tmp, &bytes)
        .with_context(|| format!("Failed to write elite list: {}", tmp.display()))?;
    fs::rename(tmp, path)
        .with_context(|| format!("Failed to move elite list into place: {}", path.display()))?;

    Ok(())
}

/// Read a snapshot written by `save_snapshot`
pub fn load_snapshot(path: &Path) -> Result<EliteSnapshot> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read elite list: {}", path.display()))?;

    let snapshot: EliteSnapshot = rmp_serde::from_slice(&bytes)
        .with_context(|| format!("Failed to parse elite list: {}", path.display()))?;

    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        anyhow::bail!(
            "Unsupported elite list format version {} in {} (expected {})",
            snapshot.format_version,
            path.display(),
            SNAPSHOT_FORMAT_VERSION
        );
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(fitness: f64, worker: &str) -> EliteEntry {
        EliteEntry {
            fitness,
            genome: vec![1, 2, 3],
            worker: worker.to_string(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run1.elites");

        let snapshot = EliteSnapshot::new(
            OptimizeDirection::Max,
            vec![entry(9.0, "b"), entry(5.0, "a")],
        );
        save_snapshot(&path, &snapshot).unwrap();

        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!dir.path().join("run1.elites.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load_snapshot(&dir.path().join("absent.elites")).is_err());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.elites");
        fs::write(&path, b"not an elite list").unwrap();

        assert!(load_snapshot(&path).is_err());
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no/such/dir/run.elites");

        let snapshot = EliteSnapshot::new(OptimizeDirection::Min, Vec::new());
        assert!(save_snapshot(&path, &snapshot).is_err());
    }
}
