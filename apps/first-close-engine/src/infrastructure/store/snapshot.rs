//! Snapshot Writer
//!
//! Writes the snapshot JSON to a temp file and renames it over the target,
//! so readers only ever see a complete document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::domain::Snapshot;

/// Write `bytes` to `path` atomically: `.tmp` sibling, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}

/// Snapshot write error.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rate-limited atomic snapshot writer.
#[derive(Debug)]
pub struct SnapshotWriter {
    path: PathBuf,
    min_interval: Duration,
    last_write: Option<Instant>,
    writes: u64,
}

impl SnapshotWriter {
    /// Create a writer for `path` writing at most once per `min_interval`.
    #[must_use]
    pub const fn new(path: PathBuf, min_interval: Duration) -> Self {
        Self {
            path,
            min_interval,
            last_write: None,
            writes: 0,
        }
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The minimum interval since the previous write has passed.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_write
            .is_none_or(|last| now.saturating_duration_since(last) >= self.min_interval)
    }

    /// Completed writes.
    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.writes
    }

    /// Replace the snapshot file.
    pub fn write(&mut self, snapshot: &Snapshot, now: Instant) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &bytes)?;
        self.last_write = Some(now);
        self.writes += 1;
        crate::infrastructure::metrics::record_snapshot_write();
        tracing::debug!(path = %self.path.display(), rows = snapshot.total, "Snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate};

    use super::*;

    fn snapshot(total: usize) -> Snapshot {
        Snapshot {
            generated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            trading_day: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            total,
            complete: 0,
            rows: Vec::new(),
        }
    }

    #[test]
    fn replaces_file_without_leaving_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("snapshot.json");
        let mut writer = SnapshotWriter::new(path.clone(), Duration::from_secs(2));
        let start = Instant::now();

        writer.write(&snapshot(1), start).unwrap();
        writer.write(&snapshot(2), start).unwrap();

        let stored: Snapshot = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(stored.total, 2);
        assert_eq!(writer.writes(), 2);
        assert!(!dir.path().join("out").join("snapshot.json.tmp").exists());
    }

    #[test]
    fn honours_min_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            SnapshotWriter::new(dir.path().join("snapshot.json"), Duration::from_secs(2));
        let start = Instant::now();
        assert!(writer.is_due(start));

        writer.write(&snapshot(0), start).unwrap();
        assert!(!writer.is_due(start + Duration::from_secs(1)));
        assert!(writer.is_due(start + Duration::from_secs(2)));
    }
}
