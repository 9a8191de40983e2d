//! Snapshot Store - Append-only JSONL Price Snapshots
//!
//! Persists price snapshots to daily JSONL files in the format
//! `snapshots/YYYY-MM-DD.jsonl`. Every insert is verified by reading
//! the file back and matching the record id and values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::quote::PriceSnapshot;
use crate::ports::repository::{SnapshotStore, StoredSnapshot};

/// Append-only JSONL snapshot store with daily file rotation.
///
/// The file a record lands in is chosen by its capture date (UTC), not
/// by the wall clock at write time.
pub struct JsonlSnapshotStore {
    /// Directory holding the daily files.
    snapshots_dir: PathBuf,
}

impl JsonlSnapshotStore {
    /// Create a store under `data_dir/snapshots`.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let snapshots_dir = data_dir.as_ref().join("snapshots");

        fs::create_dir_all(&snapshots_dir)
            .await
            .context("Failed to create snapshots directory")?;

        info!(dir = %snapshots_dir.display(), "Snapshot store ready");
        Ok(Self { snapshots_dir })
    }

    fn file_for(&self, captured_at: DateTime<Utc>) -> PathBuf {
        let date = captured_at.format("%Y-%m-%d");
        self.snapshots_dir.join(format!("{date}.jsonl"))
    }

    async fn append(&self, record: &StoredSnapshot) -> Result<PathBuf> {
        let path = self.file_for(record.timestamp);

        let mut json = serde_json::to_string(record).context("Failed to serialize snapshot")?;
        json.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open snapshot file")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write snapshot")?;

        file.flush().await.context("Failed to flush snapshot file")?;

        Ok(path)
    }

    async fn read_back(path: &Path, record: &StoredSnapshot) -> Result<bool> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read snapshot file back")?;

        // The record is appended last, so scan from the end.
        for line in content.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(stored) = serde_json::from_str::<StoredSnapshot>(line) {
                if stored.id == record.id {
                    return Ok(stored == *record);
                }
            }
        }
        Ok(false)
    }

    async fn daily_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.snapshots_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }

        // YYYY-MM-DD names sort chronologically.
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    #[instrument(skip(self, snapshot), fields(captured_at = %snapshot.captured_at))]
    async fn insert(&self, snapshot: &PriceSnapshot) -> bool {
        let record = StoredSnapshot::from_snapshot(snapshot);

        let path = match self.append(&record).await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to store snapshot");
                return false;
            }
        };

        match Self::read_back(&path, &record).await {
            Ok(true) => {
                debug!(id = %record.id, "Snapshot stored and verified");
                true
            }
            Ok(false) => {
                error!(id = %record.id, "Snapshot verification failed: record not found");
                false
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Snapshot verification failed");
                false
            }
        }
    }

    async fn latest(&self) -> Result<Option<StoredSnapshot>> {
        for path in self.daily_files().await?.iter().rev() {
            let content = fs::read_to_string(path).await?;
            for line in content.lines().rev() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredSnapshot>(line) {
                    Ok(record) => return Ok(Some(record)),
                    Err(e) => {
                        warn!(
                            file = %path.display(),
                            error = %e,
                            "Skipping malformed snapshot record"
                        );
                    }
                }
            }
        }
        Ok(None)
    }

    async fn is_healthy(&self) -> bool {
        let test_path = self.snapshots_dir.join(".health_check");
        let result = fs::write(&test_path, b"ok").await;
        let _ = fs::remove_file(&test_path).await;
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::quote::Quote;

    fn snapshot(day: u32, polled_bid: rust_decimal::Decimal) -> PriceSnapshot {
        PriceSnapshot::new(
            Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
            Quote::new(polled_bid, dec!(17.12)),
            Quote::new(dec!(17.08), dec!(17.11)),
        )
    }

    #[tokio::test]
    async fn test_insert_then_latest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path()).await.unwrap();
        let snap = snapshot(1, dec!(17.10));

        assert!(store.insert(&snap).await);

        let latest = store.latest().await.unwrap().unwrap();
        assert!(latest.matches(&snap));
        assert!(dir.path().join("snapshots/2026-03-01.jsonl").exists());
    }

    #[tokio::test]
    async fn test_latest_prefers_newest_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path()).await.unwrap();

        assert!(store.insert(&snapshot(2, dec!(17.20))).await);
        assert!(store.insert(&snapshot(1, dec!(17.10))).await);

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.polled_bid, dec!(17.20));
    }

    #[tokio::test]
    async fn test_empty_store_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path()).await.unwrap();
        assert!(store.latest().await.unwrap().is_none());
        assert!(store.is_healthy().await);
    }

    #[tokio::test]
    async fn test_unwritable_directory_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path()).await.unwrap();
        fs::remove_dir_all(dir.path().join("snapshots")).await.unwrap();

        assert!(!store.insert(&snapshot(1, dec!(17.10))).await);
        assert!(!store.is_healthy().await);
    }
}
