//! Durable write-path overflow
//!
//! Each spilled payload becomes one immutable file under
//! `<dir>/<encoded breaker>/<timestamp>.spill`. Files are written to a hidden
//! temporary name, fsynced and then renamed, so a crash mid-write never
//! leaves a partial file under a name that replay would pick up.

use crate::core::Clock;
use crate::error::{ResilienceError, Result};
use crate::telemetry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const SPILL_EXTENSION: &str = "spill";
const CORRUPT_EXTENSION: &str = "corrupt";

/// Spillover storage configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SpilloverConfig {
    /// Root directory of spill files
    pub dir: PathBuf,
    /// Total bytes spill files may occupy
    pub max_bytes: u64,
}

impl SpilloverConfig {
    /// Create a configuration with a 256 MiB budget
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: 256 * 1024 * 1024,
        }
    }

    /// Set the byte budget
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// One spilled write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpillRecord {
    /// Breaker guarding the failed write
    pub breaker: String,
    /// Correlation key of the original request
    pub correlation_key: String,
    /// Epoch milliseconds when the payload was spilled
    pub spilled_at_ms: u64,
    /// The payload as JSON
    pub payload: serde_json::Value,
}

impl SpillRecord {
    /// Deserialize the payload into its original type
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Where a payload was spilled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillReceipt {
    /// Final path of the spill file
    pub path: PathBuf,
    /// File size
    pub bytes: u64,
}

struct Usage {
    bytes: u64,
    files: u64,
}

/// Writes, lists and removes spill files
///
/// Spills are serialized through an async mutex; the write path only runs
/// while a downstream is failing, and serializing it keeps the byte budget
/// and file naming exact.
pub struct SpilloverWriter {
    config: SpilloverConfig,
    clock: Arc<dyn Clock>,
    last_stamp: AtomicU64,
    usage: Mutex<Option<Usage>>,
}

impl SpilloverWriter {
    /// Create a writer; the directory is created on first spill
    pub fn new(config: SpilloverConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            last_stamp: AtomicU64::new(0),
            usage: Mutex::new(None),
        }
    }

    /// Spillover configuration
    pub fn config(&self) -> &SpilloverConfig {
        &self.config
    }

    /// Durably store `payload` for later replay
    ///
    /// # Errors
    ///
    /// [`ResilienceError::LocalOverflowFull`] when the byte budget would be
    /// exceeded, otherwise the underlying I/O or serialization error.
    pub async fn spill<T: Serialize>(
        &self,
        breaker: &str,
        correlation_key: &str,
        payload: &T,
    ) -> Result<SpillReceipt> {
        let record = SpillRecord {
            breaker: breaker.to_string(),
            correlation_key: correlation_key.to_string(),
            spilled_at_ms: self.clock.now_ms(),
            payload: serde_json::to_value(payload)?,
        };
        let bytes = serde_json::to_vec(&record)?;

        let mut usage = self.usage.lock().await;
        if usage.is_none() {
            *usage = Some(self.scan_usage().await?);
        }
        let Some(current) = usage.as_mut() else {
            return Err(ResilienceError::other("spillover usage not initialized"));
        };

        let size = bytes.len() as u64;
        if current.bytes.saturating_add(size) > self.config.max_bytes {
            return Err(ResilienceError::LocalOverflowFull {
                path: self.config.dir.clone(),
                used: current.bytes,
                limit: self.config.max_bytes,
            });
        }

        let dir = self.breaker_dir(breaker);
        fs::create_dir_all(&dir).await?;

        let (tmp_path, final_path) = loop {
            let stamp = self.next_stamp();
            let final_path = dir.join(format!("{:020}.{}", stamp, SPILL_EXTENSION));
            if !fs::try_exists(&final_path).await? {
                break (dir.join(format!(".{:020}.tmp", stamp)), final_path);
            }
        };

        if let Err(err) = write_synced(&tmp_path, &bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        fs::rename(&tmp_path, &final_path).await?;

        current.bytes += size;
        current.files += 1;
        metrics::gauge!(telemetry::SPILLOVER_FILES).set(current.files as f64);

        // The rename is only durable once the directory entry is on disk
        sync_dir(&dir).await?;
        tracing::info!(
            breaker,
            correlation_key,
            path = %final_path.display(),
            bytes = size,
            "payload spilled to local overflow"
        );

        Ok(SpillReceipt {
            path: final_path,
            bytes: size,
        })
    }

    /// Spill files of one breaker, oldest first
    pub async fn list(&self, breaker: &str) -> Result<Vec<PathBuf>> {
        list_spills(&self.breaker_dir(breaker)).await
    }

    /// Read a spill file back
    pub async fn read(&self, path: &Path) -> Result<SpillRecord> {
        let bytes = fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            tracing::error!(path = %path.display(), error = %err, "unreadable spill file");
            ResilienceError::CorruptSpill(path.to_path_buf())
        })
    }

    /// Delete a spill file after it was handled
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let size = fs::metadata(path).await?.len();
        fs::remove_file(path).await?;
        self.release(size).await;
        Ok(())
    }

    /// Move an unreadable spill file out of the replay set
    pub async fn quarantine(&self, path: &Path) -> Result<PathBuf> {
        let size = fs::metadata(path).await?.len();
        let target = path.with_extension(CORRUPT_EXTENSION);
        fs::rename(path, &target).await?;
        self.release(size).await;
        tracing::warn!(path = %target.display(), "spill file quarantined");
        Ok(target)
    }

    /// Bytes currently held by spill files
    pub async fn used_bytes(&self) -> Result<u64> {
        let mut usage = self.usage.lock().await;
        if usage.is_none() {
            *usage = Some(self.scan_usage().await?);
        }
        Ok(usage.as_ref().map_or(0, |usage| usage.bytes))
    }

    async fn release(&self, size: u64) {
        let mut usage = self.usage.lock().await;
        if let Some(current) = usage.as_mut() {
            current.bytes = current.bytes.saturating_sub(size);
            current.files = current.files.saturating_sub(1);
            metrics::gauge!(telemetry::SPILLOVER_FILES).set(current.files as f64);
        }
    }

    fn breaker_dir(&self, breaker: &str) -> PathBuf {
        self.config.dir.join(encode_breaker(breaker))
    }

    fn next_stamp(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut last = self.last_stamp.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self
                .last_stamp
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    async fn scan_usage(&self) -> Result<Usage> {
        let mut usage = Usage { bytes: 0, files: 0 };
        if !fs::try_exists(&self.config.dir).await? {
            return Ok(usage);
        }

        let mut newest_stamp = 0;
        let mut breakers = fs::read_dir(&self.config.dir).await?;
        while let Some(entry) = breakers.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            for path in list_spills(&entry.path()).await? {
                usage.bytes += fs::metadata(&path).await?.len();
                usage.files += 1;
                newest_stamp = newest_stamp.max(stamp_of(&path).unwrap_or(0));
            }
        }

        // New names must sort after files left by an earlier run, even if
        // the wall clock went backwards in between
        self.last_stamp.fetch_max(newest_stamp, Ordering::AcqRel);

        tracing::debug!(
            dir = %self.config.dir.display(),
            bytes = usage.bytes,
            files = usage.files,
            "spillover usage scanned"
        );
        Ok(usage)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Directory name for a breaker
///
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct breaker
/// names always map to distinct directories and none can leave the root.
fn encode_breaker(breaker: &str) -> String {
    let mut encoded = String::with_capacity(breaker.len());
    for byte in breaker.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn stamp_of(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

async fn list_spills(dir: &Path) -> Result<Vec<PathBuf>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let visible = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.'));
        if visible && path.extension().is_some_and(|ext| ext == SPILL_EXTENSION) {
            paths.push(path);
        }
    }

    // Zero-padded timestamps sort chronologically
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use serde_json::json;

    fn writer(dir: &Path, max_bytes: u64) -> (SpilloverWriter, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let config = SpilloverConfig::new(dir).with_max_bytes(max_bytes);
        (SpilloverWriter::new(config, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_same_millisecond_spills_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 1 << 20);

        let first = writer.spill("ledger", "req-1", &json!({"n": 1})).await.unwrap();
        let second = writer.spill("ledger", "req-2", &json!({"n": 2})).await.unwrap();

        assert_ne!(first.path, second.path);
        let listed = writer.list("ledger").await.unwrap();
        assert_eq!(listed, vec![first.path.clone(), second.path.clone()]);

        let record = writer.read(&first.path).await.unwrap();
        assert_eq!(record.correlation_key, "req-1");
        assert_eq!(record.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_temp_files_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 1 << 20);

        writer.spill("ledger", "req-1", &"payload").await.unwrap();

        // Leftover from a crash between create and rename
        let crashed = dir.path().join("ledger").join(".00000000000000000042.tmp");
        std::fs::write(&crashed, b"{\"partial").unwrap();

        assert_eq!(writer.list("ledger").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 200);

        writer.spill("ledger", "a", &"x".repeat(20)).await.unwrap();
        let err = writer
            .spill("ledger", "b", &"y".repeat(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::LocalOverflowFull { limit: 200, .. }));
        assert!(err.is_fatal());

        // Freeing space lets spills through again
        let path = writer.list("ledger").await.unwrap().remove(0);
        writer.remove(&path).await.unwrap();
        assert_eq!(writer.used_bytes().await.unwrap(), 0);
        writer.spill("ledger", "c", &"z".repeat(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_usage_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = writer(dir.path(), 1 << 20);
        let receipt = first.spill("kms", "a", &json!([1, 2, 3])).await.unwrap();
        drop(first);

        let (reopened, _) = writer(dir.path(), 1 << 20);
        assert_eq!(reopened.used_bytes().await.unwrap(), receipt.bytes);
    }

    #[tokio::test]
    async fn test_breaker_names_are_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 1 << 20);

        let receipt = writer.spill("../escape", "a", &1).await.unwrap();
        assert!(receipt.path.starts_with(dir.path().join("%2E%2E%2Fescape")));
    }

    #[tokio::test]
    async fn test_similar_breaker_names_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 1 << 20);

        for breaker in ["ledger.v1", "ledger_v1", "ledger/v1", "ledger%2Ev1"] {
            writer.spill(breaker, "a", &breaker).await.unwrap();
        }

        for breaker in ["ledger.v1", "ledger_v1", "ledger/v1", "ledger%2Ev1"] {
            let files = writer.list(breaker).await.unwrap();
            assert_eq!(files.len(), 1, "{} should own exactly one file", breaker);
            let record = writer.read(&files[0]).await.unwrap();
            assert_eq!(record.breaker, breaker);
        }
    }

    #[test]
    fn test_encode_breaker() {
        assert_eq!(encode_breaker("risk-score_v2"), "risk-score_v2");
        assert_eq!(encode_breaker("ledger.v1"), "ledger%2Ev1");
        assert_eq!(encode_breaker("a%b"), "a%25b");
        assert_eq!(encode_breaker("é"), "%C3%A9");
    }

    #[tokio::test]
    async fn test_stamps_stay_ordered_when_clock_steps_back_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = writer(dir.path(), 1 << 20);
        let older = first.spill("ledger", "a", &1).await.unwrap();
        drop(first);

        let (reopened, clock) = writer(dir.path(), 1 << 20);
        clock.set(1_600_000_000_000);
        let newer = reopened.spill("ledger", "b", &2).await.unwrap();

        assert!(stamp_of(&newer.path) > stamp_of(&older.path));
        assert_eq!(
            reopened.list("ledger").await.unwrap(),
            vec![older.path, newer.path]
        );
    }

    #[tokio::test]
    async fn test_directory_sync() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();

        #[cfg(unix)]
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_quarantine_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = writer(dir.path(), 1 << 20);
        let receipt = writer.spill("ledger", "a", &1).await.unwrap();
        std::fs::write(&receipt.path, b"not json").unwrap();

        assert!(matches!(
            writer.read(&receipt.path).await,
            Err(ResilienceError::CorruptSpill(_))
        ));
        writer.quarantine(&receipt.path).await.unwrap();
        assert!(writer.list("ledger").await.unwrap().is_empty());
    }
}
