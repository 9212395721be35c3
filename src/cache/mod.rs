//! Persistent translation cache.
//!
//! Three partitions live under the cache root, one JSON file per entry:
//! `translations/` (permanent), `translations_bypass/` (per-user, TTL) and
//! `translations_partial/` (in-flight snapshots, short TTL). File mtime
//! doubles as last-access time: reads touch the file so size eviction can
//! walk entries oldest-first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const MAX_KEY_BYTES: usize = 200;
const TRUNCATED_KEY_BYTES: usize = 150;
/// Eviction stops once the permanent partition is back under this share of
/// the configured cap.
const EVICTION_TARGET: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePartition {
    Translation,
    Bypass,
    Partial,
}

impl CachePartition {
    pub fn dir_name(&self) -> &'static str {
        match self {
            CachePartition::Translation => "translations",
            CachePartition::Bypass => "translations_bypass",
            CachePartition::Partial => "translations_partial",
        }
    }

    pub fn all() -> [CachePartition; 3] {
        [
            CachePartition::Translation,
            CachePartition::Bypass,
            CachePartition::Partial,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub content: String,
    pub created_at: i64,
    /// Unix seconds. `None` marks a permanent entry.
    pub expires_at: Option<i64>,
    pub source_file_id: String,
    pub target_language: String,
    /// Owning user for bypass and partial entries. Bypass entries missing
    /// this are treated as misses by the orchestrator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        content: impl Into<String>,
        source_file_id: impl Into<String>,
        target_language: impl Into<String>,
        ttl: Option<time::Duration>,
    ) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            key: key.into(),
            content: content.into(),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl.whole_seconds()),
            source_file_id: source_file_id.into(),
            target_language: target_language.into(),
            config_hash: None,
            is_error: false,
            error_type: None,
            error_message: None,
        }
    }

    pub fn with_config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.config_hash = Some(config_hash.into());
        self
    }

    pub fn into_error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.is_error = true;
        self.error_type = Some(error_type.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub disk_reads: AtomicU64,
    pub disk_writes: AtomicU64,
    pub evicted_files: AtomicU64,
    pub permanent_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub evicted_files: u64,
    pub permanent_bytes: u64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
            evicted_files: self.evicted_files.load(Ordering::Relaxed),
            permanent_bytes: self.permanent_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub removed_corrupt: usize,
    pub removed_expired: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    max_permanent_bytes: u64,
    metrics: CacheMetrics,
}

impl CacheStore {
    /// Creates the partition directories and runs the startup integrity
    /// sweep.
    pub async fn init(root: impl Into<PathBuf>, max_permanent_bytes: u64) -> anyhow::Result<Self> {
        let store = Self {
            root: root.into(),
            max_permanent_bytes,
            metrics: CacheMetrics::default(),
        };
        for partition in CachePartition::all() {
            fs::create_dir_all(store.partition_dir(partition))
                .await
                .context("create cache partition dir")?;
        }
        let stats = store.sweep().await?;
        tracing::info!(
            corrupt = stats.removed_corrupt,
            expired = stats.removed_expired,
            evicted = stats.evicted,
            "Cache store ready at {}",
            store.root.display()
        );
        Ok(store)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn partition_dir(&self, partition: CachePartition) -> PathBuf {
        self.root.join(partition.dir_name())
    }

    /// Keeps `[A-Za-z0-9_-]` only. Over-long keys are truncated and made
    /// unique again with a digest of the original. Sanitizing an already
    /// sanitized key is a fixed point.
    pub fn sanitize_key(key: &str) -> String {
        let flattened = key.replace("..", "").replace(['/', '\\'], "_");
        let mut sanitized: String = flattened
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if sanitized.is_empty() || sanitized.len() > MAX_KEY_BYTES {
            let digest = Sha256::digest(key.as_bytes());
            let prefix: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
            sanitized.truncate(TRUNCATED_KEY_BYTES);
            sanitized = format!("{prefix}_{sanitized}");
            sanitized.truncate(MAX_KEY_BYTES);
            if sanitized.ends_with('_') {
                sanitized.pop();
            }
        }
        sanitized
    }

    /// Builds the entry path and verifies it cannot leave the partition.
    fn entry_path(&self, partition: CachePartition, key: &str) -> anyhow::Result<PathBuf> {
        let dir = self.partition_dir(partition);
        let name = Self::sanitize_key(key);
        let path = dir.join(format!("{name}.json"));
        let escapes = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
            || !path.starts_with(&dir);
        if escapes {
            anyhow::bail!("cache path escapes partition root: {}", path.display());
        }
        Ok(path)
    }

    pub async fn get(&self, key: &str, partition: CachePartition) -> Option<CacheEntry> {
        let path = self.entry_path(partition, key).ok()?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        self.metrics.disk_reads.fetch_add(1, Ordering::Relaxed);

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Dropping corrupt cache entry {}: {e}", path.display());
                let _ = fs::remove_file(&path).await;
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if entry.is_expired(now) {
            let _ = fs::remove_file(&path).await;
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        touch(&path);
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Atomic write: temp file, best-effort fsync, rename into place.
    pub async fn set(&self, entry: &CacheEntry, partition: CachePartition) -> anyhow::Result<()> {
        let path = self.entry_path(partition, &entry.key)?;
        let tmp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(entry).context("serialize cache entry")?;

        let write_result: anyhow::Result<()> = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&payload).await?;
            let _ = file.sync_all().await;
            drop(file);
            fs::rename(&tmp_path, &path).await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e).context("write cache entry");
        }

        self.metrics.disk_writes.fetch_add(1, Ordering::Relaxed);
        if partition == CachePartition::Translation {
            let total = self
                .metrics
                .permanent_bytes
                .fetch_add(payload.len() as u64, Ordering::Relaxed)
                + payload.len() as u64;
            if total > self.max_permanent_bytes {
                if let Err(e) = self.enforce_size_cap().await {
                    tracing::error!("Cache size enforcement failed: {e}");
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str, partition: CachePartition) -> bool {
        let Ok(path) = self.entry_path(partition, key) else {
            return false;
        };
        fs::remove_file(path).await.is_ok()
    }

    /// Deletes corrupt and expired entries everywhere, then rechecks the
    /// permanent partition against its size cap. Runs at startup and on a
    /// timer.
    pub async fn sweep(&self) -> anyhow::Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut permanent_bytes = 0u64;

        for partition in CachePartition::all() {
            let dir = self.partition_dir(partition);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(dir_entry)) = entries.next_entry().await {
                let path = dir_entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let parsed = match fs::read_to_string(&path).await {
                    Ok(raw) => serde_json::from_str::<CacheEntry>(&raw).ok(),
                    Err(_) => None,
                };
                match parsed {
                    None => {
                        let _ = fs::remove_file(&path).await;
                        stats.removed_corrupt += 1;
                    }
                    Some(entry) if entry.is_expired(now) => {
                        let _ = fs::remove_file(&path).await;
                        stats.removed_expired += 1;
                    }
                    Some(_) => {
                        if partition == CachePartition::Translation {
                            if let Ok(meta) = dir_entry.metadata().await {
                                permanent_bytes += meta.len();
                            }
                        }
                    }
                }
            }
        }

        self.metrics
            .permanent_bytes
            .store(permanent_bytes, Ordering::Relaxed);
        if permanent_bytes > self.max_permanent_bytes {
            stats.evicted = self.enforce_size_cap().await?;
        }
        Ok(stats)
    }

    /// Evicts permanent entries oldest-access-first until the partition is
    /// back under the eviction target.
    async fn enforce_size_cap(&self) -> anyhow::Result<usize> {
        let dir = self.partition_dir(CachePartition::Translation);
        let mut files: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut entries = fs::read_dir(&dir).await.context("read permanent partition")?;
        while let Ok(Some(dir_entry)) = entries.next_entry().await {
            let path = dir_entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(meta) = dir_entry.metadata().await else {
                continue;
            };
            let accessed = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, meta.len(), accessed));
        }

        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        let target = (self.max_permanent_bytes as f64 * EVICTION_TARGET) as u64;
        let mut evicted = 0;
        files.sort_by_key(|(_, _, accessed)| *accessed);
        for (path, len, _) in files {
            if total <= target {
                break;
            }
            if fs::remove_file(&path).await.is_ok() {
                total = total.saturating_sub(len);
                evicted += 1;
            }
        }

        self.metrics.permanent_bytes.store(total, Ordering::Relaxed);
        self.metrics
            .evicted_files
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            tracing::info!(evicted, total, "Evicted cache entries over size cap");
        }
        Ok(evicted)
    }
}

/// Marks the entry as recently used. mtime is the access clock here, real
/// atime is unreliable on most mounts.
fn touch(path: &Path) {
    let now = std::time::SystemTime::now();
    if let Ok(file) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = file.set_modified(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(max_bytes: u64) -> (TempDir, CacheStore) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::init(dir.path(), max_bytes).await.unwrap();
        (dir, store)
    }

    fn entry(key: &str, content: &str) -> CacheEntry {
        CacheEntry::new(key, content, "os:1", "spa", None)
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_dir, store) = store(u64::MAX).await;
        let written = entry("os1_spa", "1\n00:00:01,000 --> 00:00:02,000\nHola\n");
        store.set(&written, CachePartition::Translation).await.unwrap();
        let read = store.get("os1_spa", CachePartition::Translation).await.unwrap();
        assert_eq!(read, written);
        assert_eq!(read.content, written.content);
    }

    #[tokio::test]
    async fn miss_on_absent_key() {
        let (_dir, store) = store(u64::MAX).await;
        assert!(store.get("nothing", CachePartition::Bypass).await.is_none());
        assert_eq!(store.metrics().snapshot().misses, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_read() {
        let (_dir, store) = store(u64::MAX).await;
        let mut expired = entry("stale", "content that is stale");
        expired.expires_at = Some(OffsetDateTime::now_utc().unix_timestamp() - 10);
        store.set(&expired, CachePartition::Bypass).await.unwrap();
        assert!(store.get("stale", CachePartition::Bypass).await.is_none());
        // the file is gone, not just filtered
        let path = store.entry_path(CachePartition::Bypass, "stale").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sanitize_keeps_safe_charset_and_length() {
        let dirty = "os:123/../../etc\\passwd?*|";
        let clean = CacheStore::sanitize_key(dirty);
        assert!(clean.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        assert!(clean.len() <= 200);

        let long = "x".repeat(400);
        let clean_long = CacheStore::sanitize_key(&long);
        assert!(clean_long.len() <= 200);
        // different long keys must not collide after truncation
        let other_long = format!("{}{}", "x".repeat(399), "y");
        assert_ne!(clean_long, CacheStore::sanitize_key(&other_long));
    }

    #[test]
    fn sanitize_is_a_fixed_point() {
        for key in ["os:123_spa", "../../etc/passwd", &"k".repeat(400), "weird key!"] {
            let once = CacheStore::sanitize_key(key);
            assert_eq!(CacheStore::sanitize_key(&once), once, "key {key}");
        }
    }

    #[tokio::test]
    async fn traversal_keys_stay_inside_partition() {
        let (dir, store) = store(u64::MAX).await;
        for key in ["../../etc/passwd", "..\\..\\windows", "/absolute/path", "a\0b"] {
            let written = entry(key, "some subtitle content body");
            store.set(&written, CachePartition::Translation).await.unwrap();
        }
        // every file must live directly inside the partition dir
        let partition = dir.path().join("translations");
        let mut read_dir = tokio::fs::read_dir(&partition).await.unwrap();
        while let Ok(Some(dir_entry)) = read_dir.next_entry().await {
            assert_eq!(dir_entry.path().parent().unwrap(), partition);
        }
        assert!(!dir.path().join("etc").exists());
        assert!(!Path::new("/etc/passwd.json").exists());
    }

    #[tokio::test]
    async fn corrupt_entries_removed_by_sweep() {
        let (dir, store) = store(u64::MAX).await;
        let path = dir.path().join("translations").join("broken.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let stats = store.sweep().await.unwrap();
        assert_eq!(stats.removed_corrupt, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest_first() {
        let (_dir, store) = store(2_000).await;
        for i in 0..10 {
            let written = entry(&format!("key{i}"), &"x".repeat(400));
            store.set(&written, CachePartition::Translation).await.unwrap();
            // stagger mtimes so eviction order is deterministic
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        store.sweep().await.unwrap();
        let total = store.metrics().snapshot().permanent_bytes;
        assert!(total <= 1_800, "total {total}");
        // newest entries survive
        assert!(store.get("key9", CachePartition::Translation).await.is_some());
        assert!(store.get("key0", CachePartition::Translation).await.is_none());
    }
}
