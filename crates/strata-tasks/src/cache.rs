//! Content-addressable task cache
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/<sha256>            stdout, stderr and artifact bytes
//! entries/<task hash>.json  CacheEntry referencing blobs by digest
//! ```
//!
//! Blobs are written before the entry that references them and every file is
//! written through [`write_atomic`], so an entry is only ever visible once
//! it is complete.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::hash::{digest_bytes, TaskHash};

/// A file produced by a task, relative to the working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Relative path with `/` separators
    pub path: String,
    /// File contents
    pub contents: Vec<u8>,
}

/// Everything observable about one task execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Raw stdout bytes
    pub stdout: Vec<u8>,
    /// Raw stderr bytes
    pub stderr: Vec<u8>,
    /// Declared outputs, sorted by path
    pub artifacts: Vec<Artifact>,
}

impl TaskOutput {
    /// Whether the task exited with code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Artifact paths in order
    pub fn artifact_paths(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.path.clone()).collect()
    }
}

/// Reference from an entry to an artifact blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Relative path with `/` separators
    pub path: String,
    /// Blob digest
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

/// A cached task result.
///
/// Contains only normalized data: no timestamps, durations or host details,
/// so identical executions produce byte-identical entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key of this entry
    pub task_hash: TaskHash,
    /// Digest of the command component
    pub command_digest: String,
    /// Process exit code
    pub exit_code: i32,
    /// Blob digest of stdout
    pub stdout: String,
    /// Blob digest of stderr
    pub stderr: String,
    /// Artifacts, sorted by path
    pub artifacts: Vec<ArtifactRecord>,
}

impl CacheEntry {
    fn blob_digests(&self) -> impl Iterator<Item = &str> {
        [self.stdout.as_str(), self.stderr.as_str()]
            .into_iter()
            .chain(self.artifacts.iter().map(|a| a.digest.as_str()))
    }
}

/// An entry read back from disk with the digest of its file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Decoded entry
    pub entry: CacheEntry,
    /// SHA-256 of the entry file bytes
    pub digest: String,
}

/// An entry whose blobs are on disk but which is not yet visible.
///
/// Committing it is a single atomic rename, which lets the caller order it
/// against other writes.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    entry: CacheEntry,
    bytes: Vec<u8>,
    digest: String,
}

impl PreparedEntry {
    /// The entry that will be committed
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Digest of the entry file as it will be written
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Content-addressable task cache
#[derive(Debug, Clone)]
pub struct TaskCache {
    /// Cache directory
    cache_dir: PathBuf,
}

impl TaskCache {
    /// Create a new task cache
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn blobs_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }

    fn entries_dir(&self) -> PathBuf {
        self.cache_dir.join("entries")
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(digest)
    }

    fn entry_path(&self, hash: &TaskHash) -> PathBuf {
        self.entries_dir().join(format!("{}.json", hash.as_str()))
    }

    fn write_blob(&self, bytes: &[u8]) -> Result<String, CacheError> {
        let digest = digest_bytes(bytes);
        let path = self.blob_path(&digest);
        let intact = fs::read(&path)
            .map(|existing| digest_bytes(&existing) == digest)
            .unwrap_or(false);
        if !intact {
            write_atomic(&path, bytes)?;
        }
        Ok(digest)
    }

    fn read_blob(&self, digest: &str) -> Result<Vec<u8>, CacheError> {
        let bytes = fs::read(self.blob_path(digest)).map_err(|_| CacheError::MissingBlob(digest.to_string()))?;
        if digest_bytes(&bytes) != digest {
            return Err(CacheError::CorruptBlob(digest.to_string()));
        }
        Ok(bytes)
    }

    /// Write the blobs for a result and build its entry without publishing it
    pub fn prepare(
        &self,
        hash: &TaskHash,
        command_digest: &str,
        output: &TaskOutput,
    ) -> Result<PreparedEntry, CacheError> {
        let stdout = self.write_blob(&output.stdout)?;
        let stderr = self.write_blob(&output.stderr)?;

        let mut artifacts = Vec::with_capacity(output.artifacts.len());
        for artifact in &output.artifacts {
            artifacts.push(ArtifactRecord {
                path: artifact.path.clone(),
                digest: self.write_blob(&artifact.contents)?,
                size: artifact.contents.len() as u64,
            });
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));

        let entry = CacheEntry {
            task_hash: hash.clone(),
            command_digest: command_digest.to_string(),
            exit_code: output.exit_code,
            stdout,
            stderr,
            artifacts,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        let digest = digest_bytes(&bytes);
        Ok(PreparedEntry { entry, bytes, digest })
    }

    /// Publish a prepared entry
    pub fn commit(&self, prepared: &PreparedEntry) -> Result<StoredEntry, CacheError> {
        write_atomic(&self.entry_path(&prepared.entry.task_hash), &prepared.bytes)?;
        debug!(hash = prepared.entry.task_hash.short(), "cache entry committed");
        Ok(StoredEntry {
            entry: prepared.entry.clone(),
            digest: prepared.digest.clone(),
        })
    }

    /// Store a task result in the cache
    pub fn put(
        &self,
        hash: &TaskHash,
        command_digest: &str,
        output: &TaskOutput,
    ) -> Result<StoredEntry, CacheError> {
        let prepared = self.prepare(hash, command_digest, output)?;
        self.commit(&prepared)
    }

    /// Look up a cached result.
    ///
    /// An unreadable entry or one whose blobs are missing or corrupted counts
    /// as a miss.
    pub fn get(&self, hash: &TaskHash) -> Result<Option<StoredEntry>, CacheError> {
        let path = self.entry_path(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(hash = hash.short(), "cache miss");
                return Ok(None);
            }
            Err(e) => return Err(CacheError::Io(e)),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(hash = hash.short(), error = %e, "unreadable cache entry, treating as miss");
                return Ok(None);
            }
        };
        if &entry.task_hash != hash {
            warn!(hash = hash.short(), "cache entry key mismatch, treating as miss");
            return Ok(None);
        }

        for digest in entry.blob_digests() {
            if let Err(e) = self.read_blob(digest) {
                warn!(hash = hash.short(), error = %e, "cache entry failed verification, treating as miss");
                return Ok(None);
            }
        }

        debug!(hash = hash.short(), exit_code = entry.exit_code, "cache hit");
        Ok(Some(StoredEntry {
            entry,
            digest: digest_bytes(&bytes),
        }))
    }

    /// Read back the full result an entry describes
    pub fn load_output(&self, entry: &CacheEntry) -> Result<TaskOutput, CacheError> {
        let mut artifacts = Vec::with_capacity(entry.artifacts.len());
        for record in &entry.artifacts {
            artifacts.push(Artifact {
                path: record.path.clone(),
                contents: self.read_blob(&record.digest)?,
            });
        }
        Ok(TaskOutput {
            exit_code: entry.exit_code,
            stdout: self.read_blob(&entry.stdout)?,
            stderr: self.read_blob(&entry.stderr)?,
            artifacts,
        })
    }

    /// Reproduce a cached result: restore its artifacts into `working_dir`
    /// and return the original stdout, stderr and exit code
    pub fn replay(&self, entry: &CacheEntry, working_dir: &Path) -> Result<TaskOutput, CacheError> {
        let output = self.load_output(entry)?;
        materialize_artifacts(&output.artifacts, working_dir)?;
        debug!(
            hash = entry.task_hash.short(),
            artifacts = output.artifacts.len(),
            "cache entry replayed"
        );
        Ok(output)
    }

    /// Remove entries older than `max_age`, then blobs no entry references
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        info!(max_age_secs = max_age.as_secs(), "pruning cache");
        let mut stats = PruneStats::default();

        let entries_dir = self.entries_dir();
        if !entries_dir.exists() {
            return Ok(stats);
        }

        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut referenced = BTreeSet::new();

        for dir_entry in fs::read_dir(&entries_dir)? {
            let path = dir_entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            stats.total += 1;

            let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
            if modified < cutoff {
                fs::remove_file(&path)?;
                stats.removed += 1;
                continue;
            }

            stats.kept += 1;
            if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&fs::read(&path)?) {
                referenced.extend(entry.blob_digests().map(str::to_string));
            }
        }

        let blobs_dir = self.blobs_dir();
        if blobs_dir.exists() {
            for dir_entry in fs::read_dir(&blobs_dir)? {
                let path = dir_entry?.path();
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                if name.is_some_and(|n| !referenced.contains(&n)) {
                    fs::remove_file(&path)?;
                    stats.blobs_removed += 1;
                }
            }
        }

        info!(
            total = stats.total,
            removed = stats.removed,
            kept = stats.kept,
            blobs_removed = stats.blobs_removed,
            "cache prune complete"
        );
        Ok(stats)
    }

    /// Remove every entry and blob
    pub fn clear(&self) -> Result<(), CacheError> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
            info!(dir = %self.cache_dir.display(), "cache cleared");
        }
        Ok(())
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        for entry in walkdir::WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let kind = entry.path().parent().and_then(|p| p.file_name());
            match kind.and_then(|k| k.to_str()) {
                Some("entries") => stats.entries += 1,
                Some("blobs") => stats.blobs += 1,
                _ => continue,
            }
            stats.total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }

        Ok(stats)
    }
}

/// Write artifacts under `dir`, each atomically
pub fn materialize_artifacts(artifacts: &[Artifact], dir: &Path) -> Result<(), CacheError> {
    for artifact in artifacts {
        write_atomic(&dir.join(&artifact.path), &artifact.contents)?;
    }
    Ok(())
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
    /// Unreferenced blobs removed
    pub blobs_removed: usize,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Number of blobs
    pub blobs: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A referenced blob does not exist
    #[error("Cache blob {0} is missing")]
    MissingBlob(String),

    /// A blob's contents no longer match its digest
    #[error("Cache blob {0} is corrupted")]
    CorruptBlob(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn output() -> TaskOutput {
        TaskOutput {
            exit_code: 0,
            stdout: b"hello\n\x00binary".to_vec(),
            stderr: b"warning: x\n".to_vec(),
            artifacts: vec![
                Artifact {
                    path: "dist/app.bin".to_string(),
                    contents: vec![0, 1, 2, 255],
                },
                Artifact {
                    path: "dist/app.map".to_string(),
                    contents: b"{}".to_vec(),
                },
            ],
        }
    }

    fn hash() -> TaskHash {
        TaskHash::from_hex("ab".repeat(32))
    }

    #[test]
    fn test_cache_put_and_get() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));

        let stored = cache.put(&hash(), "cmd", &output()).unwrap();
        let found = cache.get(&hash()).unwrap().unwrap();
        assert_eq!(found, stored);
        assert_eq!(found.entry.artifacts.len(), 2);
    }

    #[test]
    fn test_cache_miss() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        assert!(cache.get(&hash()).unwrap().is_none());
    }

    #[test]
    fn test_replay_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        let workdir = temp.path().join("work");

        let original = output();
        let stored = cache.put(&hash(), "cmd", &original).unwrap();
        let replayed = cache.replay(&stored.entry, &workdir).unwrap();

        assert_eq!(replayed, original);
        assert_eq!(fs::read(workdir.join("dist/app.bin")).unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_entries_are_deterministic() {
        let temp = TempDir::new().unwrap();
        let a = TaskCache::new(temp.path().join("a"));
        let b = TaskCache::new(temp.path().join("b"));

        let first = a.put(&hash(), "cmd", &output()).unwrap();
        let second = b.put(&hash(), "cmd", &output()).unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn test_prepared_entry_invisible_until_commit() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));

        let prepared = cache.prepare(&hash(), "cmd", &output()).unwrap();
        assert!(cache.get(&hash()).unwrap().is_none());

        let stored = cache.commit(&prepared).unwrap();
        assert_eq!(stored.digest, prepared.digest());
        assert!(cache.get(&hash()).unwrap().is_some());
    }

    #[test]
    fn test_corrupted_blob_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        let stored = cache.put(&hash(), "cmd", &output()).unwrap();

        let blob = cache.blob_path(&stored.entry.artifacts[0].digest);
        fs::write(&blob, b"tampered").unwrap();
        assert!(cache.get(&hash()).unwrap().is_none());

        // A fresh put heals the blob
        cache.put(&hash(), "cmd", &output()).unwrap();
        assert!(cache.get(&hash()).unwrap().is_some());
    }

    #[test]
    fn test_torn_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        cache.put(&hash(), "cmd", &output()).unwrap();

        fs::write(cache.entry_path(&hash()), b"{\"task_hash\":").unwrap();
        assert!(cache.get(&hash()).unwrap().is_none());
    }

    #[test]
    fn test_failures_are_cached() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        let failed = TaskOutput {
            exit_code: 3,
            stdout: Vec::new(),
            stderr: b"boom\n".to_vec(),
            artifacts: Vec::new(),
        };
        cache.put(&hash(), "cmd", &failed).unwrap();

        let found = cache.get(&hash()).unwrap().unwrap();
        assert_eq!(found.entry.exit_code, 3);
        assert_eq!(cache.load_output(&found.entry).unwrap(), failed);
    }

    #[test]
    fn test_prune_removes_old_entries_and_orphan_blobs() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        cache.put(&hash(), "cmd", &output()).unwrap();

        let kept = cache.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!(kept.removed, 0);
        assert_eq!(kept.kept, 1);

        let stats = cache.prune(Duration::ZERO).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(stats.blobs_removed > 0);
        assert_eq!(cache.status().unwrap().entries, 0);
        assert_eq!(cache.status().unwrap().blobs, 0);
    }

    #[test]
    fn test_cache_status() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));
        assert_eq!(cache.status().unwrap().entries, 0);

        cache.put(&hash(), "cmd", &output()).unwrap();
        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.blobs, 4);
        assert!(stats.total_size > 0);

        cache.clear().unwrap();
        assert_eq!(cache.status().unwrap().entries, 0);
    }

    #[test]
    fn test_cache_stats_formatted_size() {
        let stats = CacheStats {
            total_size: 1536,
            ..Default::default()
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");

        let stats = CacheStats {
            total_size: 500,
            ..Default::default()
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
