//! File-backed TTL cache.
//!
//! Each entry lives in its own file named after the SHA-256 of the caller's
//! key, holding `{timestamp, payload}` as JSON. Expired entries are removed
//! lazily on lookup or eagerly by [`TtlCache::sweep`]. Unreadable entries are
//! treated as misses and deleted.
//!
//! Distinct keys that hash alike would share an entry; callers are expected
//! to use keys unique enough that this does not matter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default entry lifetime (1 hour).
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const ENTRY_EXTENSION: &str = "json";

/// On-disk form of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CacheEntry {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        // Entries stamped in the future (clock skew) count as fresh.
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > ttl
    }
}

/// Deterministic hash of a cache key, used as the entry's file name.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache directory handle. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct TtlCache {
    dir: PathBuf,
}

impl TtlCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file that would hold `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.path_for_hash(&hash_key(key))
    }

    fn path_for_hash(&self, key_hash: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key_hash, ENTRY_EXTENSION))
    }

    /// Whether an entry file exists for `key`, regardless of age.
    pub fn contains(&self, key: &str) -> bool {
        self.entry_path(key).exists()
    }

    /// Look up `key`, returning its payload if it is at most `ttl` old.
    ///
    /// Expired and corrupt entries are deleted and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let key_hash = hash_key(key);
        let path = self.path_for_hash(&key_hash);

        let entry = match read_entry(&path, &key_hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!("Discarding cache entry: {}", e);
                remove_quietly(&path);
                return None;
            }
        };

        if entry.is_expired(ttl, Utc::now()) {
            debug!("Cache entry for '{}' expired, evicting", key);
            remove_quietly(&path);
            return None;
        }

        match serde_json::from_value(entry.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                // Readable entry, but not the shape the caller asked for.
                debug!("Cache entry for '{}' has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Store `payload` under `key` stamped with the current time, replacing
    /// any previous entry.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<()> {
        let entry = CacheEntry {
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)?,
        };
        let path = self.entry_path(key);
        let bytes = serde_json::to_vec(&entry)?;
        fs::write(&path, bytes).map_err(|e| Error::io(&path, e))?;
        debug!("Cached '{}' at {}", key, path.display());
        Ok(())
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
            removed += 1;
        }
        debug!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Remove every entry older than `ttl`, plus any that cannot be read.
    /// Returns how many were removed.
    pub fn sweep(&self, ttl: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for path in self.entry_files()? {
            let key_hash = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stale = match read_entry(&path, &key_hash) {
                Ok(Some(entry)) => entry.is_expired(ttl, now),
                // Vanished between listing and reading.
                Ok(None) => false,
                Err(e) => {
                    warn!("Discarding cache entry: {}", e);
                    true
                }
            };
            if stale {
                remove_quietly(&path);
                removed += 1;
            }
        }

        debug!("Swept {} cache entries older than {:?}", removed, ttl);
        Ok(removed)
    }

    /// Number of entry files currently on disk.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entry_files()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION)
            })
            .collect())
    }
}

/// `Ok(None)` when no entry exists; `Err(CacheCorrupt)` when one exists but
/// cannot be decoded.
fn read_entry(path: &Path, key_hash: &str) -> Result<Option<CacheEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::CacheCorrupt {
                key_hash: key_hash.to_string(),
                reason: e.to_string(),
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::CacheCorrupt {
            key_hash: key_hash.to_string(),
            reason: e.to_string(),
        })
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove cache entry {}: {}", path.display(), e);
        }
    }
}
