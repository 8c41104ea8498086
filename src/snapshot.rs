//! Append-only, timestamped snapshots per subject.
//!
//! Snapshots are stored as `{subject}_{stamp}-{seq}.json` where `stamp` is a
//! fixed-width UTC timestamp with millisecond resolution and `seq` breaks
//! ties between snapshots written within the same millisecond. Because every
//! component is fixed width, lexicographic file-name order is also temporal
//! order, with later writes winning ties.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::validate::validate_subject;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3f";
const MAX_SEQ: u32 = 999;

/// A stored snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: PathBuf,
    pub data: serde_json::Value,
}

/// Metadata for a stored snapshot, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u32,
    pub location: PathBuf,
}

/// Directory of snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a new snapshot of `data` for `subject_id`, never overwriting
    /// an existing one. Returns where it was written.
    pub fn save<T: Serialize + ?Sized>(&self, subject_id: &str, data: &T) -> Result<PathBuf> {
        self.save_at(subject_id, data, Utc::now())
    }

    pub(crate) fn save_at<T: Serialize + ?Sized>(
        &self,
        subject_id: &str,
        data: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf> {
        validate_subject(subject_id)?;
        let body = serde_json::to_vec_pretty(data)?;
        let stamp = timestamp.format(STAMP_FORMAT).to_string();

        for seq in 0..=MAX_SEQ {
            let path = self
                .dir
                .join(format!("{}_{}-{:03}.json", subject_id, stamp, seq));

            // create_new makes the existence check and creation one step, so
            // concurrent writers never clobber each other.
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::io(&path, e)),
            };
            file.write_all(&body).map_err(|e| Error::io(&path, e))?;

            info!("Saved snapshot for {} to {}", subject_id, path.display());
            return Ok(path);
        }

        Err(Error::io(
            &self.dir,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("more than {} snapshots for {} at {}", MAX_SEQ + 1, subject_id, stamp),
            ),
        ))
    }

    /// Every snapshot for `subject_id`, oldest first.
    pub fn list(&self, subject_id: &str) -> Result<Vec<SnapshotInfo>> {
        validate_subject(subject_id)?;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut snapshots: Vec<SnapshotInfo> = entries
            .flatten()
            .filter_map(|entry| parse_file_name(&entry.path()))
            .filter(|info| info.subject_id == subject_id)
            .collect();
        snapshots.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
        Ok(snapshots)
    }

    /// Load the most recent snapshot for `subject_id`.
    pub fn load_latest(&self, subject_id: &str) -> Result<Snapshot> {
        let latest = self
            .list(subject_id)?
            .pop()
            .ok_or_else(|| Error::SnapshotNotFound {
                subject: subject_id.to_string(),
            })?;

        debug!("Loading latest snapshot {}", latest.location.display());
        let bytes = fs::read(&latest.location).map_err(|e| Error::io(&latest.location, e))?;
        let data = serde_json::from_slice(&bytes)?;

        Ok(Snapshot {
            subject_id: latest.subject_id,
            timestamp: latest.timestamp,
            location: latest.location,
            data,
        })
    }
}

/// Parse `{subject}_{stamp}-{seq}.json`; `None` for anything else.
fn parse_file_name(path: &Path) -> Option<SnapshotInfo> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (subject, rest) = stem.rsplit_once('_')?;
    let (stamp, seq) = rest.split_once('-')?;

    let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let sequence = seq.parse().ok()?;

    Some(SnapshotInfo {
        subject_id: subject.to_string(),
        timestamp: naive.and_utc(),
        sequence,
        location: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load_latest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let data = json!({"profile": {"bio": "hello"}});

        let path = store.save("alice", &data).unwrap();
        let latest = store.load_latest("alice").unwrap();

        assert_eq!(latest.data, data);
        assert_eq!(latest.location, path);
        assert_eq!(latest.subject_id, "alice");
    }

    #[test]
    fn test_missing_subject_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load_latest("nobody"),
            Err(Error::SnapshotNotFound { subject }) if subject == "nobody"
        ));
    }

    #[test]
    fn test_latest_is_newest_timestamp() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        // Written out of order on purpose.
        store.save_at("alice", &json!({"v": 2}), t2).unwrap();
        store.save_at("alice", &json!({"v": 1}), t1).unwrap();

        assert_eq!(store.load_latest("alice").unwrap().data, json!({"v": 2}));
        assert_eq!(store.list("alice").unwrap().len(), 2);
    }

    #[test]
    fn test_same_timestamp_last_write_wins_and_nothing_is_overwritten() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let first = store.save_at("alice", &json!({"v": 1}), t).unwrap();
        let second = store.save_at("alice", &json!({"v": 2}), t).unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert_eq!(store.load_latest("alice").unwrap().data, json!({"v": 2}));
    }

    #[test]
    fn test_subjects_with_shared_prefix_are_kept_apart() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save("bob", &json!("bob")).unwrap();
        store.save("bob_smith", &json!("bob_smith")).unwrap();

        assert_eq!(store.list("bob").unwrap().len(), 1);
        assert_eq!(store.load_latest("bob").unwrap().data, json!("bob"));
        assert_eq!(store.load_latest("bob_smith").unwrap().data, json!("bob_smith"));
    }

    #[test]
    fn test_invalid_subject_rejected() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.save("../etc", &json!(1)),
            Err(Error::InvalidSubject { .. })
        ));
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("alice_notes.json"), b"{}").unwrap();
        fs::write(dir.path().join("README"), b"hi").unwrap();

        assert!(store.list("alice").unwrap().is_empty());
    }
}
