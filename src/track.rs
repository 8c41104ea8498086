//! Change tracking: compare a fresh capture against the subject's latest
//! snapshot, then store it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::diff::{detect_profile_changes, ProfileChanges};
use crate::error::{Error, Result};
use crate::snapshot::SnapshotStore;
use crate::webhook::{WebhookRegistry, EVENT_PROFILE_CHANGED};

/// Where the snapshot a capture was compared against lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    pub timestamp: DateTime<Utc>,
    pub location: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub subject: String,
    /// `None` on the first capture of a subject.
    pub previous: Option<SnapshotRef>,
    pub saved: PathBuf,
    /// `None` on the first capture, since there is nothing to compare with.
    pub changes: Option<ProfileChanges>,
}

impl TrackReport {
    pub fn has_changes(&self) -> bool {
        self.changes.as_ref().is_some_and(|c| c.has_changes)
    }
}

pub struct ChangeTracker {
    store: SnapshotStore,
    webhooks: Option<WebhookRegistry>,
}

impl ChangeTracker {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            webhooks: None,
        }
    }

    pub fn with_webhooks(mut self, registry: WebhookRegistry) -> Self {
        self.webhooks = Some(registry);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Diff `data` against the latest snapshot of `subject`, save it as the
    /// new latest, and notify `profile_changed` subscribers if it differs.
    ///
    /// Webhooks are only delivered when called from within a tokio runtime.
    pub fn track(&self, subject: &str, data: &Value) -> Result<TrackReport> {
        let previous = match self.store.load_latest(subject) {
            Ok(snapshot) => Some(snapshot),
            Err(Error::SnapshotNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let changes = previous
            .as_ref()
            .map(|snapshot| detect_profile_changes(&snapshot.data, data));
        let saved = self.store.save(subject, data)?;

        let report = TrackReport {
            subject: subject.to_string(),
            previous: previous.map(|snapshot| SnapshotRef {
                timestamp: snapshot.timestamp,
                location: snapshot.location,
            }),
            saved,
            changes,
        };

        match &report.changes {
            None => info!("First snapshot for {}", subject),
            Some(changes) if changes.has_changes => {
                info!("{}: {} change(s) detected", subject, changes.total_changes);
                if let Some(webhooks) = &self.webhooks {
                    webhooks.notify(
                        EVENT_PROFILE_CHANGED,
                        json!({
                            "subject": subject,
                            "total_changes": changes.total_changes,
                            "changes": changes,
                        }),
                    );
                }
            }
            Some(_) => info!("{}: no changes", subject),
        }

        Ok(report)
    }
}
