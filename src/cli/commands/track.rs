//! Change tracking command.

use std::path::Path;

use console::style;
use serde_json::Value;

use bumi::config::Settings;
use bumi::track::ChangeTracker;

use crate::cli::helpers::{print_json, read_json_file};

pub async fn cmd_track(settings: &Settings, subject: &str, file: &Path) -> anyhow::Result<()> {
    let data: Value = read_json_file(file)?;
    let registry = settings.webhook_registry()?;
    let tracker = ChangeTracker::new(settings.open_snapshots()?).with_webhooks(registry.clone());

    let report = tracker.track(subject, &data)?;

    match &report.changes {
        None => eprintln!(
            "{} First snapshot for {}",
            style("✓").green(),
            report.subject
        ),
        Some(changes) if changes.has_changes => eprintln!(
            "{} {} change(s) for {}",
            style("!").yellow(),
            changes.total_changes,
            report.subject
        ),
        Some(_) => eprintln!("{} No changes for {}", style("✓").green(), report.subject),
    }
    print_json(&report)?;

    registry.flush().await;
    Ok(())
}
