//! Snapshot store commands.

use std::path::Path;

use console::style;
use serde_json::Value;

use bumi::config::Settings;
use bumi::Error;

use crate::cli::helpers::{print_json, read_json_file};

pub fn cmd_snapshot_save(settings: &Settings, subject: &str, file: &Path) -> anyhow::Result<()> {
    let data: Value = read_json_file(file)?;
    let store = settings.open_snapshots()?;
    let location = store.save(subject, &data)?;
    println!(
        "{} Saved snapshot for {} to {}",
        style("✓").green(),
        subject,
        location.display()
    );
    Ok(())
}

pub fn cmd_snapshot_latest(settings: &Settings, subject: &str) -> anyhow::Result<()> {
    let store = settings.open_snapshots()?;
    match store.load_latest(subject) {
        Ok(snapshot) => print_json(&snapshot),
        Err(Error::SnapshotNotFound { .. }) => {
            println!("{} No snapshots for {}", style("!").yellow(), subject);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn cmd_snapshot_list(settings: &Settings, subject: &str) -> anyhow::Result<()> {
    let store = settings.open_snapshots()?;
    let snapshots = store.list(subject)?;

    if snapshots.is_empty() {
        println!("{} No snapshots for {}", style("!").yellow(), subject);
        return Ok(());
    }

    println!("\n{}", style(format!("Snapshots: {}", subject)).bold());
    println!("{}", "-".repeat(40));
    for info in &snapshots {
        println!(
            "  {}  {}",
            style(info.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")).cyan(),
            info.location.display()
        );
    }
    println!("\n{} snapshot(s)", snapshots.len());
    Ok(())
}
