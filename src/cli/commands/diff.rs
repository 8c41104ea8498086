//! Diff two JSON documents.

use std::path::Path;

use console::style;
use serde_json::Value;

use bumi::diff::{compute_delta, detect_profile_changes};

use crate::cli::helpers::{print_json, read_json_file};

pub fn cmd_diff(old: &Path, new: &Path, profile: bool) -> anyhow::Result<()> {
    let old: Value = read_json_file(old)?;
    let new: Value = read_json_file(new)?;

    if profile {
        let changes = detect_profile_changes(&old, &new);
        if !changes.has_changes {
            eprintln!("{} No changes", style("✓").green());
        }
        return print_json(&changes);
    }

    let delta = compute_delta(&old, &new, "");
    if delta.is_empty() {
        eprintln!("{} No changes", style("✓").green());
    }
    print_json(&delta)
}
