//! Compare two users' collections.

use std::path::Path;

use serde_json::Value;

use bumi::compare::{compare_collections, recommendations};

use crate::cli::helpers::{file_label, print_json, read_json_file};

pub fn cmd_compare(
    first: &Path,
    second: &Path,
    key: &str,
    show_recommendations: bool,
) -> anyhow::Result<()> {
    let items1: Vec<Value> = read_json_file(first)?;
    let items2: Vec<Value> = read_json_file(second)?;

    let comparison = compare_collections(
        &file_label(first),
        &items1,
        &file_label(second),
        &items2,
        key,
    );

    if show_recommendations {
        print_json(&recommendations(&comparison))
    } else {
        print_json(&comparison)
    }
}
