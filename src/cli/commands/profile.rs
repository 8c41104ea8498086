//! Profile URL normalization.

use bumi::validate::{normalize_profile_url, parse_profile_url};

pub fn cmd_profile_url(input: &str) -> anyhow::Result<()> {
    let url = normalize_profile_url(input)?;
    let username = parse_profile_url(&url)?;
    println!("{}\t{}", username, url);
    Ok(())
}
