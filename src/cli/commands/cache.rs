//! Cache maintenance commands.

use std::time::Duration;

use console::style;
use serde_json::Value;

use bumi::cache::TtlCache;
use bumi::config::Settings;

use crate::cli::helpers::print_json;

/// The cache directory, opened even when caching is disabled for jobs.
fn open(settings: &Settings) -> anyhow::Result<TtlCache> {
    Ok(TtlCache::open(&settings.cache.dir)?)
}

pub fn cmd_cache_clear(settings: &Settings) -> anyhow::Result<()> {
    let cache = open(settings)?;
    let removed = cache.clear()?;
    println!(
        "{} Removed {} cache entries from {}",
        style("✓").green(),
        removed,
        cache.dir().display()
    );
    Ok(())
}

pub fn cmd_cache_sweep(settings: &Settings, ttl_secs: Option<u64>) -> anyhow::Result<()> {
    let cache = open(settings)?;
    let ttl = ttl_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.cache_ttl());
    let removed = cache.sweep(ttl)?;
    println!(
        "{} Removed {} expired entries ({} remaining)",
        style("✓").green(),
        removed,
        cache.len()?
    );
    Ok(())
}

pub fn cmd_cache_get(settings: &Settings, key: &str) -> anyhow::Result<()> {
    let cache = open(settings)?;
    match cache.get::<Value>(key, settings.cache_ttl()) {
        Some(value) => print_json(&value),
        None => {
            println!("{} No fresh cache entry for '{}'", style("!").yellow(), key);
            Ok(())
        }
    }
}
