//! Configuration loading.
//!
//! Settings come from a TOML file (explicit path, `./bumi.toml`, or
//! `~/.config/bumi/config.toml`), then `BUMI_*` environment variables are
//! applied on top. Every field has a default, so an empty or missing file is
//! a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::pacer::PacerConfig;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotStore;
use crate::webhook::WebhookRegistry;

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "bumi.toml";

/// Application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub pacer: PacerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub snapshots: SnapshotSettings,
    pub timeouts: Timeouts,
    pub webhooks: Vec<WebhookSettings>,
    /// File the settings were read from, if any.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Browser pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of browser instances (default: 3).
    pub size: usize,
    /// Run browsers headless (default: true).
    pub headless: bool,
    /// Give up waiting for a free browser after this long. Waits forever
    /// when unset.
    pub acquire_timeout_ms: Option<u64>,
    /// Additional Chrome arguments.
    pub chrome_args: Vec<String>,
    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    pub remote_url: Option<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 3,
            headless: true,
            acquire_timeout_ms: None,
            chrome_args: Vec::new(),
            remote_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub randomize: bool,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 2000,
            randomize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub ttl_secs: u64,
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: home_dir().join(".bumi_cache"),
            ttl_secs: 3600,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            dir: home_dir().join(".bumi_snapshots"),
        }
    }
}

/// Page timeouts, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub page_load_ms: u64,
    pub navigation_ms: u64,
    pub element_wait_ms: u64,
    pub script_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            page_load_ms: 30_000,
            navigation_ms: 30_000,
            element_wait_ms: 10_000,
            script_ms: 30_000,
        }
    }
}

impl Timeouts {
    pub fn page_load(&self) -> Duration {
        Duration::from_millis(self.page_load_ms)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn element_wait(&self) -> Duration {
        Duration::from_millis(self.element_wait_ms)
    }

    pub fn script(&self) -> Duration {
        Duration::from_millis(self.script_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    /// Subscribed events; all default events when empty.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

impl Settings {
    /// Load settings: `explicit` if given, else the first config file found
    /// in the standard locations, else defaults. Environment overrides are
    /// applied and the result validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let settings = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => match Self::discover() {
                Some(path) => Self::load_from_path(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        let settings = settings.with_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Standard config file locations, in lookup order.
    pub fn config_candidates() -> Vec<PathBuf> {
        vec![
            PathBuf::from(LOCAL_CONFIG_FILE),
            home_dir().join(".config").join("bumi").join("config.toml"),
        ]
    }

    fn discover() -> Option<PathBuf> {
        Self::config_candidates().into_iter().find(|p| p.is_file())
    }

    /// Read settings from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut settings = Self::from_toml_str(&contents)
            .map_err(|e| Error::config(path.display().to_string(), e.to_string()))?;
        settings.source_path = Some(path.to_path_buf());
        debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        let mut settings: Settings = toml::from_str(contents)?;
        settings.cache.dir = expand_home(&settings.cache.dir);
        settings.snapshots.dir = expand_home(&settings.snapshots.dir);
        Ok(settings)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `BUMI_CACHE_DIR`: cache directory
    /// - `BUMI_SNAPSHOT_DIR`: snapshot directory
    /// - `BUMI_POOL_SIZE`: number of browser instances
    /// - `BUMI_MIN_DELAY_MS` / `BUMI_MAX_DELAY_MS`: request pacing bounds
    /// - `BUMI_BROWSER_URL`: remote Chrome DevTools URL
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("BUMI_CACHE_DIR") {
            self.cache.dir = expand_home(Path::new(&dir));
        }
        if let Some(dir) = lookup("BUMI_SNAPSHOT_DIR") {
            self.snapshots.dir = expand_home(Path::new(&dir));
        }
        if let Some(size) = lookup("BUMI_POOL_SIZE") {
            self.pool.size = parse_env("BUMI_POOL_SIZE", &size)?;
        }
        if let Some(ms) = lookup("BUMI_MIN_DELAY_MS") {
            self.pacer.min_delay_ms = parse_env("BUMI_MIN_DELAY_MS", &ms)?;
        }
        if let Some(ms) = lookup("BUMI_MAX_DELAY_MS") {
            self.pacer.max_delay_ms = parse_env("BUMI_MAX_DELAY_MS", &ms)?;
        }
        if let Some(url) = lookup("BUMI_BROWSER_URL") {
            self.pool.remote_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(Error::config("pool.size", "must be at least 1"));
        }
        if self.pacer.max_delay_ms < self.pacer.min_delay_ms {
            return Err(Error::config(
                "pacer.max_delay_ms",
                format!(
                    "{} is below pacer.min_delay_ms ({})",
                    self.pacer.max_delay_ms, self.pacer.min_delay_ms
                ),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::config(
                "retry.max_delay_ms",
                format!(
                    "{} is below retry.base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            ));
        }
        Ok(())
    }

    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            min_delay: Duration::from_millis(self.pacer.min_delay_ms),
            max_delay: Duration::from_millis(self.pacer.max_delay_ms),
            randomize: self.pacer.randomize,
        }
    }

    /// Retry policy that retries [`Error::is_retryable`] failures.
    pub fn retry_policy(&self) -> RetryPolicy<Error> {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .retry_if(Error::is_retryable)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.pool.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Open the cache directory, or `None` when caching is disabled.
    pub fn open_cache(&self) -> Result<Option<TtlCache>> {
        if !self.cache.enabled {
            return Ok(None);
        }
        TtlCache::open(&self.cache.dir).map(Some)
    }

    pub fn open_snapshots(&self) -> Result<SnapshotStore> {
        SnapshotStore::open(&self.snapshots.dir)
    }

    /// Registry holding every configured webhook.
    pub fn webhook_registry(&self) -> Result<WebhookRegistry> {
        let registry = WebhookRegistry::new()?;
        for hook in &self.webhooks {
            let events = (!hook.events.is_empty()).then(|| hook.events.clone());
            registry.register(hook.id.as_deref(), &hook.url, events, hook.headers.clone())?;
        }
        Ok(registry)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(name, format!("expected a non-negative integer, got '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.pool.size, 3);
        assert!(settings.pool.headless);
        assert_eq!(settings.acquire_timeout(), None);
        assert_eq!(settings.pacer_config(), PacerConfig::default());
        assert_eq!(settings.cache_ttl(), Duration::from_secs(3600));
        assert!(settings.cache.dir.ends_with(".bumi_cache"));
        assert!(settings.snapshots.dir.ends_with(".bumi_snapshots"));
        assert_eq!(settings.timeouts.element_wait(), Duration::from_secs(10));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [pool]
            size = 5
            acquire_timeout_ms = 2500

            [pacer]
            randomize = false

            [cache]
            dir = "~/scrape-cache"

            [[webhooks]]
            url = "https://example.com/hook"
            events = ["profile_changed"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.pool.size, 5);
        assert!(settings.pool.headless);
        assert_eq!(settings.acquire_timeout(), Some(Duration::from_millis(2500)));
        assert!(!settings.pacer.randomize);
        assert_eq!(settings.pacer.min_delay_ms, 1000);
        assert!(!settings.cache.dir.starts_with("~"));
        assert!(settings.cache.dir.ends_with("scrape-cache"));
        assert_eq!(settings.webhooks.len(), 1);
        assert_eq!(settings.retry.max_retries, 3);
    }

    #[test]
    fn test_load_from_path_records_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bumi.toml");
        std::fs::write(&path, "[retry]\nmax_retries = 1\n").unwrap();

        let settings = Settings::load_from_path(&path).unwrap();
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.source_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bumi.toml");
        std::fs::write(&path, "[pool]\nsize = \"many\"\n").unwrap();

        assert!(matches!(
            Settings::load_from_path(&path),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::default()
            .apply_overrides(overrides(&[
                ("BUMI_POOL_SIZE", "7"),
                ("BUMI_MIN_DELAY_MS", "250"),
                ("BUMI_MAX_DELAY_MS", "500"),
                ("BUMI_CACHE_DIR", "/tmp/bumi-cache"),
                ("BUMI_BROWSER_URL", "ws://localhost:9222"),
            ]))
            .unwrap();

        assert_eq!(settings.pool.size, 7);
        assert_eq!(settings.pacer.min_delay_ms, 250);
        assert_eq!(settings.pacer.max_delay_ms, 500);
        assert_eq!(settings.cache.dir, PathBuf::from("/tmp/bumi-cache"));
        assert_eq!(settings.pool.remote_url.as_deref(), Some("ws://localhost:9222"));
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let err = Settings::default()
            .apply_overrides(overrides(&[("BUMI_POOL_SIZE", "three")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { ref key, .. } if key == "BUMI_POOL_SIZE"));
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.pacer.min_delay_ms = 3000;
        assert!(matches!(
            settings.validate(),
            Err(Error::Config { ref key, .. }) if key == "pacer.max_delay_ms"
        ));

        let mut settings = Settings::default();
        settings.pool.size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = Settings::default().retry_policy();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert!(policy.is_retryable(&Error::Transient {
            target: "t".to_string(),
            message: "timeout".to_string(),
        }));
        assert!(!policy.is_retryable(&Error::PoolClosed));
    }

    #[test]
    fn test_disabled_cache_is_not_opened() {
        let mut settings = Settings::default();
        settings.cache.enabled = false;
        assert!(settings.open_cache().unwrap().is_none());
    }

    #[test]
    fn test_webhook_registry_from_settings() {
        let settings = Settings::from_toml_str(
            r#"
            [[webhooks]]
            id = "ops"
            url = "https://example.com/hook"
            events = ["scrape_error"]

            [[webhooks]]
            url = "https://example.com/all"
            "#,
        )
        .unwrap();

        let registry = settings.webhook_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("ops").unwrap().events, vec!["scrape_error"]);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/dir")), PathBuf::from("/abs/dir"));
        assert!(!expand_home(Path::new("~/x")).starts_with("~"));
    }
}
