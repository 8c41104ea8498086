//! Bumi - browser pool, caching and change tracking for profile scraping.
//!
//! A fixed pool of headless browsers is shared between concurrent jobs. Each
//! job is paced, retried with exponential backoff and optionally cached.
//! Scraped profiles are stored as timestamped snapshots and diffed against
//! the previous capture, with webhooks notified about what changed.

pub mod cache;
pub mod compare;
pub mod config;
pub mod diff;
pub mod error;
pub mod job;
pub mod pacer;
pub mod pool;
pub mod retry;
pub mod snapshot;
pub mod track;
pub mod validate;
pub mod webhook;

#[cfg(feature = "browser")]
pub mod browser;

pub use cache::TtlCache;
pub use config::Settings;
pub use error::{Error, Result};
pub use job::{BatchReport, JobEvent, JobRunner};
pub use pacer::{PacerConfig, RatePacer};
pub use pool::{Lease, PooledResource, ResourceFactory, ResourcePool};
pub use retry::{RetryError, RetryPolicy};
pub use snapshot::SnapshotStore;
pub use track::ChangeTracker;
pub use webhook::WebhookRegistry;
