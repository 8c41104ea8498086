//! Process-wide request pacing.
//!
//! Enforces a minimum spacing between outbound requests. Overlapping
//! `wait()` calls are serialized on the pacer's own lock, so each caller
//! computes its delay against the time the previous caller actually finished
//! waiting.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Pacing configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PacerConfig {
    /// Minimum delay between requests.
    pub min_delay: Duration,
    /// Upper bound for randomized delays.
    pub max_delay: Duration,
    /// Pick a uniform delay in `[min_delay, max_delay]` instead of `min_delay`.
    pub randomize: bool,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            randomize: true,
        }
    }
}

impl PacerConfig {
    /// Fixed spacing, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min_delay: delay,
            max_delay: delay,
            randomize: false,
        }
    }

    fn target_delay(&self) -> Duration {
        if self.randomize && self.max_delay > self.min_delay {
            rand::rng().random_range(self.min_delay..=self.max_delay)
        } else {
            self.min_delay
        }
    }
}

/// Global request pacer. Construct once and share by handle.
#[derive(Debug)]
pub struct RatePacer {
    config: PacerConfig,
    last_request: Mutex<Option<Instant>>,
}

impl RatePacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Suspend until the configured spacing since the previous request has
    /// elapsed, then record the current instant as the last request time.
    ///
    /// Returns how long the caller was suspended.
    pub async fn wait(&self) -> Duration {
        let mut last = self.last_request.lock().await;

        let delay = self.config.target_delay();
        let remaining = match *last {
            Some(previous) => delay.saturating_sub(previous.elapsed()),
            None => Duration::ZERO,
        };

        if !remaining.is_zero() {
            debug!("Pacing request: waiting {:?}", remaining);
            tokio::time::sleep(remaining).await;
        }

        *last = Some(Instant::now());
        remaining
    }

    /// Forget the last request time so the next `wait()` returns at once.
    pub async fn reset(&self) {
        *self.last_request.lock().await = None;
    }

    /// Instant the last `wait()` completed, if any.
    pub async fn last_request(&self) -> Option<Instant> {
        *self.last_request.lock().await
    }
}

impl Default for RatePacer {
    fn default() -> Self {
        Self::new(PacerConfig::default())
    }
}
