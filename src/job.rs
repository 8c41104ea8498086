//! Scrape jobs.
//!
//! A job borrows a resource from the pool, waits on the pacer, runs its
//! operation through the retry executor and hands the resource back, with an
//! optional cache in front. Batches run jobs concurrently, bounded by the
//! pool size.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::pacer::RatePacer;
use crate::pool::{PooledResource, ResourcePool};
use crate::retry::{self, RetryError, RetryPolicy};
use crate::webhook::{
    WebhookRegistry, EVENT_BATCH_COMPLETE, EVENT_SCRAPE_COMPLETE, EVENT_SCRAPE_ERROR,
};

/// Progress events emitted while jobs run.
#[derive(Debug, Clone)]
pub enum JobEvent {
    BatchStarted { total: usize },
    JobCompleted { target: String, cached: bool },
    JobFailed { target: String, error: String },
    BatchComplete { summary: BatchSummary },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub target: String,
    pub result: Result<T>,
    /// Whether the value came from the cache.
    pub cached: bool,
}

/// Results of [`JobRunner::run_batch`], in target order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<JobOutcome<T>>,
    pub summary: BatchSummary,
}

struct JobCache {
    cache: TtlCache,
    ttl: Duration,
}

/// Runs jobs against a shared pool and pacer.
pub struct JobRunner<R: PooledResource> {
    pool: Arc<ResourcePool<R>>,
    pacer: Arc<RatePacer>,
    retry: RetryPolicy<Error>,
    cache: Option<JobCache>,
    acquire_timeout: Option<Duration>,
    webhooks: Option<WebhookRegistry>,
    events: Option<mpsc::Sender<JobEvent>>,
}

impl<R: PooledResource> JobRunner<R> {
    /// Runner with the default retry policy, retrying only
    /// [`Error::is_retryable`] failures.
    pub fn new(pool: Arc<ResourcePool<R>>, pacer: Arc<RatePacer>) -> Self {
        Self {
            pool,
            pacer,
            retry: RetryPolicy::default().retry_if(Error::is_retryable),
            cache: None,
            acquire_timeout: None,
            webhooks: None,
            events: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy<Error>) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_cache(mut self, cache: TtlCache, ttl: Duration) -> Self {
        self.cache = Some(JobCache { cache, ttl });
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_webhooks(mut self, registry: WebhookRegistry) -> Self {
        self.webhooks = Some(registry);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn pool(&self) -> &Arc<ResourcePool<R>> {
        &self.pool
    }

    pub fn pacer(&self) -> &Arc<RatePacer> {
        &self.pacer
    }

    /// Run one job. `cache_key` enables the cache for this job when a
    /// cache is configured.
    pub async fn run<T, Op, Fut>(&self, target: &str, cache_key: Option<&str>, op: Op) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        Op: Fn(Arc<R>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_reported(target, cache_key, op).await.result
    }

    /// Run one job per target, at most `pool.size()` at a time.
    pub async fn run_batch<T, Op, Fut, K>(
        &self,
        targets: &[String],
        cache_key: K,
        op: Op,
    ) -> BatchReport<T>
    where
        T: Serialize + DeserializeOwned,
        K: Fn(&str) -> Option<String>,
        Op: Fn(String, Arc<R>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.emit(JobEvent::BatchStarted {
            total: targets.len(),
        })
        .await;

        let op = &op;
        let outcomes: Vec<JobOutcome<T>> = stream::iter(targets)
            .map(|target| {
                let key = cache_key(target.as_str());
                async move {
                    self.run_reported(target, key.as_deref(), move |resource| {
                        op(target.clone(), resource)
                    })
                    .await
                }
            })
            .buffered(self.pool.size().max(1))
            .collect()
            .await;

        let successful = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let summary = BatchSummary {
            total: outcomes.len(),
            successful,
            failed: outcomes.len() - successful,
        };
        info!(
            "Batch complete: {} succeeded, {} failed",
            summary.successful, summary.failed
        );

        if let Some(webhooks) = &self.webhooks {
            webhooks.notify(
                EVENT_BATCH_COMPLETE,
                json!({
                    "total": summary.total,
                    "successful": summary.successful,
                    "failed": summary.failed,
                    "targets": targets,
                }),
            );
        }
        self.emit(JobEvent::BatchComplete { summary }).await;

        BatchReport { outcomes, summary }
    }

    async fn run_reported<T, Op, Fut>(
        &self,
        target: &str,
        cache_key: Option<&str>,
        op: Op,
    ) -> JobOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        Op: Fn(Arc<R>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let job_id = format!("job_{}", uuid::Uuid::new_v4().simple());
        let (result, cached) = match self.run_job(target, cache_key, op).await {
            Ok((value, cached)) => (Ok(value), cached),
            Err(e) => (Err(e), false),
        };

        match &result {
            Ok(value) => {
                if let Some(webhooks) = &self.webhooks {
                    webhooks.notify(
                        EVENT_SCRAPE_COMPLETE,
                        json!({
                            "job_id": job_id,
                            "target_url": target,
                            "success": true,
                            "cached": cached,
                            "result": serde_json::to_value(value).unwrap_or_default(),
                        }),
                    );
                }
                self.emit(JobEvent::JobCompleted {
                    target: target.to_string(),
                    cached,
                })
                .await;
            }
            Err(e) => {
                warn!("Job {} for {} failed: {}", job_id, target, e);
                if let Some(webhooks) = &self.webhooks {
                    webhooks.notify(
                        EVENT_SCRAPE_ERROR,
                        json!({
                            "job_id": job_id,
                            "target_url": target,
                            "success": false,
                            "error": e.to_string(),
                        }),
                    );
                }
                self.emit(JobEvent::JobFailed {
                    target: target.to_string(),
                    error: e.to_string(),
                })
                .await;
            }
        }

        JobOutcome {
            target: target.to_string(),
            result,
            cached,
        }
    }

    async fn run_job<T, Op, Fut>(
        &self,
        target: &str,
        cache_key: Option<&str>,
        op: Op,
    ) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        Op: Fn(Arc<R>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cache = cache_key.zip(self.cache.as_ref());

        if let Some((key, job_cache)) = cache {
            if let Some(hit) = job_cache.cache.get::<T>(key, job_cache.ttl) {
                debug!("Cache hit for {} ({})", target, key);
                return Ok((hit, true));
            }
        }

        // The lease is returned when this future completes or is dropped.
        let value = self
            .pool
            .with_resource(self.acquire_timeout, |resource| async move {
                self.pacer.wait().await;
                retry::execute(&self.retry, || op(Arc::clone(&resource)))
                    .await
                    .map_err(|e| surface(target, e))
            })
            .await?;

        if let Some((key, job_cache)) = cache {
            if let Err(e) = job_cache.cache.set(key, &value) {
                warn!("Failed to cache result for {}: {}", target, e);
            }
        }

        Ok((value, false))
    }

    async fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching progress.
            let _ = events.send(event).await;
        }
    }
}

/// Attach the job target to a retry failure.
fn surface(target: &str, error: RetryError<Error>) -> Error {
    match error {
        RetryError::Exhausted { attempts, last } => Error::RetriesExhausted {
            target: target.to_string(),
            attempts,
            last_error: last.to_string(),
        },
        RetryError::Aborted {
            error: error @ Error::Operation { .. },
            ..
        } => error,
        RetryError::Aborted { error, .. } => Error::Operation {
            target: target.to_string(),
            message: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::PacerConfig;
    use crate::pool::ResourceFactory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::time::Instant;

    struct FakePage {
        id: usize,
    }

    #[async_trait]
    impl PooledResource for FakePage {
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        next: AtomicUsize,
    }

    #[async_trait]
    impl ResourceFactory for FakeFactory {
        type Resource = FakePage;

        async fn create(&self) -> anyhow::Result<FakePage> {
            Ok(FakePage {
                id: self.next.fetch_add(1, Ordering::SeqCst),
            })
        }
    }

    async fn runner(size: usize, pace: Duration) -> JobRunner<FakePage> {
        let pool = ResourcePool::start(size, &FakeFactory::default())
            .await
            .unwrap();
        JobRunner::new(Arc::new(pool), Arc::new(RatePacer::new(PacerConfig::fixed(pace))))
            .with_retry(
                RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100))
                    .retry_if(Error::is_retryable),
            )
    }

    fn transient(target: &str) -> Error {
        Error::Transient {
            target: target.to_string(),
            message: "navigation timeout".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_caches_result() {
        let dir = tempdir().unwrap();
        let runner = runner(1, Duration::ZERO)
            .await
            .with_cache(TtlCache::open(dir.path()).unwrap(), Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let html: String = runner
                .run("alice", Some("page:alice"), |page| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, Error>(format!("<html>{}</html>", page.id)) }
                })
                .await
                .unwrap();
            assert_eq!(html, "<html>0</html>");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.pool().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let runner = runner(2, Duration::ZERO).await;
        let calls = AtomicU32::new(0);

        let value = runner
            .run("bob", None, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(transient("bob"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(runner.pool().available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_carry_target_and_attempts() {
        let runner = runner(1, Duration::ZERO).await;

        let err = runner
            .run("carol", None, |_| async { Err::<(), _>(transient("carol")) })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RetriesExhausted { ref target, attempts: 4, .. } if target == "carol"
        ));
        assert_eq!(runner.pool().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_runs_once() {
        let runner = runner(1, Duration::ZERO).await;
        let calls = AtomicU32::new(0);

        let err = runner
            .run("dave", None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(Error::SnapshotNotFound {
                        subject: "dave".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Operation { ref target, .. } if target == "dave"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_surfaces_pool_exhausted() {
        let runner = runner(1, Duration::ZERO)
            .await
            .with_acquire_timeout(Some(Duration::from_millis(50)));
        let _held = runner.pool().acquire(None).await.unwrap();

        let err = runner
            .run("erin", None, |_| async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PoolExhausted { size: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_reports_in_order_with_events() {
        let runner = runner(2, Duration::ZERO).await;
        let (tx, mut rx) = mpsc::channel(16);
        let runner = runner.with_events(tx);
        let targets: Vec<String> = ["a", "b", "bad", "c"].iter().map(|s| s.to_string()).collect();

        let report = runner
            .run_batch(&targets, |_| None, |target, _| async move {
                if target == "bad" {
                    Err(Error::Operation {
                        target,
                        message: "profile is private".to_string(),
                    })
                } else {
                    Ok(target.to_uppercase())
                }
            })
            .await;

        assert_eq!(
            report.summary,
            BatchSummary {
                total: 4,
                successful: 3,
                failed: 1
            }
        );
        let order: Vec<&str> = report.outcomes.iter().map(|o| o.target.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "bad", "c"]);
        assert_eq!(report.outcomes[3].result.as_ref().unwrap(), "C");

        drop(runner);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(JobEvent::BatchStarted { total: 4 })));
        assert!(matches!(events.last(), Some(JobEvent::BatchComplete { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, JobEvent::JobFailed { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_paced() {
        let runner = runner(3, Duration::from_secs(1)).await;
        let targets: Vec<String> = (0..3).map(|i| format!("t{}", i)).collect();
        let started = Instant::now();

        let report = runner
            .run_batch(&targets, |_| None, |target, _| async move { Ok::<_, Error>(target) })
            .await;

        assert_eq!(report.summary.successful, 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
