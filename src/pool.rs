//! Bounded pool of expensive, stateful resources (browser instances).
//!
//! Resources are created eagerly when the pool starts and torn down when it
//! closes. In between they are lent out exclusively: a resource is held by at
//! most one [`Lease`] at a time, and `|available| + |in use| == size` holds
//! until the pool is closed.
//!
//! Waiting is done on a fair semaphore whose permit count mirrors the number
//! of available resources, so blocked callers are woken in arrival order and
//! never spin.

use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A resource that can be owned by a [`ResourcePool`].
#[async_trait]
pub trait PooledResource: Send + Sync + 'static {
    /// Tear the resource down. Called once, when the pool closes.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Creates resources for a pool.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    type Resource: PooledResource;

    async fn create(&self) -> anyhow::Result<Self::Resource>;
}

/// Lifecycle state of a single pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Available,
    InUse,
    Closed,
}

struct Slot<R> {
    resource: Arc<R>,
    state: ResourceState,
    /// Bumped on every borrow; a lease only releases the borrow it came from.
    generation: u64,
}

struct PoolState<R> {
    slots: Vec<Slot<R>>,
    /// Indices into `slots` that are currently available.
    available: Vec<usize>,
    closed: bool,
}

impl<R> PoolState<R> {
    /// Mark slot `id` as in use under a fresh generation.
    fn lend(&mut self, id: usize) -> Lease<R> {
        let slot = &mut self.slots[id];
        slot.state = ResourceState::InUse;
        slot.generation += 1;
        Lease {
            id,
            generation: slot.generation,
            resource: Arc::clone(&slot.resource),
        }
    }
}

/// Exclusive borrow of a pooled resource.
///
/// Hand it back with [`ResourcePool::release`]. Releasing the same lease
/// (or a clone of it) twice is harmless, even after the resource has been
/// lent out again.
pub struct Lease<R> {
    id: usize,
    generation: u64,
    resource: Arc<R>,
}

impl<R> Lease<R> {
    /// Position of the resource inside its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Shared handle to the underlying resource.
    pub fn resource(&self) -> Arc<R> {
        Arc::clone(&self.resource)
    }
}

impl<R> Clone for Lease<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            generation: self.generation,
            resource: Arc::clone(&self.resource),
        }
    }
}

impl<R> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<R> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

/// Releases a lease when dropped, so cancelled futures still return it.
struct LeaseGuard<'a, R: PooledResource> {
    pool: &'a ResourcePool<R>,
    lease: Lease<R>,
}

impl<R: PooledResource> Drop for LeaseGuard<'_, R> {
    fn drop(&mut self) {
        self.pool.release(&self.lease);
    }
}

/// Fixed-size pool with exclusive borrow/return semantics.
pub struct ResourcePool<R: PooledResource> {
    state: Mutex<PoolState<R>>,
    permits: Semaphore,
    size: usize,
}

impl<R: PooledResource> ResourcePool<R> {
    /// Create `size` resources eagerly.
    ///
    /// Fails if any factory call fails; resources created before the failure
    /// are torn down so no partial pool is left behind.
    pub async fn start<F>(size: usize, factory: &F) -> Result<Self>
    where
        F: ResourceFactory<Resource = R> + ?Sized,
    {
        if size == 0 {
            return Err(Error::config("pool.size", "pool size must be at least 1"));
        }

        let mut created: Vec<Arc<R>> = Vec::with_capacity(size);
        for index in 0..size {
            match factory.create().await {
                Ok(resource) => created.push(Arc::new(resource)),
                Err(source) => {
                    warn!(
                        "Resource #{} failed to start, tearing down {} already created",
                        index,
                        created.len()
                    );
                    teardown_all(&created).await;
                    return Err(Error::PoolStart { index, source });
                }
            }
        }

        let slots = created
            .into_iter()
            .map(|resource| Slot {
                resource,
                state: ResourceState::Available,
                generation: 0,
            })
            .collect();

        info!("Resource pool started with {} instance(s)", size);

        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                available: (0..size).rev().collect(),
                closed: false,
            }),
            permits: Semaphore::new(size),
            size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of resources the pool was started with.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    pub fn in_use(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|s| s.state == ResourceState::InUse)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of every resource's lifecycle state, by pool position.
    pub fn states(&self) -> Vec<ResourceState> {
        self.lock().slots.iter().map(|s| s.state).collect()
    }

    /// Borrow a resource, waiting until one is available.
    ///
    /// With a `timeout`, gives up with [`Error::PoolExhausted`] once the
    /// deadline passes. Without one, waits as long as it takes.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Lease<R>> {
        let started = Instant::now();

        let acquired = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.permits.acquire())
                .await
                .map_err(|_| Error::PoolExhausted {
                    size: self.size,
                    waited: started.elapsed(),
                })?,
            None => self.permits.acquire().await,
        };
        let permit = acquired.map_err(|_| Error::PoolClosed)?;

        let mut state = self.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }
        // Permits track available slots one-to-one; the permit is given back
        // explicitly in `release`.
        let id = state.available.pop().ok_or(Error::PoolClosed)?;
        permit.forget();

        let lease = state.lend(id);
        drop(state);

        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            debug!("Acquired pooled resource #{} after {:?}", id, waited);
        }
        Ok(lease)
    }

    /// Borrow a resource only if one is free right now.
    pub fn try_acquire(&self) -> Option<Lease<R>> {
        let permit = self.permits.try_acquire().ok()?;
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let id = state.available.pop()?;
        permit.forget();

        Some(state.lend(id))
    }

    /// Return a resource to the pool.
    ///
    /// No-op (returns `false`) if the lease's borrow has already ended, the
    /// lease is not from this pool, or the pool is closed.
    pub fn release(&self, lease: &Lease<R>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let Some(slot) = state.slots.get_mut(lease.id) else {
            return false;
        };
        if slot.state != ResourceState::InUse
            || slot.generation != lease.generation
            || !Arc::ptr_eq(&slot.resource, &lease.resource)
        {
            debug!("Ignoring stale release of pooled resource #{}", lease.id);
            return false;
        }

        slot.state = ResourceState::Available;
        state.available.push(lease.id);
        drop(state);

        self.permits.add_permits(1);
        true
    }

    /// Borrow a resource for the duration of `op`, returning it afterwards
    /// even if `op` fails or the future is dropped.
    pub async fn with_resource<T, F, Fut>(&self, timeout: Option<Duration>, op: F) -> Result<T>
    where
        F: FnOnce(Arc<R>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(timeout).await?;
        let guard = LeaseGuard { pool: self, lease };
        op(guard.lease.resource()).await
    }

    /// Close every resource and refuse further borrows.
    ///
    /// Teardown is best-effort: a resource that fails to close is logged and
    /// skipped so the rest still shut down. Waiters blocked in `acquire`
    /// are woken with [`Error::PoolClosed`].
    pub async fn close(&self) {
        let resources: Vec<Arc<R>> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.available.clear();
            state
                .slots
                .iter_mut()
                .map(|slot| {
                    slot.state = ResourceState::Closed;
                    Arc::clone(&slot.resource)
                })
                .collect()
        };
        self.permits.close();

        teardown_all(&resources).await;
        info!("Resource pool closed");
    }
}

async fn teardown_all<R: PooledResource>(resources: &[Arc<R>]) {
    let results = join_all(resources.iter().map(|r| r.close())).await;
    for (index, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            warn!("Failed to close pooled resource #{}: {}", index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeResource {
        closed: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl PooledResource for FakeResource {
        async fn close(&self) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("browser process already gone");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail_at: Option<usize>,
        fail_close_at: Option<usize>,
    }

    #[async_trait]
    impl ResourceFactory for FakeFactory {
        type Resource = FakeResource;

        async fn create(&self) -> anyhow::Result<FakeResource> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(n) {
                anyhow::bail!("launch failed");
            }
            Ok(FakeResource {
                closed: Arc::clone(&self.closed),
                fail_close: self.fail_close_at == Some(n),
            })
        }
    }

    #[tokio::test]
    async fn test_start_creates_all_resources() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(3, &factory).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_use(), 0);
        assert!(pool
            .states()
            .iter()
            .all(|s| *s == ResourceState::Available));
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_partial_pool() {
        let factory = FakeFactory {
            fail_at: Some(2),
            ..Default::default()
        };
        let err = ResourcePool::start(4, &factory).await.err().unwrap();

        assert!(matches!(err, Error::PoolStart { index: 2, .. }));
        // The two resources created before the failure were torn down.
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let factory = FakeFactory::default();
        assert!(matches!(
            ResourcePool::start(0, &factory).await,
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(2, &factory).await.unwrap();

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);

        assert!(pool.release(&a));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(2, &factory).await.unwrap();

        let lease = pool.acquire(None).await.unwrap();
        assert!(pool.release(&lease));
        assert!(!pool.release(&lease));
        assert!(!pool.release(&lease.clone()));

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
        // Only two permits exist: a third immediate borrow must fail.
        let _a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_release_new_borrow() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(1, &factory).await.unwrap();

        let first = pool.acquire(None).await.unwrap();
        let stale = first.clone();
        assert!(pool.release(&first));

        let second = pool.acquire(None).await.unwrap();
        assert_eq!(second.id(), stale.id());
        assert!(!pool.release(&stale));

        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_none());

        assert!(pool.release(&second));
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_release_of_foreign_lease_is_noop() {
        let factory = FakeFactory::default();
        let pool_a = ResourcePool::start(1, &factory).await.unwrap();
        let pool_b = ResourcePool::start(1, &factory).await.unwrap();

        let lease_a = pool_a.acquire(None).await.unwrap();
        let _lease_b = pool_b.acquire(None).await.unwrap();

        assert!(!pool_b.release(&lease_a));
        assert_eq!(pool_b.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_deadline_returns_exhausted() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(2, &factory).await.unwrap();
        let _a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();

        let started = Instant::now();
        let err = pool
            .acquire(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, Error::PoolExhausted { size: 2, .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let factory = FakeFactory::default();
        let pool = Arc::new(ResourcePool::start(1, &factory).await.unwrap());
        let held = pool.acquire(None).await.unwrap();

        let releaser = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pool.release(&held);
            })
        };

        let started = Instant::now();
        let lease = pool.acquire(Some(Duration::from_secs(1))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(lease.id(), 0);
        releaser.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_borrowers_never_exceed_size() {
        let factory = FakeFactory::default();
        let pool = Arc::new(ResourcePool::start(3, &factory).await.unwrap());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let holders: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let holders = Arc::clone(&holders);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire(None).await.unwrap();
                {
                    let mut h = holders.lock().unwrap();
                    assert!(!h.contains(&lease.id()), "resource lent twice");
                    h.push(lease.id());
                }
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(20)).await;

                current.fetch_sub(1, Ordering::SeqCst);
                holders.lock().unwrap().retain(|id| *id != lease.id());
                pool.release(&lease);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_with_resource_releases_on_error() {
        let factory = FakeFactory::default();
        let pool = ResourcePool::start(1, &factory).await.unwrap();

        let result: Result<()> = pool
            .with_resource(None, |_res| async {
                Err(Error::Operation {
                    target: "alice".into(),
                    message: "boom".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_close_swallows_teardown_errors() {
        let factory = FakeFactory {
            fail_close_at: Some(0),
            ..Default::default()
        };
        let pool = ResourcePool::start(3, &factory).await.unwrap();
        let lease = pool.acquire(None).await.unwrap();

        pool.close().await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
        assert!(pool.is_closed());
        assert!(pool.states().iter().all(|s| *s == ResourceState::Closed));
        assert!(!pool.release(&lease));
        assert!(matches!(pool.acquire(None).await, Err(Error::PoolClosed)));

        // Closing twice does not tear down again.
        pool.close().await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let factory = FakeFactory::default();
        let pool = Arc::new(ResourcePool::start(1, &factory).await.unwrap());
        let _held = pool.acquire(None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(None).await })
        };
        tokio::task::yield_now().await;
        pool.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    }
}
