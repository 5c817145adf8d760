//! Tag-keyed registry of shared token buckets.
//!
//! Semantics:
//! - `checkout(tag)` hands out the bucket registered for `tag`, creating one (from the pool or
//!   fresh) on first use. Concurrent callers with the same tag share one bucket.
//! - Each checkout bumps a per-tag reference count; `checkin` drops it. A tag whose count reaches
//!   zero stays registered until the sweep reclaims it.
//! - A background task sweeps every `sweep_interval`: buckets with no holders that have sat
//!   untouched for `idle_ticks` fill intervals and are full again are unregistered and retired
//!   to the pool.
//!
//! Invariants:
//! - At most one bucket is registered per tag.
//! - A tag is in the reference map only while its count is > 0.
//! - A bucket with holders is never swept.
//!
//! Locking: one `RwLock` guards both maps. Bucket construction and pool fetches happen outside
//! the write lock; if two first-time checkouts for a tag race, the loser's bucket goes back to
//! the pool.

use crate::bucket::Bucket;
use crate::clock::{Clock, TokioClock};
use crate::config::ThrottlerConfig;
use crate::pool::BucketPool;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::ThrottleError;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Registry {
    buckets: HashMap<String, Arc<Bucket>>,
    taken: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Counters {
    checkouts: AtomicU64,
    fresh: AtomicU64,
    recycled: AtomicU64,
    evicted: AtomicU64,
    pool_drops: AtomicU64,
    lost_races: AtomicU64,
}

/// Point-in-time counters describing throttler activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottlerStats {
    /// Calls to `checkout`.
    pub checkouts: u64,
    /// Buckets allocated because the pool was empty.
    pub fresh: u64,
    /// Buckets taken from the pool and rebound to a new tag.
    pub recycled: u64,
    /// Buckets removed by the sweep.
    pub evicted: u64,
    /// Retired buckets discarded because the pool was full.
    pub pool_drops: u64,
    /// First-time checkouts whose candidate bucket lost the insertion race.
    pub lost_races: u64,
}

#[derive(Debug)]
struct Shared {
    config: ThrottlerConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    registry: RwLock<Registry>,
    pool: BucketPool,
    counters: Counters,
    closed: AtomicBool,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pooled or fresh bucket bound to `tag`, not yet registered.
    fn prepare(&self, tag: &str) -> Arc<Bucket> {
        let now = self.clock.now();
        let bucket = match self.pool.fetch() {
            Some(bucket) => {
                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                debug!(target: "throttler::registry", tag, "reusing pooled bucket");
                bucket
            }
            None => {
                self.counters.fresh.fetch_add(1, Ordering::Relaxed);
                debug!(target: "throttler::registry", tag, "allocating bucket");
                Arc::new(Bucket::with_parts(
                    self.config.bucket(),
                    self.clock.clone(),
                    self.sleeper.clone(),
                ))
            }
        };
        bucket.rebind(tag, now);
        bucket
    }

    /// Under the write lock, take a reference on the registered bucket for `tag`, registering
    /// `candidate` if there is none. Returns `None` only when nothing is registered and no
    /// candidate was supplied.
    fn install(&self, tag: &str, candidate: Option<Arc<Bucket>>) -> Option<Arc<Bucket>> {
        let mut guard = self.write();
        let registry = &mut *guard;
        if let Some(bucket) = registry.buckets.get(tag).cloned() {
            *registry.taken.entry(tag.to_owned()).or_insert(0) += 1;
            drop(guard);
            if let Some(loser) = candidate {
                self.counters.lost_races.fetch_add(1, Ordering::Relaxed);
                self.retire(loser);
            }
            return Some(bucket);
        }
        let bucket = candidate?;
        registry.buckets.insert(tag.to_owned(), bucket.clone());
        registry.taken.insert(tag.to_owned(), 1);
        Some(bucket)
    }

    fn retire(&self, bucket: Arc<Bucket>) {
        bucket.unbind();
        if !self.pool.retire(bucket) {
            self.counters.pool_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sweep(&self, idle_ticks: u64, stop: impl Fn() -> bool) -> usize {
        let tags: Vec<String> = self.read().buckets.keys().cloned().collect();
        let mut evicted = 0;
        for tag in tags {
            if stop() {
                break;
            }
            if self.evict_if_idle(&tag, idle_ticks) {
                evicted += 1;
            }
        }
        evicted
    }

    fn evict_if_idle(&self, tag: &str, idle_ticks: u64) -> bool {
        let mut guard = self.write();
        let registry = &mut *guard;
        if registry.taken.contains_key(tag) {
            return false;
        }
        let idle = match registry.buckets.get(tag) {
            Some(bucket) => bucket.reclaimable(self.clock.now(), idle_ticks),
            None => false,
        };
        if !idle {
            return false;
        }
        let Some(bucket) = registry.buckets.remove(tag) else {
            return false;
        };
        drop(guard);

        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        debug!(target: "throttler::sweep", tag, "evicting idle bucket");
        self.retire(bucket);
        true
    }
}

/// Thread-safe registry handing out one shared [`Bucket`] per tag.
///
/// Must be created inside a tokio runtime: construction spawns the sweep task. Call
/// [`Throttler::shutdown`] once when done; dropping the throttler also stops the task, with a
/// warning.
///
/// # Examples
/// ```
/// use throttler::Throttler;
/// use std::time::Duration;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let throttler = Throttler::with_interval(Duration::from_secs(1), 20).unwrap();
///
/// let bucket = throttler.checkout("leroy_jenkins");
/// bucket.take(13).await.unwrap();
/// assert_eq!(bucket.take_available(20).unwrap(), 7);
/// throttler.checkin(bucket).unwrap();
///
/// throttler.shutdown().unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct Throttler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl Throttler {
    /// Create a throttler from a validated config with the default clock and sleeper.
    pub fn new(config: ThrottlerConfig) -> Result<Self, ThrottleError> {
        Self::builder(config).build()
    }

    /// Buckets gain one token every `fill_interval`, up to `capacity`.
    pub fn with_interval(fill_interval: Duration, capacity: u64) -> Result<Self, ThrottleError> {
        Self::new(ThrottlerConfig::new(fill_interval, capacity)?)
    }

    /// Buckets gain `rate` tokens per second, up to `capacity`.
    pub fn with_rate(rate: f64, capacity: u64) -> Result<Self, ThrottleError> {
        Self::new(ThrottlerConfig::with_rate(rate, capacity)?)
    }

    /// Start a builder for injecting a clock or sleeper.
    pub fn builder(config: ThrottlerConfig) -> ThrottlerBuilder {
        ThrottlerBuilder::new(config)
    }

    /// Get the bucket for `tag`, creating it if needed. Hand it back with [`Throttler::checkin`].
    pub fn checkout(&self, tag: &str) -> BucketHandle {
        let shared = &self.shared;
        shared.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        loop {
            let resident = shared.read().buckets.contains_key(tag);
            let candidate = if resident { None } else { Some(shared.prepare(tag)) };
            if let Some(bucket) = shared.install(tag, candidate) {
                return BucketHandle { tag: tag.to_owned(), bucket, checked_in: false };
            }
            // Swept between the lookup and the write lock; retry with a candidate.
        }
    }

    /// Release a handle obtained from [`Throttler::checkout`].
    ///
    /// # Errors
    /// Returns `ThrottleError::NotCheckedOut` if this throttler holds no reference for the
    /// handle's tag and bucket (e.g. the handle came from another throttler). Other tags' counts
    /// are untouched.
    pub fn checkin(&self, mut handle: BucketHandle) -> Result<(), ThrottleError> {
        self.release(&mut handle)
    }

    pub(crate) fn release(&self, handle: &mut BucketHandle) -> Result<(), ThrottleError> {
        let mut guard = self.shared.write();
        let registry = &mut *guard;
        let registered = !handle.checked_in
            && registry
                .buckets
                .get(&handle.tag)
                .is_some_and(|bucket| Arc::ptr_eq(bucket, &handle.bucket));
        let count = if registered { registry.taken.get_mut(&handle.tag) } else { None };
        match count {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    registry.taken.remove(&handle.tag);
                }
                handle.checked_in = true;
                Ok(())
            }
            None => {
                warn!(target: "throttler::registry", tag = %handle.tag, "checkin without matching checkout");
                Err(ThrottleError::NotCheckedOut { tag: handle.tag.clone() })
            }
        }
    }

    /// Run one sweep now, evicting idle buckets untouched for at least `idle_ticks` fill
    /// intervals. Returns how many buckets were evicted.
    pub fn sweep(&self, idle_ticks: u64) -> usize {
        self.shared.sweep(idle_ticks, || false)
    }

    /// Stop the background sweep.
    ///
    /// # Errors
    /// Returns `ThrottleError::AlreadyShutdown` on every call after the first.
    pub fn shutdown(&self) -> Result<(), ThrottleError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            warn!(target: "throttler::sweep", "shutdown called more than once");
            return Err(ThrottleError::AlreadyShutdown);
        }
        self.shutdown_tx.send_replace(true);
        debug!(target: "throttler::sweep", "shutdown signalled");
        Ok(())
    }

    /// Whether [`Throttler::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Outstanding checkouts for `tag`.
    pub fn ref_count(&self, tag: &str) -> usize {
        self.shared.read().taken.get(tag).copied().unwrap_or(0)
    }

    /// Whether a bucket is registered for `tag`, held or idle.
    pub fn is_resident(&self, tag: &str) -> bool {
        self.shared.read().buckets.contains_key(tag)
    }

    /// Number of registered buckets.
    pub fn resident_len(&self) -> usize {
        self.shared.read().buckets.len()
    }

    /// Number of retired buckets waiting for reuse.
    pub fn pooled_len(&self) -> usize {
        self.shared.pool.len()
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> ThrottlerStats {
        let c = &self.shared.counters;
        ThrottlerStats {
            checkouts: c.checkouts.load(Ordering::Relaxed),
            fresh: c.fresh.load(Ordering::Relaxed),
            recycled: c.recycled.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            pool_drops: c.pool_drops.load(Ordering::Relaxed),
            lost_races: c.lost_races.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            warn!(target: "throttler::sweep", "throttler dropped without shutdown");
            self.shutdown_tx.send_replace(true);
        }
    }
}

/// Builder for [`Throttler`].
#[derive(Debug)]
pub struct ThrottlerBuilder {
    config: ThrottlerConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl ThrottlerBuilder {
    pub fn new(config: ThrottlerConfig) -> Self {
        Self { config, clock: Arc::new(TokioClock), sleeper: Arc::new(TokioSleeper) }
    }

    /// Clock shared by every bucket (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper used by `Bucket::take` on every bucket.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate the config and start the sweep task on the current tokio runtime.
    pub fn build(self) -> Result<Throttler, ThrottleError> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ThrottleError::NoRuntime)?;

        let period = self.config.sweep_interval();
        let idle_ticks = self.config.idle_ticks();
        let shared = Arc::new(Shared {
            pool: BucketPool::new(self.config.pool_capacity()),
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            registry: RwLock::new(Registry::default()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(run_sweeper(Arc::downgrade(&shared), shutdown_rx, period, idle_ticks));

        Ok(Throttler { shared, shutdown_tx })
    }
}

/// Longest sweep period honoured, matching tokio's own far-future horizon of about 30 years.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(86400 * 365 * 30);

/// First deadline and period for the sweep ticker. Periods beyond [`MAX_SWEEP_PERIOD`] are
/// clamped so deadline arithmetic cannot overflow.
fn sweep_schedule(now: Instant, period: Duration) -> (Instant, Duration) {
    let period = period.min(MAX_SWEEP_PERIOD);
    (now.checked_add(period).unwrap_or(now), period)
}

async fn run_sweeper(
    weak: Weak<Shared>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    idle_ticks: u64,
) {
    let (start, period) = sweep_schedule(Instant::now(), period);
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let Some(shared) = weak.upgrade() else {
            break;
        };
        let evicted = shared.sweep(idle_ticks, || shared.closed.load(Ordering::Acquire));
        if evicted > 0 {
            debug!(target: "throttler::sweep", evicted, "sweep complete");
        }
    }
    debug!(target: "throttler::sweep", "sweep task stopped");
}

/// A checked-out bucket bound to one tag.
///
/// Derefs to [`Bucket`]. Return it with [`Throttler::checkin`]; a handle dropped without checkin
/// keeps its tag pinned in the registry and logs a warning.
#[derive(Debug)]
pub struct BucketHandle {
    tag: String,
    bucket: Arc<Bucket>,
    checked_in: bool,
}

impl BucketHandle {
    /// Tag this handle was checked out for.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether both handles share one underlying bucket.
    pub fn same_bucket(&self, other: &BucketHandle) -> bool {
        Arc::ptr_eq(&self.bucket, &other.bucket)
    }
}

impl Deref for BucketHandle {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.bucket
    }
}

impl Drop for BucketHandle {
    fn drop(&mut self) {
        if !self.checked_in {
            warn!(target: "throttler::registry", tag = %self.tag, "bucket handle dropped without checkin");
        }
    }
}
