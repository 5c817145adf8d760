//! Token bucket with lazy, tick-quantized refill.
//!
//! Time since the bucket's epoch is divided into ticks of `fill_interval`; each tick adds one
//! token, up to `capacity`. Nothing runs in the background: the refill is caught up whenever the
//! bucket is touched.
//!
//! Invariants:
//! - `0 <= avail <= capacity`.
//! - `avail_tick` never decreases, so catching up twice at the same instant credits nothing new.
//! - Tokens leave the bucket only through `take` / `take_available`.

use crate::clock::{Clock, TokioClock};
use crate::config::{BucketConfig, ConfigError};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::ThrottleError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    start: Instant,
    avail_tick: u64,
    avail: u64,
    tag: Option<String>,
}

impl BucketState {
    fn fresh(now: Instant, capacity: u64) -> Self {
        Self { start: now, avail_tick: 0, avail: capacity, tag: None }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    fn tick_at(&self, now: Instant, fill_interval: Duration) -> u64 {
        let ticks = self.elapsed(now).as_nanos() / fill_interval.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Tokens `adjust` would leave at `now`, without recording the catch-up.
    fn peek(&self, now: Instant, config: &BucketConfig) -> u64 {
        let gained = self.tick_at(now, config.fill_interval()).saturating_sub(self.avail_tick);
        self.avail.saturating_add(gained).min(config.capacity())
    }

    /// Credit tokens for ticks elapsed since the last catch-up. Returns the current tick.
    fn adjust(&mut self, now: Instant, config: &BucketConfig) -> u64 {
        let tick = self.tick_at(now, config.fill_interval());
        if tick > self.avail_tick {
            let gained = tick - self.avail_tick;
            self.avail = self.avail.saturating_add(gained).min(config.capacity());
            self.avail_tick = tick;
        }
        tick
    }
}

/// Offset from the epoch at which `tick` begins.
fn tick_offset(fill_interval: Duration, tick: u64) -> Duration {
    let nanos = fill_interval.as_nanos().saturating_mul(u128::from(tick));
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

/// A single token bucket.
///
/// All methods take `&self`; the token state sits behind a per-bucket mutex so several holders of
/// the same tag can share one bucket through an `Arc`.
///
/// # Examples
/// ```
/// use throttler::Bucket;
/// use std::time::Duration;
///
/// let bucket = Bucket::new(Duration::from_secs(1), 10).unwrap();
/// assert_eq!(bucket.take_available(4).unwrap(), 4);
/// assert_eq!(bucket.available(), 6);
/// ```
#[derive(Debug)]
pub struct Bucket {
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a full bucket that gains one token every `fill_interval`, up to `capacity`.
    /// Errors if `capacity` == 0 or `fill_interval` is zero.
    pub fn new(fill_interval: Duration, capacity: u64) -> Result<Self, ConfigError> {
        Self::from_config(BucketConfig::new(fill_interval, capacity)?)
    }

    /// Create a full bucket that gains `rate` tokens per second, up to `capacity`.
    pub fn with_rate(rate: f64, capacity: u64) -> Result<Self, ConfigError> {
        Self::from_config(BucketConfig::with_rate(rate, capacity)?)
    }

    /// Create a full bucket from a bucket shape.
    ///
    /// The shape is re-validated, since a deserialized `BucketConfig` skips the checks in
    /// [`BucketConfig::new`].
    pub fn from_config(config: BucketConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_parts(config, Arc::new(TokioClock), Arc::new(TokioSleeper)))
    }

    pub(crate) fn with_parts(
        config: BucketConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let state = BucketState::fresh(clock.now(), config.capacity());
        Self { config, clock, sleeper, state: Mutex::new(state) }
    }

    /// Override the clock; the bucket restarts full at the new clock's current time.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        Self::with_parts(self.config, Arc::new(clock), self.sleeper)
    }

    /// Override how `take` waits for refills.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Shape of this bucket.
    pub fn config(&self) -> BucketConfig {
        self.config
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> u64 {
        self.config.capacity()
    }

    /// Interval between single-token refills.
    pub fn fill_interval(&self) -> Duration {
        self.config.fill_interval()
    }

    /// Tag the bucket is currently bound to, if any.
    pub fn tag(&self) -> Option<String> {
        self.state().tag.clone()
    }

    /// Tokens available right now, counting refills due so far.
    ///
    /// Read-only: polling it does not count as activity, so it never keeps an idle bucket from
    /// being swept.
    pub fn available(&self) -> u64 {
        self.state().peek(self.clock.now(), &self.config)
    }

    /// Take up to `n` tokens without waiting; returns how many were taken (possibly 0).
    ///
    /// # Errors
    /// Returns `ThrottleError::ExceedsCapacity` if `n` is larger than the bucket's capacity.
    pub fn take_available(&self, n: u64) -> Result<u64, ThrottleError> {
        self.check_request(n)?;
        let mut state = self.state();
        state.adjust(self.clock.now(), &self.config);
        let granted = n.min(state.avail);
        state.avail -= granted;
        Ok(granted)
    }

    /// Take exactly `n` tokens, waiting for refills if needed. Returns the time spent waiting.
    ///
    /// The wait is computed from the refill schedule, slept without holding any lock, and then
    /// rechecked; a concurrent taker that got there first just causes another computed wait.
    /// Dropping the future (e.g. via `tokio::time::timeout`) takes nothing.
    ///
    /// # Errors
    /// Returns `ThrottleError::ExceedsCapacity` immediately if `n` could never be satisfied.
    pub async fn take(&self, n: u64) -> Result<Duration, ThrottleError> {
        self.check_request(n)?;
        let started = self.clock.now();
        loop {
            let wait = {
                let mut state = self.state();
                let now = self.clock.now();
                let tick = state.adjust(now, &self.config);
                if state.avail >= n {
                    state.avail -= n;
                    return Ok(now.saturating_duration_since(started));
                }
                let missing = n - state.avail;
                let ready_at = tick_offset(self.config.fill_interval(), tick.saturating_add(missing));
                ready_at.saturating_sub(state.elapsed(now))
            };
            tracing::trace!(
                target: "throttler::bucket",
                tokens = n,
                wait_ms = wait.as_millis() as u64,
                "waiting for refill"
            );
            self.sleeper.sleep(wait).await;
        }
    }

    fn check_request(&self, n: u64) -> Result<(), ThrottleError> {
        if n > self.config.capacity() {
            return Err(ThrottleError::ExceedsCapacity {
                requested: n,
                capacity: self.config.capacity(),
            });
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Catch up on refills as of `now`. Calling it again with the same or an earlier `now`
    /// changes nothing.
    pub fn adjust(&self, now: Instant) {
        self.state().adjust(now, &self.config);
    }

    /// Reset to a full bucket bound to `tag`, with `now` as the new epoch.
    pub(crate) fn rebind(&self, tag: &str, now: Instant) {
        let mut state = self.state();
        *state = BucketState::fresh(now, self.config.capacity());
        state.tag = Some(tag.to_owned());
    }

    pub(crate) fn unbind(&self) {
        self.state().tag = None;
    }

    /// True once the bucket has gone `idle_ticks` ticks untouched and is full again.
    pub(crate) fn reclaimable(&self, now: Instant, idle_ticks: u64) -> bool {
        let mut state = self.state();
        let tick = state.tick_at(now, self.config.fill_interval());
        if tick.saturating_sub(state.avail_tick) < idle_ticks {
            return false;
        }
        state.adjust(now, &self.config);
        // Full after catching up is the normal case; otherwise leave it for a later sweep.
        state.avail == self.config.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TrackingSleeper;

    const SECOND: Duration = Duration::from_secs(1);

    fn manual(capacity: u64) -> (Bucket, ManualClock) {
        let clock = ManualClock::new();
        let bucket = Bucket::new(SECOND, capacity).unwrap().with_clock(clock.clone());
        (bucket, clock)
    }

    #[test]
    fn rejects_invalid_shape() {
        assert!(matches!(
            Bucket::new(SECOND, 0),
            Err(ConfigError::InvalidCapacity { provided: 0 })
        ));
        assert!(matches!(Bucket::new(Duration::ZERO, 1), Err(ConfigError::InvalidFillInterval(_))));
        assert!(matches!(Bucket::with_rate(0.0, 1), Err(ConfigError::InvalidRate(_))));
    }

    #[test]
    fn starts_full_and_drains() {
        let (bucket, _clock) = manual(10);
        assert_eq!(bucket.available(), 10);
        assert_eq!(bucket.take_available(10).unwrap(), 10);
        assert_eq!(bucket.take_available(10).unwrap(), 0);
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn take_available_grants_at_most_what_is_there() {
        let (bucket, _clock) = manual(10);
        assert_eq!(bucket.take_available(7).unwrap(), 7);
        assert_eq!(bucket.take_available(5).unwrap(), 3);
        assert_eq!(bucket.take_available(1).unwrap(), 0);
    }

    #[test]
    fn refills_one_token_per_whole_tick() {
        let (bucket, clock) = manual(10);
        bucket.take_available(10).unwrap();

        clock.advance(Duration::from_millis(1500));
        assert_eq!(bucket.available(), 1);

        clock.advance(Duration::from_millis(500));
        assert_eq!(bucket.available(), 2);

        clock.advance(SECOND * 3);
        assert_eq!(bucket.take_available(10).unwrap(), 5);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (bucket, clock) = manual(3);
        bucket.take_available(1).unwrap();
        clock.advance(SECOND * 100);
        assert_eq!(bucket.available(), 3);
    }

    #[test]
    fn adjust_is_idempotent_for_same_instant() {
        let (bucket, clock) = manual(10);
        bucket.take_available(10).unwrap();
        clock.advance(SECOND * 4);
        let now = clock.now();

        bucket.adjust(now);
        let once = bucket.state().avail;
        bucket.adjust(now);
        assert_eq!(bucket.state().avail, once);
        assert_eq!(once, 4);
    }

    #[test]
    fn over_capacity_requests_fail_fast() {
        let (bucket, _clock) = manual(5);
        let err = bucket.take_available(6).unwrap_err();
        assert_eq!(err, ThrottleError::ExceedsCapacity { requested: 6, capacity: 5 });
        assert_eq!(bucket.available(), 5, "failed request must not consume");
    }

    #[tokio::test]
    async fn take_over_capacity_does_not_block() {
        let bucket = Bucket::new(SECOND, 2).unwrap();
        let err = bucket.take(3).await.unwrap_err();
        assert!(err.is_exceeds_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn take_is_immediate_when_tokens_are_there() {
        let sleeper = TrackingSleeper::new();
        let bucket = Bucket::new(SECOND, 10).unwrap().with_sleeper(sleeper.clone());
        assert_eq!(bucket.take(10).await.unwrap(), Duration::ZERO);
        assert!(sleeper.calls().is_empty());
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn take_waits_for_missing_ticks() {
        let sleeper = TrackingSleeper::new();
        let bucket =
            Bucket::new(Duration::from_millis(100), 10).unwrap().with_sleeper(sleeper.clone());
        bucket.take(10).await.unwrap();

        let waited = bucket.take(3).await.unwrap();
        assert_eq!(waited, Duration::from_millis(300));
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(300)]);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn take_waits_only_for_rest_of_current_tick() {
        let sleeper = TrackingSleeper::new();
        let bucket =
            Bucket::new(Duration::from_millis(100), 1).unwrap().with_sleeper(sleeper.clone());
        bucket.take(1).await.unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;

        bucket.take(1).await.unwrap();
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(60)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_take_consumes_nothing() {
        let bucket = Bucket::new(Duration::from_millis(10), 5).unwrap();
        bucket.take(5).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(25), bucket.take(5)).await;
        assert!(res.is_err(), "take should still be waiting");
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_takers_share_refills() {
        let bucket = Arc::new(Bucket::new(Duration::from_millis(10), 5).unwrap());
        bucket.take(5).await.unwrap();
        let start = Instant::now();

        let a = tokio::spawn({
            let bucket = bucket.clone();
            async move { bucket.take(5).await }
        });
        let b = tokio::spawn({
            let bucket = bucket.clone();
            async move { bucket.take(5).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn reclaimable_requires_idle_ticks_and_full_bucket() {
        let (bucket, clock) = manual(10);
        clock.advance(SECOND * 3);
        assert!(!bucket.reclaimable(clock.now(), 4), "only 3 idle ticks");

        clock.advance(SECOND);
        assert!(bucket.reclaimable(clock.now(), 4));

        bucket.take_available(10).unwrap();
        clock.advance(SECOND * 5);
        assert!(!bucket.reclaimable(clock.now(), 4), "idle but still refilling");

        clock.advance(SECOND * 5);
        assert!(bucket.reclaimable(clock.now(), 4));
    }

    #[test]
    fn polling_available_does_not_delay_reclaim() {
        let (bucket, clock) = manual(2);
        bucket.take_available(2).unwrap();
        for expected in [1, 2, 2] {
            clock.advance(SECOND);
            assert_eq!(bucket.available(), expected);
        }
        clock.advance(SECOND);
        assert!(bucket.reclaimable(clock.now(), 4), "reads must not reset the idle clock");
    }

    #[test]
    fn from_config_accepts_valid_shape() {
        let shape = BucketConfig::new(SECOND, 3).unwrap();
        assert_eq!(Bucket::from_config(shape).unwrap().available(), 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn from_config_rejects_deserialized_zero_shape() {
        let json = r#"{"fill_interval":{"secs":0,"nanos":0},"capacity":0}"#;
        let shape: BucketConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(
            Bucket::from_config(shape),
            Err(ConfigError::InvalidCapacity { provided: 0 })
        ));

        let json = r#"{"fill_interval":{"secs":0,"nanos":0},"capacity":5}"#;
        let shape: BucketConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(Bucket::from_config(shape), Err(ConfigError::InvalidFillInterval(_))));
    }

    #[test]
    fn rebind_resets_to_full_with_new_tag() {
        let (bucket, clock) = manual(4);
        bucket.take_available(4).unwrap();
        bucket.rebind("alice", clock.now());
        assert_eq!(bucket.tag().as_deref(), Some("alice"));
        assert_eq!(bucket.available(), 4);

        bucket.unbind();
        assert!(bucket.tag().is_none());
    }
}
