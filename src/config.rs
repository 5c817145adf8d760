//! Bucket shape and throttler configuration.
//!
//! A [`ThrottlerConfig`] is fixed for the lifetime of a [`Throttler`](crate::Throttler):
//! every tag it serves gets a bucket of the same [`BucketConfig`] shape.

use std::time::Duration;

/// Default bound on the number of retired buckets kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 50;
/// Default number of idle fill intervals before a bucket may be swept.
pub const DEFAULT_IDLE_TICKS: u64 = 4;
/// Default sweep period, as a multiple of the fill interval.
pub const DEFAULT_SWEEP_FACTOR: u32 = 5;

/// Errors produced when validating bucket or throttler configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Capacity must be >= 1.
    InvalidCapacity {
        /// Value provided by caller.
        provided: u64,
    },
    /// Fill interval must be > 0.
    InvalidFillInterval(Duration),
    /// Rate must be finite, > 0, and yield a non-zero fill interval.
    InvalidRate(f64),
    /// Idle tick threshold must be >= 1.
    InvalidIdleTicks {
        /// Value provided by caller.
        provided: u64,
    },
    /// Sweep interval must be > 0.
    InvalidSweepInterval(Duration),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidCapacity { provided } => {
                write!(f, "capacity must be >= 1 (got {})", provided)
            }
            ConfigError::InvalidFillInterval(interval) => {
                write!(f, "fill_interval must be > 0 (got {:?})", interval)
            }
            ConfigError::InvalidRate(rate) => {
                write!(f, "rate must be finite and > 0 tokens/sec (got {})", rate)
            }
            ConfigError::InvalidIdleTicks { provided } => {
                write!(f, "idle_ticks must be >= 1 (got {})", provided)
            }
            ConfigError::InvalidSweepInterval(interval) => {
                write!(f, "sweep_interval must be > 0 (got {:?})", interval)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validated shape of a single token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketConfig {
    fill_interval: Duration,
    capacity: u64,
}

impl BucketConfig {
    /// One token is added every `fill_interval`, up to `capacity` tokens.
    ///
    /// # Examples
    /// ```
    /// use throttler::BucketConfig;
    /// use std::time::Duration;
    /// let shape = BucketConfig::new(Duration::from_millis(100), 10).unwrap();
    /// assert_eq!(shape.capacity(), 10);
    /// ```
    pub fn new(fill_interval: Duration, capacity: u64) -> Result<Self, ConfigError> {
        let cfg = Self { fill_interval, capacity };
        cfg.validate()?;
        Ok(cfg)
    }

    /// `rate` tokens per second, up to `capacity` tokens.
    pub fn with_rate(rate: f64, capacity: u64) -> Result<Self, ConfigError> {
        Self::new(fill_interval_for_rate(rate)?, capacity)
    }

    /// Interval between single-token refills.
    pub fn fill_interval(&self) -> Duration {
        self.fill_interval
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Re-check invariants, e.g. after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity { provided: 0 });
        }
        if self.fill_interval.is_zero() {
            return Err(ConfigError::InvalidFillInterval(self.fill_interval));
        }
        Ok(())
    }
}

fn fill_interval_for_rate(rate: f64) -> Result<Duration, ConfigError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::InvalidRate(rate));
    }
    match Duration::try_from_secs_f64(1.0 / rate) {
        Ok(interval) if !interval.is_zero() => Ok(interval),
        _ => Err(ConfigError::InvalidRate(rate)),
    }
}

/// Configuration for a [`Throttler`](crate::Throttler).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottlerConfig {
    bucket: BucketConfig,
    #[cfg_attr(feature = "serde", serde(default = "default_pool_capacity"))]
    pool_capacity: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_idle_ticks"))]
    idle_ticks: u64,
    // None means DEFAULT_SWEEP_FACTOR fill intervals.
    #[cfg_attr(feature = "serde", serde(default))]
    sweep_interval: Option<Duration>,
}

#[cfg(feature = "serde")]
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

#[cfg(feature = "serde")]
fn default_idle_ticks() -> u64 {
    DEFAULT_IDLE_TICKS
}

impl ThrottlerConfig {
    /// Buckets refill one token per `fill_interval`, up to `capacity`.
    pub fn new(fill_interval: Duration, capacity: u64) -> Result<Self, ConfigError> {
        Ok(Self::from_bucket(BucketConfig::new(fill_interval, capacity)?))
    }

    /// Buckets refill at `rate` tokens per second, up to `capacity`.
    pub fn with_rate(rate: f64, capacity: u64) -> Result<Self, ConfigError> {
        Ok(Self::from_bucket(BucketConfig::with_rate(rate, capacity)?))
    }

    /// Use an already validated bucket shape with default pool and sweep settings.
    pub fn from_bucket(bucket: BucketConfig) -> Self {
        Self {
            bucket,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            idle_ticks: DEFAULT_IDLE_TICKS,
            sweep_interval: None,
        }
    }

    /// Override how many retired buckets are kept for reuse. Zero disables recycling.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Override how many idle fill intervals must pass before a bucket is swept; must be >= 1.
    pub fn with_idle_ticks(mut self, ticks: u64) -> Result<Self, ConfigError> {
        if ticks == 0 {
            return Err(ConfigError::InvalidIdleTicks { provided: ticks });
        }
        self.idle_ticks = ticks;
        Ok(self)
    }

    /// Override the sweep period; must be > 0.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidSweepInterval(interval));
        }
        self.sweep_interval = Some(interval);
        Ok(self)
    }

    /// Shape shared by every bucket.
    pub fn bucket(&self) -> BucketConfig {
        self.bucket
    }

    /// Bound on retired buckets kept for reuse.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Idle fill intervals required before eviction.
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks
    }

    /// Period of the background sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or_else(|| self.bucket.fill_interval.saturating_mul(DEFAULT_SWEEP_FACTOR))
    }

    /// Re-check every invariant, e.g. after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bucket.validate()?;
        if self.idle_ticks == 0 {
            return Err(ConfigError::InvalidIdleTicks { provided: 0 });
        }
        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidSweepInterval(interval));
            }
        }
        Ok(())
    }
}
