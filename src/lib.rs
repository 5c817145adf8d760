#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Throttler
//!
//! Tag-keyed token-bucket rate limiting for async Rust.
//!
//! Callers name a subject (a user id, an API key, an IP) by a string tag and get back a token
//! bucket dedicated to that tag. Every concurrent caller using the same tag shares the same
//! bucket; buckets that go idle are swept into a bounded pool and reused for new tags, so memory
//! does not grow with the number of distinct tags ever seen.
//!
//! ## Features
//!
//! - **Token buckets** with lazy, tick-quantized refill and both waiting and non-waiting takes
//! - **Reference-counted checkout/checkin** so a bucket is never reclaimed while held
//! - **Background sweep** returning idle, fully refilled buckets to a bounded pool
//! - **Tower middleware** for per-tag throttling of services
//!
//! ## Quick Start
//!
//! ```rust
//! use throttler::Throttler;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // One token per second, up to 10 per tag.
//!     let throttler = Throttler::with_interval(Duration::from_secs(1), 10).unwrap();
//!
//!     let bucket = throttler.checkout("user-42");
//!     bucket.take(10).await.unwrap();
//!     assert_eq!(bucket.take_available(1).unwrap(), 0);
//!     throttler.checkin(bucket).unwrap();
//!
//!     throttler.shutdown().unwrap();
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
mod pool;
pub mod prelude;
pub mod sleeper;
pub mod throttler;

// Re-exports
pub use bucket::Bucket;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{BucketConfig, ConfigError, ThrottlerConfig};
pub use error::ThrottleError;
pub use middleware::{OnEmpty, ThrottleLayer, ThrottleService, ThrottleServiceError};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use throttler::{BucketHandle, Throttler, ThrottlerBuilder, ThrottlerStats};
