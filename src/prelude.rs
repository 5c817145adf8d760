//! Convenient re-exports for common throttler types.
pub use crate::{
    bucket::Bucket,
    config::{BucketConfig, ConfigError, ThrottlerConfig},
    middleware::{OnEmpty, ThrottleLayer, ThrottleServiceError},
    throttler::{BucketHandle, Throttler, ThrottlerStats},
    ThrottleError,
};
