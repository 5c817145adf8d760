//! Error types for buckets and the throttler registry
use crate::config::ConfigError;

/// Usage-contract violations reported by buckets and the throttler.
///
/// Nothing here is transient: every variant describes a call that will keep
/// failing if repeated unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ThrottleError {
    /// More tokens were requested than the bucket can ever hold.
    #[error("requested {requested} tokens from a bucket with capacity {capacity}")]
    ExceedsCapacity { requested: u64, capacity: u64 },
    /// Checkin of a tag that has no outstanding checkouts, or of a handle whose
    /// bucket is no longer the one registered for its tag.
    #[error("bucket for tag '{tag}' is not checked out")]
    NotCheckedOut { tag: String },
    /// `shutdown` was already called on this throttler.
    #[error("throttler already shut down")]
    AlreadyShutdown,
    /// The throttler was built outside a tokio runtime, so the sweep task cannot be spawned.
    #[error("no tokio runtime available to run the sweep task")]
    NoRuntime,
    /// Invalid bucket or throttler configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ThrottleError {
    /// Check if this error is an over-capacity request
    pub fn is_exceeds_capacity(&self) -> bool {
        matches!(self, Self::ExceedsCapacity { .. })
    }

    /// Check if this error is a bad checkin
    pub fn is_not_checked_out(&self) -> bool {
        matches!(self, Self::NotCheckedOut { .. })
    }

    /// Check if this error is a repeated shutdown
    pub fn is_already_shutdown(&self) -> bool {
        matches!(self, Self::AlreadyShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::time::Duration;

    #[test]
    fn exceeds_capacity_display() {
        let err = ThrottleError::ExceedsCapacity { requested: 11, capacity: 10 };
        let msg = err.to_string();
        assert!(msg.contains("11"));
        assert!(msg.contains("capacity 10"));
        assert!(err.is_exceeds_capacity());
        assert!(!err.is_not_checked_out());
    }

    #[test]
    fn not_checked_out_names_tag() {
        let err = ThrottleError::NotCheckedOut { tag: "u1".into() };
        assert!(err.to_string().contains("'u1'"));
        assert!(err.is_not_checked_out());
    }

    #[test]
    fn config_error_is_transparent() {
        let inner = ConfigError::InvalidFillInterval(Duration::ZERO);
        let err: ThrottleError = inner.clone().into();
        assert_eq!(err.to_string(), inner.to_string());
        assert!(err.source().is_none());
    }

    #[test]
    fn predicates_cover_shutdown() {
        assert!(ThrottleError::AlreadyShutdown.is_already_shutdown());
        assert!(!ThrottleError::NoRuntime.is_already_shutdown());
    }
}
