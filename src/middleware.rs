//! Tower middleware that throttles requests per tag.
//!
//! Each request is mapped to a tag by a key function; one token is taken from that tag's bucket
//! before the inner service runs. The bucket is checked back in as soon as the token decision is
//! made, including when the response future is dropped mid-wait.

use crate::throttler::{BucketHandle, Throttler};
use crate::ThrottleError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// What to do when a tag's bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnEmpty {
    /// Fail fast with [`ThrottleServiceError::Throttled`].
    #[default]
    Reject,
    /// Wait for the next token.
    Wait,
}

/// Errors returned by [`ThrottleService`].
#[derive(thiserror::Error, Debug)]
pub enum ThrottleServiceError<E> {
    /// The tag's bucket had no token and the layer is in reject mode.
    #[error("tag '{tag}' is throttled")]
    Throttled { tag: String },
    /// The throttler refused the request.
    #[error(transparent)]
    Limiter(ThrottleError),
    /// The inner service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> ThrottleServiceError<E> {
    /// Check if the request was rejected for lack of tokens
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that throttles requests through a shared [`Throttler`].
pub struct ThrottleLayer<F> {
    throttler: Arc<Throttler>,
    key: Arc<F>,
    on_empty: OnEmpty,
}

impl<F> ThrottleLayer<F> {
    /// Reject requests whose tag, as computed by `key`, has no token left.
    pub fn new(throttler: Arc<Throttler>, key: F) -> Self {
        Self { throttler, key: Arc::new(key), on_empty: OnEmpty::Reject }
    }

    /// Switch between rejecting and waiting when a bucket is empty.
    pub fn on_empty(mut self, on_empty: OnEmpty) -> Self {
        self.on_empty = on_empty;
        self
    }
}

impl<F> Clone for ThrottleLayer<F> {
    fn clone(&self) -> Self {
        Self { throttler: self.throttler.clone(), key: self.key.clone(), on_empty: self.on_empty }
    }
}

impl<F> std::fmt::Debug for ThrottleLayer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleLayer")
            .field("throttler", &self.throttler)
            .field("key", &"<key fn>")
            .field("on_empty", &self.on_empty)
            .finish()
    }
}

impl<S, F> Layer<S> for ThrottleLayer<F> {
    type Service = ThrottleService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService {
            inner: service,
            throttler: self.throttler.clone(),
            key: self.key.clone(),
            on_empty: self.on_empty,
        }
    }
}

/// Middleware service produced by [`ThrottleLayer`].
pub struct ThrottleService<S, F> {
    inner: S,
    throttler: Arc<Throttler>,
    key: Arc<F>,
    on_empty: OnEmpty,
}

impl<S: Clone, F> Clone for ThrottleService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            throttler: self.throttler.clone(),
            key: self.key.clone(),
            on_empty: self.on_empty,
        }
    }
}

impl<S: std::fmt::Debug, F> std::fmt::Debug for ThrottleService<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleService")
            .field("inner", &self.inner)
            .field("on_empty", &self.on_empty)
            .finish()
    }
}

/// Checks its handle back in when dropped, so a cancelled wait does not pin the tag.
struct Held {
    throttler: Arc<Throttler>,
    handle: BucketHandle,
}

impl Drop for Held {
    fn drop(&mut self) {
        let _ = self.throttler.release(&mut self.handle);
    }
}

async fn admit(
    throttler: Arc<Throttler>,
    tag: &str,
    on_empty: OnEmpty,
) -> Result<bool, ThrottleError> {
    let held = Held { handle: throttler.checkout(tag), throttler };
    match on_empty {
        OnEmpty::Reject => Ok(held.handle.take_available(1)? == 1),
        OnEmpty::Wait => held.handle.take(1).await.map(|_| true),
    }
}

impl<S, F, Req> Service<Req> for ThrottleService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleServiceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleServiceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let tag = (self.key)(&req);
        let throttler = self.throttler.clone();
        let on_empty = self.on_empty;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match admit(throttler, &tag, on_empty).await {
                Ok(true) => inner.call(req).await.map_err(ThrottleServiceError::Inner),
                Ok(false) => {
                    tracing::debug!(target: "throttler::middleware", tag = %tag, "request throttled");
                    Err(ThrottleServiceError::Throttled { tag })
                }
                Err(e) => Err(ThrottleServiceError::Limiter(e)),
            }
        })
    }
}
