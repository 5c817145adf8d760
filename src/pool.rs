//! Bounded free-list of retired buckets.
//!
//! Recycling is best-effort: `retire` drops the bucket when the pool is full and `fetch` returns
//! `None` when it is empty. Neither waits. The pool never touches bucket state; the throttler
//! rebinds a fetched bucket before handing it out.

use crate::bucket::Bucket;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub(crate) struct BucketPool {
    capacity: usize,
    free: Mutex<Vec<Arc<Bucket>>>,
}

impl BucketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, free: Mutex::new(Vec::with_capacity(capacity)) }
    }

    /// Take any retired bucket, if one is queued.
    pub(crate) fn fetch(&self) -> Option<Arc<Bucket>> {
        self.free().pop()
    }

    /// Queue `bucket` for reuse. Returns false if the pool was full and the bucket was dropped.
    pub(crate) fn retire(&self, bucket: Arc<Bucket>) -> bool {
        let mut free = self.free();
        if free.len() >= self.capacity {
            return false;
        }
        free.push(bucket);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.free().len()
    }

    fn free(&self) -> MutexGuard<'_, Vec<Arc<Bucket>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
