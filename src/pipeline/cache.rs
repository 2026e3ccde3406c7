//! TTL cache for values that are expensive to fetch and slow to change
//!
//! Holds one `(value, expires_at)` pair. Time is passed in by the caller, the
//! same epoch-millisecond clock the rest of the pipeline uses, so expiry is
//! deterministic under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct TtlCache<T: Clone> {
    entry: Mutex<Option<(T, i64)>>,
    ttl_ms: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entry: Mutex::new(None),
            ttl_ms,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value if it has not expired at `now_ms`.
    pub fn get(&self, now_ms: i64) -> Option<T> {
        let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        match entry.as_ref() {
            Some((value, expires_at)) if now_ms < *expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, value: T, now_ms: i64) {
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        *entry = Some((value, now_ms.saturating_add(self.ttl_ms)));
    }

    pub fn invalidate(&self) {
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// `(hits, misses)`
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
