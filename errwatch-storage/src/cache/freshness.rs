//! Staleness metadata for cache reads.
//!
//! A read never blocks on a refresh, so callers receive whatever value was
//! last fetched successfully together with when that happened. Comparing
//! that age against the entry's TTL is how a dashboard decides to show a
//! "stale" marker.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug)]
pub struct CacheRead<T> {
    value: Arc<T>,
    fetched_at: DateTime<Utc>,
    ttl: Duration,
}

impl<T> Clone for CacheRead<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            ttl: self.ttl,
        }
    }
}

impl<T> CacheRead<T> {
    pub(crate) fn new(value: Arc<T>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at,
            ttl,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Shared handle to the value; cheap to clone.
    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.value)
    }

    /// When the value was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Check if the data is fresh as of the given timestamp.
    pub fn is_fresh_as_of(&self, timestamp: DateTime<Utc>) -> bool {
        self.fetched_at >= timestamp
    }

    /// Time since the value was fetched.
    pub fn staleness(&self) -> Duration {
        let now = Utc::now();
        if now > self.fetched_at {
            (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }

    /// True once the value is older than the entry's TTL.
    pub fn is_stale(&self) -> bool {
        self.staleness() > self.ttl
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
