// ── TTL-bounded snapshots ──
//
// Routing tables, ARP caches and similar artifacts are expensive to
// fetch and go stale slowly. A `CacheSlot` holds the latest snapshot;
// readers get an immutable `Arc`, writers swap in a whole new value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, TimeDelta, Utc};

/// A value plus the moment it stops being fresh.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn new(value: T, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        Self {
            value: Arc::new(value),
            fetched_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct CacheSlot<T> {
    slot: ArcSwapOption<Cached<T>>,
    ttl: Duration,
}

impl<T> std::fmt::Debug for CacheSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("ttl", &self.ttl)
            .field("filled", &self.slot.load().is_some())
            .finish()
    }
}

impl<T> CacheSlot<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            ttl,
        }
    }

    /// Fresh value, if any.
    pub fn get(&self, now: DateTime<Utc>) -> Option<Arc<T>> {
        self.slot
            .load()
            .as_ref()
            .filter(|c| c.is_fresh(now))
            .map(|c| Arc::clone(&c.value))
    }

    /// Last stored value regardless of age.
    pub fn last(&self) -> Option<Arc<T>> {
        self.slot.load().as_ref().map(|c| Arc::clone(&c.value))
    }

    pub fn store(&self, value: T, now: DateTime<Utc>) -> Arc<T> {
        let cached = Arc::new(Cached::new(value, now, self.ttl));
        let value = Arc::clone(&cached.value);
        self.slot.store(Some(cached));
        value
    }

    pub fn invalidate(&self) {
        self.slot.store(None);
    }

    /// Return the fresh value or run `fetch` and keep its result.
    ///
    /// A failed fetch leaves the previous value in place.
    pub async fn get_or_refresh<E, F>(&self, now: DateTime<Utc>, fetch: F) -> Result<Arc<T>, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(now) {
            return Ok(value);
        }
        let value = fetch.await?;
        Ok(self.store(value, now))
    }
}
