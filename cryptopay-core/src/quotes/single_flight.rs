//! TTL cache with one in-flight fetch per key.
//!
//! Each key owns an async mutex around its slot. A caller that finds the
//! slot stale fetches while holding the lock, so concurrent callers for the
//! same key queue behind it and then read the fresh value instead of
//! fetching again. Different keys never block each other.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use cryptopay_sdk::objects::Freshness;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;

use crate::utils::Clock;

/// A value served from the cache, annotated with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub freshness: Freshness,
    /// When the value was fetched from upstream.
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    fetched_at: OffsetDateTime,
}

type Slot<V> = Arc<AsyncMutex<Option<Entry<V>>>>;

pub struct SingleFlightCache<K, V> {
    ttl: time::Duration,
    clock: Arc<dyn Clock>,
    slots: std::sync::Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> time::Duration {
        self.ttl
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(key.clone()).or_default().clone()
    }

    /// Return the cached value for `key`, calling `fetch` when it is missing
    /// or older than the TTL.
    ///
    /// When `fetch` fails and a previous value exists, that value is served
    /// as [`Freshness::Stale`]; otherwise the fetch error is returned.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, fetch: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if self.clock.now() - entry.fetched_at < self.ttl {
                return Ok(Cached {
                    value: entry.value.clone(),
                    freshness: Freshness::Hit,
                    fetched_at: entry.fetched_at,
                });
            }
        }

        match fetch().await {
            Ok(value) => {
                let fetched_at = self.clock.now();
                *guard = Some(Entry {
                    value: value.clone(),
                    fetched_at,
                });
                Ok(Cached {
                    value,
                    freshness: Freshness::Miss,
                    fetched_at,
                })
            }
            Err(e) => match guard.as_ref() {
                Some(entry) => Ok(Cached {
                    value: entry.value.clone(),
                    freshness: Freshness::Stale,
                    fetched_at: entry.fetched_at,
                }),
                None => Err(e),
            },
        }
    }

    /// The last stored value for `key`, regardless of age.
    pub async fn peek(&self, key: &K) -> Option<V> {
        let slot = self.slot(key);
        let guard = slot.lock().await;
        guard.as_ref().map(|e| e.value.clone())
    }
}
