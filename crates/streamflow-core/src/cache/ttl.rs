//! Bounded, idle-expiring map with single-flight construction.
//!
//! Each key owns a slot holding a `tokio::sync::OnceCell` of the build
//! result. Concurrent misses on the same key find the same slot and wait on
//! the same initialisation, so the build runs once and every waiter gets its
//! outcome, error included. A failed slot is unlinked from the map once its
//! result is out; the next miss builds again.

use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::Instant;

struct Slot<V, E> {
    outcome: OnceCell<Result<V, E>>,
    touched: Mutex<Instant>,
}

impl<V, E> Slot<V, E> {
    fn new(now: Instant) -> Self {
        Self {
            outcome: OnceCell::new(),
            touched: Mutex::new(now),
        }
    }

    fn value(&self) -> Option<&V> {
        self.outcome.get()?.as_ref().ok()
    }

    fn is_built(&self) -> bool {
        self.value().is_some()
    }

    fn touched(&self) -> Instant {
        *self
            .touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self, now: Instant) {
        if let Ok(mut touched) = self.touched.lock() {
            *touched = now;
        }
    }

    /// Built and idle for at least `ttl`. Slots still building never expire.
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.is_built() && now.saturating_duration_since(self.touched()) >= ttl
    }
}

/// Cache with a size bound (least recently used built entry goes first) and
/// an idle TTL. `E` is the build error, shared with every waiter of a failed
/// build.
pub struct BoundedTtlCache<K, V, E> {
    slots: DashMap<K, Arc<Slot<V, E>>>,
    max_entries: usize,
    idle_ttl: Duration,
}

impl<K, V, E> BoundedTtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new(max_entries: usize, idle_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            max_entries: max_entries.max(1),
            idle_ttl,
        }
    }

    /// Return the cached value for `key`, building it with `build` on a miss.
    ///
    /// Concurrent callers for the same missing key share one build and all
    /// receive its result. A failed build is not stored.
    pub async fn get_or_try_build<F, Fut>(&self, key: K, build: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let now = Instant::now();
        self.slots
            .remove_if(&key, |_, slot| slot.is_expired(now, self.idle_ttl));
        let slot = Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new(now)))
                .value(),
        );

        let hit = slot.outcome.initialized();
        match slot.outcome.get_or_init(build).await {
            Ok(value) => {
                let value = value.clone();
                slot.touch(Instant::now());
                if !hit {
                    self.evict_overflow(&key);
                }
                Ok(value)
            }
            Err(error) => {
                let error = error.clone();
                self.slots
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                Err(error)
            }
        }
    }

    /// The cached value, if present and not expired. Refreshes its idle timer.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.slots
            .remove_if(key, |_, slot| slot.is_expired(now, self.idle_ttl));
        let slot = self.slots.get(key)?;
        let value = slot.value().value()?.clone();
        slot.touch(now);
        Some(value)
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Remove every built entry matching `predicate`. Returns how many went.
    pub fn invalidate_if(&self, predicate: impl Fn(&K, &V) -> bool) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, slot| match slot.value() {
            Some(value) => !predicate(key, value),
            None => true,
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Drop every entry idle for longer than the TTL. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.is_expired(now, self.idle_ttl));
        before.saturating_sub(self.slots.len())
    }

    /// Built values currently held. Does not refresh idle timers.
    pub fn values(&self) -> Vec<V> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().value().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn evict_overflow(&self, keep: &K) {
        while self.slots.len() > self.max_entries {
            let oldest = self
                .slots
                .iter()
                .filter(|entry| entry.key() != keep && entry.value().is_built())
                .min_by_key(|entry| entry.value().touched())
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.slots.remove(&oldest);
            tracing::debug!(max_entries = self.max_entries, "cache entry evicted");
        }
    }
}
