//! Per-(context, node) mutual exclusion.
//!
//! A `LockRegistry` hands out blocking, thread-reentrant locks keyed by a
//! context id and a node id. Two delivery paths for the same pair serialize;
//! the same thread may take a pair again while it already holds it, which a
//! graph looping back to a node it is still forwarding from needs.
//!
//! Task handling needs exclusivity across await points, which a
//! thread-owned lock cannot give. For that the registry also hands out
//! async holds (`hold_all`) on the same keys. Holds and stage locks are
//! independent: stages never take a hold, so a hold owner may forward
//! through the pipeline while holding.
//!
//! Slots are created on demand and dropped when the last guard is released
//! and nobody waits, so the registry only holds pairs currently in use.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

type LockKey = (Uuid, String);

#[derive(Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

#[derive(Default)]
struct LockSlot {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl LockSlot {
    fn owner(&self) -> MutexGuard<'_, Owner> {
        self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of per-(context, node) locks.
#[derive(Default)]
pub struct LockRegistry {
    slots: DashMap<LockKey, Arc<LockSlot>>,
    holds: DashMap<LockKey, Arc<tokio::sync::Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the pair is free (or already held by this thread), then
    /// hold it until the guard is dropped.
    pub fn acquire(self: &Arc<Self>, context_id: Uuid, node_id: &str) -> LockGuard {
        let key = (context_id, node_id.to_string());
        let slot = Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(LockSlot::default()))
                .value(),
        );

        let me = thread::current().id();
        let mut owner = slot.owner();
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    break;
                }
                Some(holder) if holder == me => {
                    owner.depth += 1;
                    break;
                }
                Some(_) => {
                    tracing::trace!(context_id = %context_id, node_id, "waiting for context lock");
                    owner = slot
                        .released
                        .wait(owner)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
        drop(owner);

        LockGuard {
            registry: Arc::clone(self),
            key,
            slot,
        }
    }

    /// Acquire every pair for `node_id` in a stable order, so two batches
    /// sharing contexts cannot deadlock on each other.
    pub fn acquire_all(self: &Arc<Self>, context_ids: &[Uuid], node_id: &str) -> Vec<LockGuard> {
        let mut ids = context_ids.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|id| self.acquire(id, node_id))
            .collect()
    }

    /// Wait until every pair for `node_id` is free of other holds, then keep
    /// them until the returned guard is dropped. Pairs are taken in a stable
    /// order. The guard may live across await points.
    pub async fn hold_all(self: &Arc<Self>, context_ids: &[Uuid], node_id: &str) -> HoldGuard {
        let mut ids = context_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut hold = HoldGuard {
            registry: Arc::clone(self),
            held: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            let key = (id, node_id.to_string());
            let mutex = Arc::clone(
                self.holds
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .value(),
            );
            let guard = mutex.lock_owned().await;
            hold.held.push((key, guard));
        }
        hold
    }

    pub fn is_held(&self, context_id: Uuid, node_id: &str) -> bool {
        self.holds
            .get(&(context_id, node_id.to_string()))
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    pub fn is_locked(&self, context_id: Uuid, node_id: &str) -> bool {
        self.slots
            .get(&(context_id, node_id.to_string()))
            .is_some_and(|slot| slot.owner().thread.is_some())
    }

    /// Pairs with a live lock slot or hold.
    pub fn len(&self) -> usize {
        self.slots.len() + self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.holds.is_empty()
    }
}

/// Held lock on one (context, node) pair. Released on drop.
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    key: LockKey,
    slot: Arc<LockSlot>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let free = {
            let mut owner = self.slot.owner();
            owner.depth = owner.depth.saturating_sub(1);
            if owner.depth == 0 {
                owner.thread = None;
                true
            } else {
                false
            }
        };
        if free {
            self.slot.released.notify_one();
            // Two references: the map and this guard. More means a waiter.
            self.registry.slots.remove_if(&self.key, |_, slot| {
                Arc::strong_count(slot) <= 2 && slot.owner().thread.is_none()
            });
        }
    }
}

/// Async hold on a set of (context, node) pairs. Released on drop.
pub struct HoldGuard {
    registry: Arc<LockRegistry>,
    held: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl HoldGuard {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            // Only the map's reference left means nobody waits.
            self.registry
                .holds
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
