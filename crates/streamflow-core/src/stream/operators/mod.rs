//! Operator publishers.
//!
//! Every operator is a `Publisher` decorator: subscribing to it subscribes an
//! operator-specific subscriber to the upstream, which wraps the downstream
//! subscriber. Operators that suppress values (`filter`, `skip`, `distinct`)
//! replace each suppressed value with `request(1)` upstream so the downstream
//! credit accounting stays exact.

use std::sync::{Arc, Mutex};

use super::Subscription;

pub mod aggregate;
pub mod buffer;
pub mod distinct;
pub mod filter;
pub mod flat_map;
pub mod map;
pub mod skip;

/// The upstream subscription an operator subscriber received.
pub(crate) struct Upstream {
    slot: Mutex<Option<Arc<dyn Subscription>>>,
}

impl Upstream {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, subscription: Arc<dyn Subscription>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(subscription);
        }
    }

    fn get(&self) -> Option<Arc<dyn Subscription>> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    pub(crate) fn request(&self, n: u64) {
        if let Some(subscription) = self.get() {
            subscription.request(n);
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(subscription) = self.get() {
            subscription.cancel();
        }
    }
}
