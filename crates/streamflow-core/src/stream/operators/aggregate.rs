//! `reduce`, `count` and `first`: collapse a flow into a `Single`.
//!
//! Each requests unbounded credit from its upstream on subscription and
//! surfaces only the final value, once the downstream has asked for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::stream::single::SingleDelivery;
use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) type ReduceFn<T> = dyn Fn(T, T) -> T + Send + Sync;

// ---------------------------------------------------------------------------
// reduce
// ---------------------------------------------------------------------------

pub(crate) struct ReducePublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
    f: Arc<ReduceFn<T>>,
}

impl<T> ReducePublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, f: Arc<ReduceFn<T>>) -> Self {
        Self { upstream, f }
    }
}

impl<T: Send + 'static> Publisher<T> for ReducePublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<T>>) {
        self.upstream.subscribe(Arc::new(ReduceSubscriber {
            delivery: SingleDelivery::new(downstream),
            acc: Mutex::new(None),
            f: Arc::clone(&self.f),
        }));
    }
}

struct ReduceSubscriber<T> {
    delivery: Arc<SingleDelivery<T>>,
    acc: Mutex<Option<T>>,
    f: Arc<ReduceFn<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ReduceSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.delivery.start_with_upstream(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        let mut acc = self
            .acc
            .lock()
            .map_err(|_| StreamError::Operator("reduce state poisoned".to_string()))?;
        let next = match acc.take() {
            Some(current) => (self.f)(current, value),
            None => value,
        };
        *acc = Some(next);
        Ok(())
    }

    fn complete(&self) {
        let acc = self.acc.lock().ok().and_then(|mut a| a.take());
        self.delivery.resolve(acc);
    }

    fn fail(&self, error: StreamError) {
        self.delivery.fail(error);
    }
}

// ---------------------------------------------------------------------------
// count
// ---------------------------------------------------------------------------

pub(crate) struct CountPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
}

impl<T> CountPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>) -> Self {
        Self { upstream }
    }
}

impl<T: 'static> Publisher<u64> for CountPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<u64>>) {
        self.upstream.subscribe(Arc::new(CountSubscriber {
            delivery: SingleDelivery::new(downstream),
            seen: AtomicU64::new(0),
        }));
    }
}

struct CountSubscriber {
    delivery: Arc<SingleDelivery<u64>>,
    seen: AtomicU64,
}

impl<T> Subscriber<T> for CountSubscriber {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.delivery.start_with_upstream(subscription);
    }

    fn consume(&self, _value: T) -> Result<(), StreamError> {
        self.seen.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn complete(&self) {
        self.delivery.resolve(Some(self.seen.load(Ordering::Acquire)));
    }

    fn fail(&self, error: StreamError) {
        self.delivery.fail(error);
    }
}

// ---------------------------------------------------------------------------
// first
// ---------------------------------------------------------------------------

pub(crate) struct FirstPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
}

impl<T> FirstPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>) -> Self {
        Self { upstream }
    }
}

impl<T: Send + 'static> Publisher<T> for FirstPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<T>>) {
        self.upstream.subscribe(Arc::new(FirstSubscriber {
            delivery: SingleDelivery::new(downstream),
        }));
    }
}

struct FirstSubscriber<T> {
    delivery: Arc<SingleDelivery<T>>,
}

impl<T: Send + 'static> Subscriber<T> for FirstSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.delivery.start_with_upstream(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        if !self.delivery.is_resolved() {
            self.delivery.upstream.cancel();
            self.delivery.resolve(Some(value));
        }
        Ok(())
    }

    fn complete(&self) {
        self.delivery.resolve(None);
    }

    fn fail(&self, error: StreamError) {
        if !self.delivery.is_resolved() {
            self.delivery.fail(error);
        }
    }
}
