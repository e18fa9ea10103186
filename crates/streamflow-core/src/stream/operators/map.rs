//! `map` and `try_map`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::Upstream;
use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) type MapFn<T, U> = dyn Fn(T) -> U + Send + Sync;
pub(crate) type TryMapFn<T, U> = dyn Fn(T) -> Result<U, StreamError> + Send + Sync;

// ---------------------------------------------------------------------------
// map
// ---------------------------------------------------------------------------

pub(crate) struct MapPublisher<T, U> {
    upstream: Arc<dyn Publisher<T>>,
    f: Arc<MapFn<T, U>>,
}

impl<T, U> MapPublisher<T, U> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, f: Arc<MapFn<T, U>>) -> Self {
        Self { upstream, f }
    }
}

impl<T: 'static, U: 'static> Publisher<U> for MapPublisher<T, U> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<U>>) {
        self.upstream.subscribe(Arc::new(MapSubscriber {
            downstream,
            f: Arc::clone(&self.f),
        }));
    }
}

struct MapSubscriber<T, U> {
    downstream: Arc<dyn Subscriber<U>>,
    f: Arc<MapFn<T, U>>,
}

impl<T, U> Subscriber<T> for MapSubscriber<T, U> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribed(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        self.downstream.consume((self.f)(value))
    }

    fn complete(&self) {
        self.downstream.complete();
    }

    fn fail(&self, error: StreamError) {
        self.downstream.fail(error);
    }
}

// ---------------------------------------------------------------------------
// try_map
// ---------------------------------------------------------------------------

pub(crate) struct TryMapPublisher<T, U> {
    upstream: Arc<dyn Publisher<T>>,
    f: Arc<TryMapFn<T, U>>,
}

impl<T, U> TryMapPublisher<T, U> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, f: Arc<TryMapFn<T, U>>) -> Self {
        Self { upstream, f }
    }
}

impl<T: 'static, U: 'static> Publisher<U> for TryMapPublisher<T, U> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<U>>) {
        self.upstream.subscribe(Arc::new(TryMapSubscriber {
            downstream,
            f: Arc::clone(&self.f),
            upstream: Upstream::new(),
            done: AtomicBool::new(false),
        }));
    }
}

struct TryMapSubscriber<T, U> {
    downstream: Arc<dyn Subscriber<U>>,
    f: Arc<TryMapFn<T, U>>,
    upstream: Upstream,
    done: AtomicBool,
}

impl<T, U> Subscriber<T> for TryMapSubscriber<T, U> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(Arc::clone(&subscription));
        self.downstream.on_subscribed(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        match (self.f)(value) {
            Ok(mapped) => self.downstream.consume(mapped),
            Err(error) => {
                // The upstream is not cancelled for us; stop it before failing.
                self.upstream.cancel();
                if !self.done.swap(true, Ordering::AcqRel) {
                    self.downstream.fail(error);
                }
                Ok(())
            }
        }
    }

    fn complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.complete();
        }
    }

    fn fail(&self, error: StreamError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.fail(error);
        }
    }
}
