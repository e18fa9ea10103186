//! `Single<T>`: a stream of at most one value.
//!
//! Same protocol as `Flow`; a `Single` delivers either one value followed by
//! `complete`, `complete` alone, or `fail`. Any positive `request` is enough
//! to receive the value.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::operators::Upstream;
use super::operators::map::MapPublisher;
use super::source::TerminalPublisher;
use super::{Flow, Publisher, StreamError, Subscriber, Subscription, UNBOUNDED};

pub struct Single<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Single<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<T: Send + 'static> Single<T> {
    pub fn new(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { publisher }
    }

    pub fn empty() -> Self {
        Self::new(Arc::new(TerminalPublisher::completed()))
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher.subscribe(subscriber);
    }

    pub fn map<U: Send + 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Single<U> {
        Single::new(Arc::new(MapPublisher::new(
            Arc::clone(&self.publisher),
            Arc::new(f),
        )))
    }

    pub fn into_flow(self) -> Flow<T> {
        Flow::new(self.publisher)
    }

    /// Subscribe and run `f` once with the outcome: `Ok(Some(v))`, `Ok(None)`
    /// for an empty completion, or the failure.
    pub fn subscribe_fn(&self, f: impl FnOnce(Result<Option<T>, StreamError>) + Send + 'static) {
        self.subscribe(Arc::new(CallbackSubscriber {
            value: Mutex::new(None),
            callback: Mutex::new(Some(Box::new(f))),
        }));
    }

    /// Resolve the outcome as a future.
    pub fn to_future(&self) -> impl Future<Output = Result<Option<T>, StreamError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.subscribe_fn(move |outcome| {
            let _ = tx.send(outcome);
        });
        async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(StreamError::source("single dropped without a terminal signal")),
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Single<T> {
    pub fn just(value: T) -> Self {
        Self::new(Arc::new(JustPublisher { value }))
    }
}

impl<T: Send + 'static> Publisher<T> for Single<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher.subscribe(subscriber);
    }
}

struct JustPublisher<T> {
    value: T,
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for JustPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let delivery = SingleDelivery::new(subscriber);
        delivery.start();
        delivery.resolve(Some(self.value.clone()));
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Holds a single result until the downstream has asked for it.
///
/// Shared by every operator that collapses a stream into a `Single`: the
/// operator resolves it on upstream completion, the downstream uses it as its
/// `Subscription`.
pub(crate) struct SingleDelivery<T> {
    downstream: Arc<dyn Subscriber<T>>,
    value: Mutex<Option<T>>,
    requested: AtomicBool,
    resolved: AtomicBool,
    done: AtomicBool,
    pub(crate) upstream: Upstream,
}

impl<T: Send + 'static> SingleDelivery<T> {
    pub(crate) fn new(downstream: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            value: Mutex::new(None),
            requested: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
            done: AtomicBool::new(false),
            upstream: Upstream::new(),
        })
    }

    /// Hand this delivery to the downstream as its subscription.
    pub(crate) fn start(self: &Arc<Self>) {
        self.downstream
            .on_subscribed(Arc::clone(self) as Arc<dyn Subscription>);
    }

    /// Attach to an upstream: record it, subscribe the downstream, then ask
    /// the upstream for everything.
    pub(crate) fn start_with_upstream(self: &Arc<Self>, upstream: Arc<dyn Subscription>) {
        self.upstream.set(Arc::clone(&upstream));
        self.start();
        if !self.done.load(Ordering::Acquire) {
            upstream.request(UNBOUNDED);
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Set the result. Later calls are ignored.
    pub(crate) fn resolve(&self, value: Option<T>) {
        {
            let Ok(mut slot) = self.value.lock() else {
                return;
            };
            if self.resolved.load(Ordering::Acquire) {
                return;
            }
            *slot = value;
            self.resolved.store(true, Ordering::Release);
        }
        self.try_deliver();
    }

    pub(crate) fn fail(&self, error: StreamError) {
        self.resolved.store(true, Ordering::Release);
        if !self.done.swap(true, Ordering::AcqRel) {
            self.downstream.fail(error);
        }
    }

    fn try_deliver(&self) {
        // Both flags are checked under the value lock so a concurrent
        // `resolve` and `request` cannot both back off.
        let value = {
            let Ok(mut slot) = self.value.lock() else {
                return;
            };
            if !self.resolved.load(Ordering::Acquire) {
                return;
            }
            if slot.is_some() && !self.requested.load(Ordering::Acquire) {
                return;
            }
            if self.done.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };
        if let Some(value) = value {
            if let Err(error) = self.downstream.consume(value) {
                self.downstream.fail(error);
                return;
            }
        }
        self.downstream.complete();
    }
}

impl<T: Send + 'static> Subscription for SingleDelivery<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.upstream.cancel();
            self.fail(StreamError::InvalidDemand(n));
            return;
        }
        self.requested.store(true, Ordering::Release);
        self.try_deliver();
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
    }
}

// ---------------------------------------------------------------------------
// Callback subscriber
// ---------------------------------------------------------------------------

type OutcomeFn<T> = Box<dyn FnOnce(Result<Option<T>, StreamError>) + Send>;

struct CallbackSubscriber<T> {
    value: Mutex<Option<T>>,
    callback: Mutex<Option<OutcomeFn<T>>>,
}

impl<T: Send> CallbackSubscriber<T> {
    fn finish(&self, outcome: Result<Option<T>, StreamError>) {
        let callback = self.callback.lock().ok().and_then(|mut c| c.take());
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

impl<T: Send> Subscriber<T> for CallbackSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        if let Ok(mut slot) = self.value.lock() {
            slot.get_or_insert(value);
        }
        Ok(())
    }

    fn complete(&self) {
        let value = self.value.lock().ok().and_then(|mut v| v.take());
        self.finish(Ok(value));
    }

    fn fail(&self, error: StreamError) {
        self.finish(Err(error));
    }
}
