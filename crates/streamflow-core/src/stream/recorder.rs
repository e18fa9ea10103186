//! Recording subscriber for assertions.
//!
//! `Recorder` grants an initial amount of credit on subscription, records every
//! signal it receives and exposes the recording. It can also reject selected
//! values and check that `consume` calls never overlap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{StreamError, Subscriber, Subscription, UNBOUNDED};

type RejectFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A subscriber that records what it sees.
pub struct Recorder<T> {
    initial_request: u64,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    values: Mutex<Vec<T>>,
    consume_calls: AtomicUsize,
    subscribed_calls: AtomicUsize,
    completed: AtomicBool,
    error: Mutex<Option<StreamError>>,
    terminals: AtomicUsize,
    reject: Mutex<Option<RejectFn<T>>>,
    check_serial: AtomicBool,
    in_consume: AtomicBool,
    overlap: AtomicBool,
}

impl<T: Send + 'static> Recorder<T> {
    /// A recorder that requests `initial_request` values once subscribed.
    /// Zero means "request nothing until told to".
    pub fn new(initial_request: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_request,
            subscription: Mutex::new(None),
            values: Mutex::new(Vec::new()),
            consume_calls: AtomicUsize::new(0),
            subscribed_calls: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            error: Mutex::new(None),
            terminals: AtomicUsize::new(0),
            reject: Mutex::new(None),
            check_serial: AtomicBool::new(false),
            in_consume: AtomicBool::new(false),
            overlap: AtomicBool::new(false),
        })
    }

    /// A recorder with unbounded demand.
    pub fn unbounded() -> Arc<Self> {
        Self::new(UNBOUNDED)
    }

    /// Refuse values matching `predicate` by returning an error from `consume`.
    pub fn reject_when(
        self: Arc<Self>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = Some(Box::new(predicate));
        }
        self
    }

    /// Record whether two `consume` calls ever run at the same time.
    pub fn assert_serial(self: Arc<Self>) -> Arc<Self> {
        self.check_serial.store(true, Ordering::Release);
        self
    }

    pub fn request(&self, n: u64) {
        if let Some(subscription) = self.current_subscription() {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        if let Some(subscription) = self.current_subscription() {
            subscription.cancel();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed_calls.load(Ordering::Acquire) > 0
    }

    pub fn subscribed_calls(&self) -> usize {
        self.subscribed_calls.load(Ordering::Acquire)
    }

    /// Number of `consume` calls, rejected values included.
    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<StreamError> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    /// Number of `complete` plus `fail` calls received.
    pub fn terminal_count(&self) -> usize {
        self.terminals.load(Ordering::Acquire)
    }

    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::Acquire)
    }

    fn current_subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.lock().ok().and_then(|s| s.clone())
    }

    fn rejects(&self, value: &T) -> bool {
        self.reject
            .lock()
            .ok()
            .is_some_and(|reject| reject.as_ref().is_some_and(|f| f(value)))
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// Values accepted so far, in delivery order.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl<T: Send + 'static> Subscriber<T> for Recorder<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.subscribed_calls.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut slot) = self.subscription.lock() {
            *slot = Some(Arc::clone(&subscription));
        }
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        let serial = self.check_serial.load(Ordering::Acquire);
        if serial && self.in_consume.swap(true, Ordering::AcqRel) {
            self.overlap.store(true, Ordering::Release);
        }
        self.consume_calls.fetch_add(1, Ordering::AcqRel);

        let result = if self.rejects(&value) {
            Err(StreamError::rejected("value refused by recorder"))
        } else {
            if let Ok(mut values) = self.values.lock() {
                values.push(value);
            }
            Ok(())
        };

        if serial {
            std::thread::yield_now();
            self.in_consume.store(false, Ordering::Release);
        }
        result
    }

    fn complete(&self) {
        self.terminals.fetch_add(1, Ordering::AcqRel);
        self.completed.store(true, Ordering::Release);
    }

    fn fail(&self, error: StreamError) {
        self.terminals.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error);
        }
    }
}
