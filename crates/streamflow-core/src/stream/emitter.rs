//! Credit-gated, serialized delivery to a single subscriber.
//!
//! An `Emitter` is what push-style sources write into. It owns the
//! subscriber's outstanding credit and is handed to the subscriber as its
//! `Subscription`.
//!
//! Emission without credit is a producer bug, not a buffering contract: the
//! value is dropped and `emit` returns `false`. Authorized values go through a
//! small queue drained by whichever thread wins the `wip` counter, so
//! concurrent or re-entrant emits never overlap `consume` calls and keep
//! emission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{StreamError, Subscriber, Subscription, add_credit, take_credit};

enum Signal<T> {
    Next(T),
    Complete,
    Fail(StreamError),
}

/// Per-subscriber delivery handle for push-style sources.
pub struct Emitter<T> {
    subscriber: Arc<dyn Subscriber<T>>,
    credit: AtomicU64,
    /// Set by `cancel`, by a rejected value, or once a terminal was delivered.
    cancelled: AtomicBool,
    /// Set once the producer signalled `complete` or `fail`.
    finished: AtomicBool,
    /// Set when the subscriber made an invalid request.
    demand_error: AtomicBool,
    queue: Mutex<VecDeque<Signal<T>>>,
    wip: AtomicUsize,
}

impl<T: Send + 'static> Emitter<T> {
    /// Create an emitter and hand it to `subscriber` through `on_subscribed`.
    pub fn attach(subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        let emitter = Arc::new(Self {
            subscriber: Arc::clone(&subscriber),
            credit: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            demand_error: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            wip: AtomicUsize::new(0),
        });
        subscriber.on_subscribed(Arc::clone(&emitter) as Arc<dyn Subscription>);
        emitter
    }

    /// Offer one value. Returns `true` if the value was authorized by
    /// outstanding credit and queued for delivery, `false` if it was dropped.
    ///
    /// # Panics
    ///
    /// Emitting after this emitter's producer called `complete` or `fail`
    /// violates the protocol and panics.
    pub fn emit(&self, value: T) -> bool {
        if self.finished.load(Ordering::Acquire) {
            panic!("stream protocol violation: emit after terminal signal");
        }
        if self.is_cancelled() || self.demand_error.load(Ordering::Acquire) {
            return false;
        }
        if !take_credit(&self.credit) {
            tracing::warn!("emission without outstanding credit, value dropped");
            return false;
        }
        self.push(Signal::Next(value));
        true
    }

    /// Signal successful completion. Later calls are ignored.
    pub fn complete(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.push(Signal::Complete);
    }

    /// Signal failure. Later calls are ignored.
    pub fn fail(&self, error: StreamError) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.push(Signal::Fail(error));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Credit currently outstanding.
    pub fn outstanding(&self) -> u64 {
        self.credit.load(Ordering::Acquire)
    }

    fn push(&self, signal: Signal<T>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(signal);
        }
        self.drain();
    }

    fn pop(&self) -> Option<Signal<T>> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn discard_queued(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            while let Some(signal) = self.pop() {
                if self.is_cancelled() {
                    self.discard_queued();
                    break;
                }
                match signal {
                    Signal::Next(value) => {
                        if let Err(error) = self.subscriber.consume(value) {
                            self.cancelled.store(true, Ordering::Release);
                            self.discard_queued();
                            self.subscriber.fail(error);
                        } else if self.is_cancelled() {
                            self.discard_queued();
                        }
                    }
                    Signal::Complete => {
                        self.cancelled.store(true, Ordering::Release);
                        self.subscriber.complete();
                    }
                    Signal::Fail(error) => {
                        self.cancelled.store(true, Ordering::Release);
                        self.subscriber.fail(error);
                    }
                }
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl<T: Send + 'static> Subscription for Emitter<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.demand_error.swap(true, Ordering::AcqRel) {
                self.push(Signal::Fail(StreamError::InvalidDemand(n)));
            }
            return;
        }
        add_credit(&self.credit, n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.discard_queued();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
