//! `buffer(n)`: batch values into lists of `n`.
//!
//! Demand is counted in batches downstream and in values upstream, so a
//! `request(k)` becomes `request(k * n)` on the upstream subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) struct BufferPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
    size: usize,
}

impl<T> BufferPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, size: usize) -> Self {
        Self { upstream, size }
    }
}

impl<T: Send + 'static> Publisher<Vec<T>> for BufferPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<Vec<T>>>) {
        self.upstream.subscribe(Arc::new(BufferSubscriber {
            downstream,
            size: self.size,
            pending: Mutex::new(Vec::with_capacity(self.size)),
            done: AtomicBool::new(false),
        }));
    }
}

struct BufferSubscriber<T> {
    downstream: Arc<dyn Subscriber<Vec<T>>>,
    size: usize,
    pending: Mutex<Vec<T>>,
    done: AtomicBool,
}

impl<T: Send> BufferSubscriber<T> {
    fn take_pending(&self) -> Vec<T> {
        self.pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default()
    }
}

impl<T: Send> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribed(Arc::new(BufferSubscription {
            upstream: subscription,
            size: self.size as u64,
        }));
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        let full = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| StreamError::Operator("buffer state poisoned".to_string()))?;
            pending.push(value);
            if pending.len() >= self.size {
                Some(std::mem::replace(&mut *pending, Vec::with_capacity(self.size)))
            } else {
                None
            }
        };
        match full {
            Some(batch) => self.downstream.consume(batch),
            None => Ok(()),
        }
    }

    fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let rest = self.take_pending();
        if !rest.is_empty() {
            if let Err(error) = self.downstream.consume(rest) {
                self.downstream.fail(error);
                return;
            }
        }
        self.downstream.complete();
    }

    fn fail(&self, error: StreamError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.take_pending();
        self.downstream.fail(error);
    }
}

struct BufferSubscription {
    upstream: Arc<dyn Subscription>,
    size: u64,
}

impl Subscription for BufferSubscription {
    fn request(&self, n: u64) {
        // Zero stays zero so the upstream reports the invalid demand.
        self.upstream.request(n.saturating_mul(self.size));
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}
