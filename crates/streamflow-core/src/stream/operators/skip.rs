//! `skip`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Upstream;
use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) struct SkipPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
    count: u64,
}

impl<T> SkipPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, count: u64) -> Self {
        Self { upstream, count }
    }
}

impl<T: 'static> Publisher<T> for SkipPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<T>>) {
        self.upstream.subscribe(Arc::new(SkipSubscriber {
            downstream,
            remaining: AtomicU64::new(self.count),
            upstream: Upstream::new(),
        }));
    }
}

struct SkipSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    remaining: AtomicU64,
    upstream: Upstream,
}

impl<T> Subscriber<T> for SkipSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(Arc::clone(&subscription));
        self.downstream.on_subscribed(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        let skipped = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            self.upstream.request(1);
            return Ok(());
        }
        self.downstream.consume(value)
    }

    fn complete(&self) {
        self.downstream.complete();
    }

    fn fail(&self, error: StreamError) {
        self.downstream.fail(error);
    }
}
