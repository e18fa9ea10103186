//! `filter`.

use std::sync::Arc;

use super::Upstream;
use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) type Predicate<T> = dyn Fn(&T) -> bool + Send + Sync;

pub(crate) struct FilterPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
    predicate: Arc<Predicate<T>>,
}

impl<T> FilterPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, predicate: Arc<Predicate<T>>) -> Self {
        Self {
            upstream,
            predicate,
        }
    }
}

impl<T: 'static> Publisher<T> for FilterPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<T>>) {
        self.upstream.subscribe(Arc::new(FilterSubscriber {
            downstream,
            predicate: Arc::clone(&self.predicate),
            upstream: Upstream::new(),
        }));
    }
}

struct FilterSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    predicate: Arc<Predicate<T>>,
    upstream: Upstream,
}

impl<T> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(Arc::clone(&subscription));
        self.downstream.on_subscribed(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        if (self.predicate)(&value) {
            self.downstream.consume(value)
        } else {
            self.upstream.request(1);
            Ok(())
        }
    }

    fn complete(&self) {
        self.downstream.complete();
    }

    fn fail(&self, error: StreamError) {
        self.downstream.fail(error);
    }
}

#[cfg(test)]
mod tests {
    use crate::stream::{Flow, Recorder};

    #[test]
    fn filter_keeps_matching_values() {
        let recorder = Recorder::<i32>::unbounded();
        Flow::from_iter(1..=10)
            .filter(|v| v % 3 == 0)
            .subscribe(recorder.clone());
        assert_eq!(recorder.values(), vec![3, 6, 9]);
        assert!(recorder.is_completed());
    }

    #[test]
    fn suppressed_values_do_not_consume_downstream_credit() {
        let recorder = Recorder::<i32>::new(2);
        Flow::from_iter(1..=10)
            .filter(|v| *v > 5)
            .subscribe(recorder.clone());
        assert_eq!(recorder.values(), vec![6, 7]);
        assert!(!recorder.is_completed());
    }
}
