//! `distinct`.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use super::Upstream;
use crate::stream::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) struct DistinctPublisher<T> {
    upstream: Arc<dyn Publisher<T>>,
}

impl<T> DistinctPublisher<T> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>) -> Self {
        Self { upstream }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Publisher<T> for DistinctPublisher<T> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<T>>) {
        self.upstream.subscribe(Arc::new(DistinctSubscriber {
            downstream,
            seen: Mutex::new(HashSet::new()),
            upstream: Upstream::new(),
        }));
    }
}

/// Seen values are tracked per subscription.
struct DistinctSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    seen: Mutex<HashSet<T>>,
    upstream: Upstream,
}

impl<T: Clone + Eq + Hash + Send> Subscriber<T> for DistinctSubscriber<T> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.upstream.set(Arc::clone(&subscription));
        self.downstream.on_subscribed(subscription);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        let fresh = self
            .seen
            .lock()
            .map(|mut seen| seen.insert(value.clone()))
            .map_err(|_| StreamError::Operator("distinct state poisoned".to_string()))?;
        if fresh {
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
    fn distinct_suppresses_repeats() {
        let recorder = Recorder::<&str>::new(3);
        Flow::from_iter(vec!["a", "b", "a", "a", "c", "b", "d"])
            .distinct()
            .subscribe(recorder.clone());
        assert_eq!(recorder.values(), vec!["a", "b", "c"]);

        recorder.request(5);
        assert_eq!(recorder.values(), vec!["a", "b", "c", "d"]);
        assert!(recorder.is_completed());
    }
}
