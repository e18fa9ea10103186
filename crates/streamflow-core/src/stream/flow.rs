//! `Flow<T>`: a cloneable handle over any multi-value publisher, with the
//! operator chain.

use std::hash::Hash;
use std::sync::Arc;

use super::operators::{
    aggregate::{CountPublisher, FirstPublisher, ReducePublisher},
    buffer::BufferPublisher,
    distinct::DistinctPublisher,
    filter::FilterPublisher,
    flat_map::FlatMapPublisher,
    map::{MapPublisher, TryMapPublisher},
    skip::SkipPublisher,
};
use super::source::{CreatePublisher, IterPublisher, TerminalPublisher};
use super::{Emitter, Publisher, Single, StreamError, Subscriber, Subscription, UNBOUNDED};

/// Multi-value stream.
///
/// Operators never subscribe eagerly: each call wraps the current publisher
/// and returns a new `Flow`. Nothing happens until `subscribe`.
pub struct Flow<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<T: Send + 'static> Flow<T> {
    pub fn new(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { publisher }
    }

    /// Push-style cold source: `on_subscribe` runs once per subscriber with
    /// that subscriber's emitter.
    pub fn create(on_subscribe: impl Fn(Arc<Emitter<T>>) + Send + Sync + 'static) -> Self {
        Self::new(Arc::new(CreatePublisher::new(Arc::new(on_subscribe))))
    }

    pub fn empty() -> Self {
        Self::new(Arc::new(TerminalPublisher::completed()))
    }

    pub fn error(error: StreamError) -> Self {
        Self::new(Arc::new(TerminalPublisher::failed(error)))
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher.subscribe(subscriber);
    }

    pub fn publisher(&self) -> Arc<dyn Publisher<T>> {
        Arc::clone(&self.publisher)
    }

    // -- operators ----------------------------------------------------------

    pub fn map<U: Send + 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Flow<U> {
        Flow::new(Arc::new(MapPublisher::new(self.publisher(), Arc::new(f))))
    }

    /// Like `map`, but a failing function cancels the upstream and fails the
    /// downstream with the returned error.
    pub fn try_map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Result<U, StreamError> + Send + Sync + 'static,
    ) -> Flow<U> {
        Flow::new(Arc::new(TryMapPublisher::new(self.publisher(), Arc::new(f))))
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::new(Arc::new(FilterPublisher::new(
            self.publisher(),
            Arc::new(predicate),
        )))
    }

    /// Subscribe to one inner flow per value and merge their output.
    pub fn flat_map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Flow<U> {
        Flow::new(Arc::new(FlatMapPublisher::new(self.publisher(), Arc::new(f))))
    }

    /// Batch values into lists of `size`. A trailing partial batch is
    /// forwarded on completion.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn buffer(&self, size: usize) -> Flow<Vec<T>> {
        assert!(size > 0, "buffer size must be positive");
        Flow::new(Arc::new(BufferPublisher::new(self.publisher(), size)))
    }

    pub fn skip(&self, count: u64) -> Flow<T> {
        Flow::new(Arc::new(SkipPublisher::new(self.publisher(), count)))
    }

    /// Combine all values pairwise. Completes without a value when the
    /// upstream is empty.
    pub fn reduce(&self, f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Single<T> {
        Single::new(Arc::new(ReducePublisher::new(self.publisher(), Arc::new(f))))
    }

    pub fn count(&self) -> Single<u64> {
        Single::new(Arc::new(CountPublisher::new(self.publisher())))
    }

    /// The first value, after which the upstream is cancelled.
    pub fn first(&self) -> Single<T> {
        Single::new(Arc::new(FirstPublisher::new(self.publisher())))
    }

    /// Subscribe with unbounded demand and run `f` for every value. A failure
    /// is logged.
    pub fn for_each(&self, f: impl Fn(T) + Send + Sync + 'static) {
        self.subscribe(Arc::new(ForEach { f }));
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Flow<T> {
    /// Suppress values already seen by this subscription.
    pub fn distinct(&self) -> Flow<T> {
        Flow::new(Arc::new(DistinctPublisher::new(self.publisher())))
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    pub fn just(value: T) -> Self {
        Self::new(Arc::new(IterPublisher::new(vec![value])))
    }
}

/// Cold source over a snapshot of the items. Each subscriber walks the items
/// from the start and receives exactly as many as it requests.
impl<T: Clone + Send + Sync + 'static> FromIterator<T> for Flow<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::new(Arc::new(IterPublisher::new(iter.into_iter().collect())))
    }
}

impl<T: Send + 'static> Publisher<T> for Flow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher.subscribe(subscriber);
    }
}

struct ForEach<F> {
    f: F,
}

impl<T, F> Subscriber<T> for ForEach<F>
where
    F: Fn(T) + Send + Sync,
{
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        (self.f)(value);
        Ok(())
    }

    fn complete(&self) {}

    fn fail(&self, error: StreamError) {
        tracing::warn!(error = %error, "for_each stream failed");
    }
}
