//! `flat_map`: one inner flow per outer value, output merged.
//!
//! The outer and every inner flow are requested unbounded; their values are
//! queued and released to the downstream as it grants credit. The operator
//! owns every inner subscription it creates and cancels them itself when the
//! outer fails, an inner fails, or the downstream cancels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::Upstream;
use crate::stream::{
    Flow, Publisher, StreamError, Subscriber, Subscription, UNBOUNDED, add_credit, take_credit,
};

pub(crate) type FlatMapFn<T, U> = dyn Fn(T) -> Flow<U> + Send + Sync;

pub(crate) struct FlatMapPublisher<T, U> {
    upstream: Arc<dyn Publisher<T>>,
    f: Arc<FlatMapFn<T, U>>,
}

impl<T, U> FlatMapPublisher<T, U> {
    pub(crate) fn new(upstream: Arc<dyn Publisher<T>>, f: Arc<FlatMapFn<T, U>>) -> Self {
        Self { upstream, f }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for FlatMapPublisher<T, U> {
    fn subscribe(&self, downstream: Arc<dyn Subscriber<U>>) {
        let state = Arc::new(MergeState::new(downstream));
        self.upstream.subscribe(Arc::new(OuterSubscriber {
            state,
            f: Arc::clone(&self.f),
        }));
    }
}

// ---------------------------------------------------------------------------
// Shared merge state
// ---------------------------------------------------------------------------

struct MergeState<U> {
    downstream: Arc<dyn Subscriber<U>>,
    queue: Mutex<VecDeque<U>>,
    demand: AtomicU64,
    wip: AtomicUsize,
    /// Sources still running: the outer plus every live inner.
    active: AtomicUsize,
    done: AtomicBool,
    error: Mutex<Option<StreamError>>,
    outer: Upstream,
    inners: Mutex<HashMap<u64, Arc<dyn Subscription>>>,
    next_inner: AtomicU64,
}

impl<U: Send + 'static> MergeState<U> {
    fn new(downstream: Arc<dyn Subscriber<U>>) -> Self {
        Self {
            downstream,
            queue: Mutex::new(VecDeque::new()),
            demand: AtomicU64::new(0),
            wip: AtomicUsize::new(0),
            active: AtomicUsize::new(1),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            outer: Upstream::new(),
            inners: Mutex::new(HashMap::new()),
            next_inner: AtomicU64::new(0),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn cancel_all(&self) {
        self.outer.cancel();
        let inners = self
            .inners
            .lock()
            .map(|mut inners| std::mem::take(&mut *inners))
            .unwrap_or_default();
        for subscription in inners.into_values() {
            subscription.cancel();
        }
    }

    fn clear_queue(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn fail_with(&self, error: StreamError) {
        if let Ok(mut slot) = self.error.lock() {
            slot.get_or_insert(error);
        }
        self.cancel_all();
        self.drain();
    }

    fn source_finished(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.drain();
    }

    fn remove_inner(&self, id: u64) {
        if let Ok(mut inners) = self.inners.lock() {
            inners.remove(&id);
        }
    }

    fn enqueue(&self, value: U) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(value);
        }
        self.drain();
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            self.deliver_ready();
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn deliver_ready(&self) {
        loop {
            if self.is_done() {
                self.clear_queue();
                return;
            }
            if let Some(error) = self.error.lock().ok().and_then(|mut e| e.take()) {
                self.done.store(true, Ordering::Release);
                self.clear_queue();
                self.downstream.fail(error);
                return;
            }
            let queued = self.queue.lock().map(|q| !q.is_empty()).unwrap_or(false);
            if !queued {
                if self.active.load(Ordering::Acquire) == 0 {
                    self.done.store(true, Ordering::Release);
                    self.downstream.complete();
                }
                return;
            }
            if !take_credit(&self.demand) {
                return;
            }
            let Some(value) = self.queue.lock().ok().and_then(|mut q| q.pop_front()) else {
                continue;
            };
            if let Err(error) = self.downstream.consume(value) {
                if let Ok(mut slot) = self.error.lock() {
                    slot.get_or_insert(error);
                }
                self.cancel_all();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream subscription
// ---------------------------------------------------------------------------

struct MergeSubscription<U> {
    state: Arc<MergeState<U>>,
}

impl<U: Send + 'static> Subscription for MergeSubscription<U> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.state.fail_with(StreamError::InvalidDemand(n));
            return;
        }
        add_credit(&self.state.demand, n);
        self.state.drain();
    }

    fn cancel(&self) {
        self.state.done.store(true, Ordering::Release);
        self.state.cancel_all();
        self.state.clear_queue();
    }
}

// ---------------------------------------------------------------------------
// Outer and inner subscribers
// ---------------------------------------------------------------------------

struct OuterSubscriber<T, U> {
    state: Arc<MergeState<U>>,
    f: Arc<FlatMapFn<T, U>>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for OuterSubscriber<T, U> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        self.state.outer.set(Arc::clone(&subscription));
        self.state
            .downstream
            .on_subscribed(Arc::new(MergeSubscription {
                state: Arc::clone(&self.state),
            }));
        if !self.state.is_done() {
            subscription.request(UNBOUNDED);
        }
    }

    fn consume(&self, value: T) -> Result<(), StreamError> {
        if self.state.is_done() {
            return Ok(());
        }
        let inner = (self.f)(value);
        self.state.active.fetch_add(1, Ordering::AcqRel);
        let id = self.state.next_inner.fetch_add(1, Ordering::AcqRel);
        inner.subscribe(Arc::new(InnerSubscriber {
            state: Arc::clone(&self.state),
            id,
        }));
        Ok(())
    }

    fn complete(&self) {
        self.state.source_finished();
    }

    fn fail(&self, error: StreamError) {
        self.state.fail_with(error);
    }
}

struct InnerSubscriber<U> {
    state: Arc<MergeState<U>>,
    id: u64,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>) {
        if let Ok(mut inners) = self.state.inners.lock() {
            inners.insert(self.id, Arc::clone(&subscription));
        }
        // Re-checked after registering: a concurrent cancel_all may have
        // already swept the map.
        if self.state.is_done() {
            subscription.cancel();
            return;
        }
        subscription.request(UNBOUNDED);
    }

    fn consume(&self, value: U) -> Result<(), StreamError> {
        if !self.state.is_done() {
            self.state.enqueue(value);
        }
        Ok(())
    }

    fn complete(&self) {
        self.state.remove_inner(self.id);
        self.state.source_finished();
    }

    fn fail(&self, error: StreamError) {
        self.state.remove_inner(self.id);
        self.state.fail_with(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::stream::{Flow, HotSource, Recorder, StreamError};

    #[test]
    fn flat_map_merges_inner_output() {
        let recorder = Recorder::<u32>::unbounded();
        Flow::from_iter(vec![1u32, 2, 3])
            .flat_map(|v| Flow::from_iter(vec![v; v as usize]))
            .subscribe(recorder.clone());
        assert_eq!(recorder.values(), vec![1, 2, 2, 3, 3, 3]);
        assert!(recorder.is_completed());
        assert_eq!(recorder.terminal_count(), 1);
    }

    #[test]
    fn flat_map_holds_values_until_requested() {
        let recorder = Recorder::<u32>::new(2);
        Flow::from_iter(vec![1u32, 2])
            .flat_map(|v| Flow::from_iter(vec![v * 10, v * 10 + 1]))
            .subscribe(recorder.clone());
        assert_eq!(recorder.values(), vec![10, 11]);
        assert!(!recorder.is_completed());

        recorder.request(5);
        assert_eq!(recorder.values(), vec![10, 11, 20, 21]);
        assert!(recorder.is_completed());
    }

    #[test]
    fn outer_failure_cancels_inner_subscriptions() {
        let outer = HotSource::<i32>::new();
        let inner = HotSource::<i32>::new();
        let inner_for_map = Arc::clone(&inner);
        let recorder = Recorder::<i32>::unbounded();
        outer
            .flow()
            .flat_map(move |_| inner_for_map.flow())
            .subscribe(recorder.clone());

        outer.emit(1);
        assert_eq!(inner.subscriber_count(), 1);
        inner.emit(10);
        assert_eq!(recorder.values(), vec![10]);

        outer.fail(StreamError::source("outer"));
        assert_eq!(inner.subscriber_count(), 0);
        assert_eq!(inner.emit(11), 0);
        assert_eq!(recorder.error(), Some(StreamError::source("outer")));
        assert_eq!(recorder.terminal_count(), 1);
    }

    #[test]
    fn inner_failure_cancels_outer() {
        let outer = HotSource::<i32>::new();
        let recorder = Recorder::<i32>::unbounded();
        outer
            .flow()
            .flat_map(|v| {
                if v < 0 {
                    Flow::error(StreamError::source("negative"))
                } else {
                    Flow::just(v)
                }
            })
            .subscribe(recorder.clone());

        outer.emit(1);
        outer.emit(-1);
        assert_eq!(recorder.values(), vec![1]);
        assert_eq!(recorder.error(), Some(StreamError::source("negative")));
        assert_eq!(outer.subscriber_count(), 0);
    }

    #[test]
    fn downstream_cancel_reaches_outer_and_inners() {
        let outer = HotSource::<i32>::new();
        let inner = HotSource::<i32>::new();
        let inner_for_map = Arc::clone(&inner);
        let recorder = Recorder::<i32>::unbounded();
        outer
            .flow()
            .flat_map(move |_| inner_for_map.flow())
            .subscribe(recorder.clone());
        outer.emit(1);

        recorder.cancel();
        assert_eq!(outer.subscriber_count(), 0);
        assert_eq!(inner.subscriber_count(), 0);
        assert_eq!(recorder.terminal_count(), 0);
    }
}
