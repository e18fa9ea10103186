//! Stream sources.
//!
//! - `IterPublisher` -- cold, pull-driven: each subscriber walks its own copy
//!   of the items and receives exactly as many as it requested.
//! - `CreatePublisher` -- cold, push-driven: runs a callback per subscriber
//!   with that subscriber's `Emitter`.
//! - `TerminalPublisher` -- completes or fails right after subscription.
//! - `HotSource` -- push-driven and shared: every value is offered to every
//!   current subscriber through its own credit gate.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    Emitter, Flow, Publisher, StreamError, Subscriber, Subscription, add_credit, take_credit,
};

// ---------------------------------------------------------------------------
// Cold iterator source
// ---------------------------------------------------------------------------

pub(crate) struct IterPublisher<T> {
    items: Arc<Vec<T>>,
}

impl<T> IterPublisher<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for IterPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Arc::new(IterSubscription {
            subscriber: Arc::clone(&subscriber),
            items: Arc::clone(&self.items),
            index: AtomicUsize::new(0),
            credit: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            pending_error: Mutex::new(None),
            wip: AtomicUsize::new(0),
        });
        subscriber.on_subscribed(Arc::clone(&subscription) as Arc<dyn Subscription>);
        // Lets an empty source complete without any request.
        subscription.drain();
    }
}

struct IterSubscription<T> {
    subscriber: Arc<dyn Subscriber<T>>,
    items: Arc<Vec<T>>,
    index: AtomicUsize,
    credit: AtomicU64,
    cancelled: AtomicBool,
    pending_error: Mutex<Option<StreamError>>,
    wip: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> IterSubscription<T> {
    fn take_pending_error(&self) -> Option<StreamError> {
        self.pending_error.lock().ok().and_then(|mut e| e.take())
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            self.emit_available();
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn emit_available(&self) {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if let Some(error) = self.take_pending_error() {
                self.cancelled.store(true, Ordering::Release);
                self.subscriber.fail(error);
                return;
            }
            let index = self.index.load(Ordering::Acquire);
            let Some(item) = self.items.get(index) else {
                self.cancelled.store(true, Ordering::Release);
                self.subscriber.complete();
                return;
            };
            if !take_credit(&self.credit) {
                return;
            }
            self.index.store(index + 1, Ordering::Release);
            if let Err(error) = self.subscriber.consume(item.clone()) {
                self.cancelled.store(true, Ordering::Release);
                self.subscriber.fail(error);
                return;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for IterSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if let Ok(mut pending) = self.pending_error.lock() {
                pending.get_or_insert(StreamError::InvalidDemand(n));
            }
        } else {
            add_credit(&self.credit, n);
        }
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Cold push source
// ---------------------------------------------------------------------------

type CreateFn<T> = dyn Fn(Arc<Emitter<T>>) + Send + Sync;

pub(crate) struct CreatePublisher<T> {
    on_subscribe: Arc<CreateFn<T>>,
}

impl<T> CreatePublisher<T> {
    pub(crate) fn new(on_subscribe: Arc<CreateFn<T>>) -> Self {
        Self { on_subscribe }
    }
}

impl<T: Send + 'static> Publisher<T> for CreatePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let emitter = Emitter::attach(subscriber);
        (self.on_subscribe)(emitter);
    }
}

// ---------------------------------------------------------------------------
// Immediately terminating source
// ---------------------------------------------------------------------------

pub(crate) struct TerminalPublisher {
    error: Option<StreamError>,
}

impl TerminalPublisher {
    pub(crate) fn completed() -> Self {
        Self { error: None }
    }

    pub(crate) fn failed(error: StreamError) -> Self {
        Self { error: Some(error) }
    }
}

/// Subscription handed out by sources that never deliver values.
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

impl<T> Publisher<T> for TerminalPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribed(Arc::new(NoopSubscription));
        match &self.error {
            Some(error) => subscriber.fail(error.clone()),
            None => subscriber.complete(),
        }
    }
}

// ---------------------------------------------------------------------------
// HotSource
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Terminal {
    Completed,
    Failed(StreamError),
}

struct HotState<T> {
    emitters: Vec<Arc<Emitter<T>>>,
    terminal: Option<Terminal>,
}

/// Shared push source.
///
/// Each subscriber gets its own `Emitter`, so credit and cancellation are per
/// subscriber: a subscriber without credit loses the value, the others still
/// receive it. A subscriber arriving after `complete`/`fail` receives that
/// terminal signal immediately.
pub struct HotSource<T> {
    state: Mutex<HotState<T>>,
}

impl<T: Clone + Send + 'static> HotSource<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HotState {
                emitters: Vec::new(),
                terminal: None,
            }),
        })
    }

    /// View this source as a `Flow`.
    pub fn flow(self: &Arc<Self>) -> Flow<T> {
        Flow::new(Arc::clone(self) as Arc<dyn Publisher<T>>)
    }

    /// Offer `value` to every live subscriber. Returns how many accepted it.
    ///
    /// # Panics
    ///
    /// Emitting after `complete` or `fail` violates the protocol and panics.
    pub fn emit(&self, value: T) -> usize {
        let emitters = {
            let Ok(mut state) = self.state.lock() else {
                return 0;
            };
            if state.terminal.is_some() {
                panic!("stream protocol violation: emit after terminal signal");
            }
            state.emitters.retain(|e| !e.is_cancelled());
            state.emitters.clone()
        };
        emitters
            .iter()
            .filter(|emitter| emitter.emit(value.clone()))
            .count()
    }

    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    pub fn fail(&self, error: StreamError) {
        self.terminate(Terminal::Failed(error));
    }

    /// Subscribers that have not cancelled.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.emitters.iter().filter(|e| !e.is_cancelled()).count())
            .unwrap_or(0)
    }

    fn terminate(&self, terminal: Terminal) {
        let emitters = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.emitters)
        };
        for emitter in emitters {
            signal_terminal(&emitter, &terminal);
        }
    }
}

fn signal_terminal<T: Send + 'static>(emitter: &Emitter<T>, terminal: &Terminal) {
    match terminal {
        Terminal::Completed => emitter.complete(),
        Terminal::Failed(error) => emitter.fail(error.clone()),
    }
}

impl<T: Clone + Send + 'static> Publisher<T> for HotSource<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        // Attached outside the lock: `on_subscribed` may call back into us.
        let emitter = Emitter::attach(subscriber);
        let terminal = match self.state.lock() {
            Ok(mut state) => match &state.terminal {
                Some(terminal) => Some(terminal.clone()),
                None => {
                    state.emitters.push(Arc::clone(&emitter));
                    None
                }
            },
            Err(_) => Some(Terminal::Failed(StreamError::source("hot source poisoned"))),
        };
        if let Some(terminal) = terminal {
            signal_terminal(&emitter, &terminal);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
