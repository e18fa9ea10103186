//! Reactive stream core: publisher / subscriber / subscription with manual
//! backpressure.
//!
//! The protocol:
//! - `Publisher::subscribe` calls `Subscriber::on_subscribed` exactly once,
//!   before any data.
//! - The subscriber then receives zero or more `consume` calls, never more than
//!   the credit it has granted through `Subscription::request`, never
//!   concurrently and always in emission order.
//! - At most one terminal call follows: `complete` or `fail`.
//! - `Subscription::cancel` is idempotent. After it, nothing more reaches the
//!   subscriber, on a best-effort basis when racing an in-flight emission.
//!
//! Everything here is synchronous: `consume` runs on whichever thread called
//! the matching emit. There are no internal timers or timeouts.
//!
//! - `emitter` -- per-subscriber credit gate with serialized delivery
//! - `source` -- cold iterator sources and the multi-subscriber `HotSource`
//! - `flow` / `single` -- multi-value and single-value stream handles
//! - `operators` -- map, filter, flat_map, buffer, skip, distinct, reduce, count, first
//! - `recorder` -- recording subscriber for assertions

use std::sync::Arc;

pub mod emitter;
pub mod error;
pub mod flow;
pub mod operators;
pub mod recorder;
pub mod single;
pub mod source;

pub use emitter::Emitter;
pub use error::StreamError;
pub use flow::Flow;
pub use recorder::Recorder;
pub use single::Single;
pub use source::HotSource;

/// Demand value meaning "no limit". Credit at this value is never decremented.
pub const UNBOUNDED: u64 = u64::MAX;

/// Handle a subscriber uses to pull data and to stop the flow.
pub trait Subscription: Send + Sync {
    /// Grant `n` more deliveries. `n` must be positive; `UNBOUNDED` lifts the limit.
    fn request(&self, n: u64);

    /// Stop delivery. Idempotent.
    fn cancel(&self);
}

/// Receiving side of a stream.
///
/// Returning `Err` from `consume` turns into a `fail` delivered to this same
/// subscriber; the upstream is not cancelled on its behalf.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribed(&self, subscription: Arc<dyn Subscription>);

    fn consume(&self, value: T) -> Result<(), StreamError>;

    fn complete(&self);

    fn fail(&self, error: StreamError);
}

/// Producing side of a stream.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Add `n` to an outstanding credit counter, saturating at `UNBOUNDED`.
pub(crate) fn add_credit(credit: &std::sync::atomic::AtomicU64, n: u64) {
    use std::sync::atomic::Ordering;
    let _ = credit.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        if current == UNBOUNDED {
            None
        } else {
            Some(current.saturating_add(n))
        }
    });
}

/// Take one unit of credit. Returns `false` (and leaves the counter alone)
/// when no credit is outstanding; the counter never goes below zero.
pub(crate) fn take_credit(credit: &std::sync::atomic::AtomicU64) -> bool {
    use std::sync::atomic::Ordering;
    credit
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
            0 => None,
            UNBOUNDED => Some(UNBOUNDED),
            n => Some(n - 1),
        })
        .is_ok()
}
