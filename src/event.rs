use crate::waiter::{Phase, Waiter, Word, EMPTY, MARKED};
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

/// A representation of the state of an [`AsyncEvent`], which can either be `Set` (i.e.
/// signalled, ready) or `Unset` (i.e. not ready).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    /// The event is available and awaiting it completes without suspending.
    Set,
    /// The event is unavailable and a task awaiting it is suspended until it becomes set.
    Unset,
}

/// A single-consumer event that a task can await until another task or thread signals it.
///
/// At most one task may await an `AsyncEvent` at a time. [`AsyncEvent::set()`] may be called from
/// any thread, any number of times:
///
/// * If a task is suspended on the event, it is woken exactly once and the event is left
///   [`EventState::Unset`], i.e. the signal was consumed by that waiter.
/// * Otherwise the event becomes (or stays) [`EventState::Set`], and every later await completes
///   immediately until [`AsyncEvent::reset()`] is called. Awaiting a set event does not reset it.
///
/// Registering a second waiter while one is already suspended is a contract violation and panics.
pub struct AsyncEvent {
    /// `EMPTY` for unset, `MARKED` for set, otherwise the address of the lone waiter.
    state: AtomicUsize,
}

impl AsyncEvent {
    /// Create a new [`AsyncEvent`] in the given initial state.
    pub const fn new(state: EventState) -> AsyncEvent {
        let word = match state {
            EventState::Set => MARKED,
            EventState::Unset => EMPTY,
        };
        AsyncEvent {
            state: AtomicUsize::new(word),
        }
    }

    /// Signal the event. Wakes the suspended waiter if there is one (leaving the event unset),
    /// otherwise leaves the event set for the next awaiter.
    pub fn set(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match Word::decode(state) {
                Word::Marked => return,
                Word::Empty => MARKED,
                Word::Waiter(_) => EMPTY,
            };

            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        if let Word::Waiter(node) = Word::decode(state) {
            tracing::trace!("waking the waiter of a set event");
            // SAFETY: the CAS above detached the node, and its owner cannot free it before it
            // is notified.
            unsafe { Waiter::notify(node) };
        }
    }

    /// Set the state of the event to [`EventState::Unset`] if it is currently set. A suspended
    /// waiter is not affected.
    pub fn reset(&self) {
        let _ = self
            .state
            .compare_exchange(MARKED, EMPTY, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Returns `true` if the event is currently set.
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == MARKED
    }

    /// Wait for the event to become set. Completes immediately if it already is.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            event: self,
            waiter: Waiter::new(),
            phase: Phase::Idle,
        }
    }

    /// Readiness check plus suspend step: `Ready` if the event was set, `Pending` once the waiter
    /// is published.
    fn register(&self, waiter: Pin<&Waiter>, cx: &Context<'_>) -> Poll<()> {
        if self.state.load(Ordering::Acquire) == MARKED {
            return Poll::Ready(());
        }

        waiter.prepare(cx);
        let node = Word::Waiter(waiter.as_node()).encode();
        match self
            .state
            .compare_exchange(EMPTY, node, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Poll::Pending,
            Err(actual) => {
                waiter.unprepare();
                match Word::decode(actual) {
                    Word::Marked => Poll::Ready(()),
                    _ => panic!("AsyncEvent already has a waiter; only one task may await it"),
                }
            }
        }
    }
}

impl Default for AsyncEvent {
    fn default() -> AsyncEvent {
        AsyncEvent::new(EventState::Unset)
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match Word::decode(self.state.load(Ordering::Relaxed)) {
            Word::Marked => "Set",
            Word::Empty => "Unset",
            Word::Waiter(_) => "Waiting",
        };
        f.debug_struct("AsyncEvent").field("state", &state).finish()
    }
}

/// Future returned by [`AsyncEvent::wait()`].
///
/// Dropping it while suspended withdraws the registration. If `set()` already claimed the waiter,
/// the signal is passed back to the event instead of being lost.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct EventWait<'a> {
    event: &'a AsyncEvent,
    #[pin]
    waiter: Waiter,
    phase: Phase,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let waiter = this.waiter.into_ref();

        match this.phase {
            Phase::Idle => {
                if this.event.register(waiter, cx).is_pending() {
                    *this.phase = Phase::Queued;
                    return Poll::Pending;
                }
            }
            Phase::Queued => {
                if waiter.poll_notified(cx).is_pending() {
                    return Poll::Pending;
                }
            }
            Phase::Done => panic!("`EventWait` polled after completion"),
        }

        *this.phase = Phase::Done;
        Poll::Ready(())
    }
}

#[pinned_drop]
impl PinnedDrop for EventWait<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.phase != Phase::Queued {
            return;
        }

        let waiter = this.waiter.into_ref();
        let node = Word::Waiter(waiter.as_node()).encode();
        if this
            .event
            .state
            .compare_exchange(node, EMPTY, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // `set()` detached us first; it still holds the node until it is notified.
        waiter.park_until_notified();
        this.event.set();
    }
}
