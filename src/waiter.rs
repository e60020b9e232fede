//! Intrusive waiter nodes shared by every primitive in this crate.
//!
//! A [`Waiter`] lives inside the (pinned) future of a suspended task. The primitives only ever
//! hold borrowed raw pointers to it, linked together through the node's `next` field, and never
//! own or allocate one. The owning future must not free its node while it is reachable from a
//! primitive's state word; destructors use [`Waiter::park_until_notified()`] to wait out a
//! notifier that has already claimed the node.

use futures_util::task::AtomicWaker;
use parking_lot_core as plc;
use std::cell::UnsafeCell;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

/// Not yet published to any primitive.
const IDLE: u8 = 0;
/// Reachable from a primitive's waiter list.
const QUEUED: u8 = 1;
/// Claimed by a notifier that is still reading the node.
const NOTIFYING: u8 = 2;
/// Handed off. The notifier no longer touches the node.
const NOTIFIED: u8 = 3;

/// Sentinel for "no waiter": `Unset` for an event, `Unlocked` for a mutex.
pub(crate) const EMPTY: usize = 0;
/// Sentinel for "no waiter, but marked": `Set` for an event, `LockedNoWaiters` for a mutex.
pub(crate) const MARKED: usize = 1;

/// Progress of the future that owns a [`Waiter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Not polled yet, or polled without having to queue.
    Idle,
    /// The node is published, or was claimed by a notifier but not yet observed.
    Queued,
    /// The output has been returned.
    Done,
}

/// Typed view of an atomic word that holds either a sentinel or the address of a [`Waiter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Word {
    Empty,
    Marked,
    Waiter(NonNull<Waiter>),
}

impl Word {
    pub(crate) fn decode(word: usize) -> Word {
        match word {
            EMPTY => Word::Empty,
            MARKED => Word::Marked,
            // SAFETY: anything outside the sentinel range was stored by `encode()` from a
            // non-null node pointer.
            addr => Word::Waiter(unsafe { NonNull::new_unchecked(addr as *mut Waiter) }),
        }
    }

    pub(crate) fn encode(self) -> usize {
        match self {
            Word::Empty => EMPTY,
            Word::Marked => MARKED,
            Word::Waiter(node) => node.as_ptr() as usize,
        }
    }
}

// Node addresses must never alias the sentinels.
const _: () = assert!(std::mem::align_of::<Waiter>() > MARKED);

pub(crate) struct Waiter {
    state: AtomicU8,
    waker: AtomicWaker,
    /// Written by whoever links the node, read by whoever pops it. Never touched by the owner
    /// while the node is queued.
    next: UnsafeCell<*const Waiter>,
    _pinned: PhantomPinned,
}

// The node is only shared through raw pointers, and every field access is ordered by the
// `state` protocol described on each method.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
    pub(crate) const fn new() -> Waiter {
        Waiter {
            state: AtomicU8::new(IDLE),
            waker: AtomicWaker::new(),
            next: UnsafeCell::new(ptr::null()),
            _pinned: PhantomPinned,
        }
    }

    pub(crate) fn as_node(self: Pin<&Self>) -> NonNull<Waiter> {
        NonNull::from(self.get_ref())
    }

    /// Prepares the node to be published: stores the task's waker and marks it queued. The
    /// caller publishes the node with a `Release` CAS right after.
    pub(crate) fn prepare(&self, cx: &Context<'_>) {
        self.waker.register(cx.waker());
        self.state.store(QUEUED, Ordering::Relaxed);
    }

    /// Reverts [`Waiter::prepare()`] after the publishing CAS lost a race and the task no longer
    /// needs to queue.
    pub(crate) fn unprepare(&self) {
        self.state.store(IDLE, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn is_queued(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), QUEUED | NOTIFYING)
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.state.load(Ordering::Acquire) == NOTIFIED
    }

    /// Sets the link used by the primitive's intrusive list.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the link: either the node is not yet published,
    /// or the caller has detached it from the shared list.
    pub(crate) unsafe fn set_next(&self, next: *const Waiter) {
        *self.next.get() = next;
    }

    /// # Safety
    ///
    /// Same as [`Waiter::set_next()`], or the node was published with `Release` and the caller
    /// observed it with `Acquire` while no other thread can pop it.
    pub(crate) unsafe fn next(&self) -> *const Waiter {
        *self.next.get()
    }

    /// Checks whether the node was handed off, re-registering the task's waker if not.
    pub(crate) fn poll_notified(&self, cx: &Context<'_>) -> Poll<()> {
        if self.is_notified() {
            return Poll::Ready(());
        }

        self.waker.register(cx.waker());

        // A notifier that took the waker before we registered ours would wake a stale one, so
        // wait out its (bounded) window instead of returning `Pending` on top of it.
        let mut spin = plc::SpinWait::new();
        loop {
            match self.state.load(Ordering::Acquire) {
                NOTIFIED => return Poll::Ready(()),
                NOTIFYING => {
                    if !spin.spin() {
                        spin.reset();
                    }
                }
                _ => return Poll::Pending,
            }
        }
    }

    /// Blocks the calling thread until a notifier has handed off this node.
    pub(crate) fn park_until_notified(&self) {
        let key = self as *const Waiter as usize;
        while !self.is_notified() {
            tracing::debug!(waiter = key, "parking thread until queued waiter is notified");
            unsafe {
                plc::park(
                    key,
                    || !self.is_notified(),
                    || {},
                    |_, _| {},
                    plc::DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }

    /// Hands off a detached node and wakes its task.
    ///
    /// # Safety
    ///
    /// `node` must point to a live, queued waiter that the caller has removed from every shared
    /// list. The node may be freed by its owner as soon as this function stores `NOTIFIED`.
    pub(crate) unsafe fn notify(node: NonNull<Waiter>) {
        let waiter = node.as_ref();
        waiter.state.store(NOTIFYING, Ordering::Release);
        let waker = waiter.waker.take();
        waiter.state.store(NOTIFIED, Ordering::Release);

        // Only the address is used from here on.
        plc::unpark_all(node.as_ptr() as usize, plc::DEFAULT_UNPARK_TOKEN);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
