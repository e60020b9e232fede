use crate::mutex::{AsyncMutex, AsyncMutexGuard};
use crate::waiter::{Phase, Waiter};
use parking_lot_core::SpinWait;
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

/// Low bit of the waiter list word, held by whoever is popping waiters.
const POPPING: usize = 1;

/// A condition variable paired with one [`AsyncMutex`].
///
/// Tasks wait for a condition on the data protected by the mutex with
/// [`ConditionVariable::wait_until()`], which releases the mutex while suspended and re-acquires
/// it before checking the condition again. Notifications should be sent while holding the same
/// mutex.
///
/// Waiters are kept on an intrusive stack, so [`ConditionVariable::notify_one()`] wakes the most
/// recently registered waiter. No FIFO order is guaranteed.
pub struct ConditionVariable<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
    /// Head of the waiter stack, with `POPPING` or-ed in while a notifier is popping.
    waiters: AtomicUsize,
}

impl<'a, T: ?Sized> ConditionVariable<'a, T> {
    /// Create a condition variable paired with `mutex`.
    pub const fn new(mutex: &'a AsyncMutex<T>) -> ConditionVariable<'a, T> {
        ConditionVariable {
            mutex,
            waiters: AtomicUsize::new(0),
        }
    }

    /// The mutex this condition variable is paired with.
    pub fn mutex(&self) -> &'a AsyncMutex<T> {
        self.mutex
    }

    /// Wakes the most recently registered waiter, if any.
    pub fn notify_one(&self) {
        debug_assert!(
            self.mutex.is_locked(),
            "ConditionVariable notified without holding its mutex"
        );

        let mut word = self.lock_waiters();
        let head = loop {
            let Some(head) = NonNull::new((word & !POPPING) as *mut Waiter) else {
                self.waiters.fetch_and(!POPPING, Ordering::Release);
                return;
            };

            // SAFETY: we are the only popper, so the node stays queued (and alive) while we read
            // its link.
            let next = unsafe { head.as_ref().next() } as usize;
            match self.waiters.compare_exchange_weak(
                word,
                next | POPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break head,
                Err(actual) => word = actual,
            }
        };
        self.waiters.fetch_and(!POPPING, Ordering::Release);

        tracing::trace!("waking one ConditionVariable waiter");
        // SAFETY: the node was detached above.
        unsafe { Waiter::notify(head) };
    }

    /// Wakes every registered waiter, most recently registered first.
    pub fn notify_all(&self) {
        debug_assert!(
            self.mutex.is_locked(),
            "ConditionVariable notified without holding its mutex"
        );

        self.lock_waiters();
        // Detaches the whole stack and clears `POPPING` in one step.
        let mut next = self.waiters.swap(0, Ordering::AcqRel) & !POPPING;

        let mut count = 0_usize;
        while let Some(node) = NonNull::new(next as *mut Waiter) {
            // SAFETY: the stack is detached; each link is read before its node is notified.
            unsafe {
                next = node.as_ref().next() as usize;
                Waiter::notify(node);
            }
            count += 1;
        }
        tracing::trace!(waiters = count, "woke all ConditionVariable waiters");
    }

    /// Releases `guard`, suspends until notified and re-acquires the mutex.
    ///
    /// The waiter is registered before the mutex is released, so a notification sent by the next
    /// holder of the mutex cannot be missed. Wake-ups can still race with other tasks taking the
    /// mutex first, so callers re-check their condition; see [`ConditionVariable::wait_until()`].
    ///
    /// # Panics
    ///
    /// Panics if `guard` does not belong to the paired mutex.
    pub async fn wait<'g>(&self, guard: AsyncMutexGuard<'g, T>) -> AsyncMutexGuard<'g, T> {
        let mutex = AsyncMutexGuard::mutex(&guard);
        assert!(
            ptr::eq(mutex, self.mutex),
            "ConditionVariable waited on with the guard of another mutex"
        );

        Sleep {
            condvar: self,
            guard: Some(guard),
            waiter: Waiter::new(),
            phase: Phase::Idle,
        }
        .await;

        mutex.lock().await
    }

    /// Waits until `condition` returns `true` for the protected data, returning with the mutex
    /// held. Returns immediately if the condition already holds.
    pub async fn wait_until<'g, F>(
        &self,
        mut guard: AsyncMutexGuard<'g, T>,
        mut condition: F,
    ) -> AsyncMutexGuard<'g, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while !condition(&mut *guard) {
            guard = self.wait(guard).await;
        }
        guard
    }

    fn push(&self, waiter: Pin<&Waiter>, cx: &Context<'_>) {
        waiter.prepare(cx);
        let node = waiter.as_node().as_ptr() as usize;
        let mut word = self.waiters.load(Ordering::Relaxed);
        loop {
            // SAFETY: the node is not published yet.
            unsafe { waiter.set_next((word & !POPPING) as *const Waiter) };
            match self.waiters.compare_exchange_weak(
                word,
                node | (word & POPPING),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Takes the `POPPING` bit, returning the list word observed when it was taken.
    fn lock_waiters(&self) -> usize {
        let mut spin = SpinWait::new();
        loop {
            let word = self.waiters.fetch_or(POPPING, Ordering::Acquire);
            if word & POPPING == 0 {
                return word | POPPING;
            }
            if !spin.spin() {
                spin.reset();
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for ConditionVariable<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiting = self.waiters.load(Ordering::Relaxed) & !POPPING != 0;
        f.debug_struct("ConditionVariable")
            .field("waiting", &waiting)
            .finish_non_exhaustive()
    }
}

/// Registers a waiter, releases the guard, and completes once notified.
#[pin_project(PinnedDrop)]
struct Sleep<'c, 'm, 'g, T: ?Sized> {
    condvar: &'c ConditionVariable<'m, T>,
    guard: Option<AsyncMutexGuard<'g, T>>,
    #[pin]
    waiter: Waiter,
    phase: Phase,
}

impl<T: ?Sized> Future for Sleep<'_, '_, '_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let waiter = this.waiter.into_ref();

        match this.phase {
            Phase::Idle => {
                this.condvar.push(waiter, cx);
                *this.phase = Phase::Queued;
                // Only unlock once registered.
                drop(this.guard.take());
            }
            Phase::Queued => {}
            Phase::Done => panic!("`Sleep` polled after completion"),
        }

        if waiter.poll_notified(cx).is_pending() {
            return Poll::Pending;
        }
        *this.phase = Phase::Done;
        Poll::Ready(())
    }
}

#[pinned_drop]
impl<T: ?Sized> PinnedDrop for Sleep<'_, '_, '_, T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.phase == Phase::Queued {
            this.waiter.into_ref().park_until_notified();
        }
    }
}
