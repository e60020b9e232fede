use crate::waiter::{Phase, Waiter, Word, EMPTY, MARKED};
use pin_project::{pin_project, pinned_drop};
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

/// A mutual exclusion lock whose contended acquirers suspend their task instead of blocking a
/// thread.
///
/// The lock state is a single atomic word: unlocked, locked with no waiters, or locked with the
/// head of an intrusive stack of waiters that tasks push themselves onto. Releasing the lock with
/// waiters present hands ownership directly to the next waiter; the mutex is never observably
/// unlocked in between. Each time the stack is drained it is reversed into arrival order and
/// cached, so waiters of one contention epoch are served first-in, first-out.
///
/// Woken waiters are resumed through their task's [`Waker`](std::task::Waker) and run on whatever
/// executor polls them, not on the releasing thread.
pub struct AsyncMutex<T: ?Sized> {
    /// `EMPTY` when unlocked, `MARKED` when locked without waiters, otherwise the most recently
    /// queued waiter.
    state: AtomicUsize,
    /// Waiters already detached from `state`, oldest first. Only the lock holder touches this.
    waiters: UnsafeCell<*const Waiter>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for AsyncMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for AsyncMutex<T> {}

impl<T> AsyncMutex<T> {
    /// Create a new, unlocked [`AsyncMutex`] protecting `data`.
    pub const fn new(data: T) -> AsyncMutex<T> {
        AsyncMutex {
            state: AtomicUsize::new(EMPTY),
            waiters: UnsafeCell::new(ptr::null()),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        this.debug_assert_idle();
        // SAFETY: `this` is never used or dropped again, and the remaining fields have no drop
        // glue.
        unsafe { ptr::read(&this.data) }.into_inner()
    }
}

impl<T: ?Sized> AsyncMutex<T> {
    /// Attempts to take the lock without suspending. Succeeds only if the mutex is unlocked.
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        if self.try_acquire() {
            Some(AsyncMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquires the lock, suspending the task while it is held elsewhere. The guard releases the
    /// lock when dropped.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            acquire: self.acquire(),
        }
    }

    /// Raw counterpart of [`AsyncMutex::try_lock()`]. On success the caller owns the lock and
    /// must eventually call [`AsyncMutex::release()`].
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, MARKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Raw counterpart of [`AsyncMutex::lock()`]. Once the future completes the caller owns the
    /// lock and must eventually call [`AsyncMutex::release()`].
    pub fn acquire(&self) -> Acquire<'_, T> {
        Acquire {
            mutex: self,
            waiter: Waiter::new(),
            phase: Phase::Idle,
        }
    }

    /// Releases the lock, handing it to the oldest queued waiter if there is one.
    ///
    /// # Safety
    ///
    /// The caller must own the lock, taken with [`AsyncMutex::try_acquire()`] or
    /// [`AsyncMutex::acquire()`], and must not use the protected data afterwards.
    pub unsafe fn release(&self) {
        debug_assert_ne!(
            self.state.load(Ordering::Relaxed),
            EMPTY,
            "AsyncMutex released while not locked"
        );

        if let Some(next) = NonNull::new(*self.waiters.get() as *mut Waiter) {
            *self.waiters.get() = next.as_ref().next();
            Waiter::notify(next);
            return;
        }

        if self
            .state
            .compare_exchange(MARKED, EMPTY, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        // New waiters arrived: take the whole stack, leaving the mutex locked.
        let Word::Waiter(head) = Word::decode(self.state.swap(MARKED, Ordering::AcqRel)) else {
            unreachable!("locked AsyncMutex lost its waiter list");
        };

        let mut lifo: *const Waiter = head.as_ptr();
        let mut fifo: *const Waiter = ptr::null();
        let mut count = 0_usize;
        while let Some(node) = lifo.as_ref() {
            lifo = node.next();
            node.set_next(fifo);
            fifo = node as *const Waiter;
            count += 1;
        }
        tracing::trace!(waiters = count, "drained AsyncMutex waiters");

        let first = NonNull::new_unchecked(fifo as *mut Waiter);
        *self.waiters.get() = first.as_ref().next();
        Waiter::notify(first);
    }

    /// Returns `true` if some task currently owns the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != EMPTY
    }

    /// Returns a mutable reference to the protected data. No locking is needed since the mutex
    /// is borrowed exclusively.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Readiness check plus suspend step of an acquisition: `Ready` once the lock is owned,
    /// `Pending` once `waiter` is pushed onto the waiter stack.
    fn start_acquire(&self, waiter: Pin<&Waiter>, cx: &Context<'_>) -> Poll<()> {
        let node = Word::Waiter(waiter.as_node()).encode();
        let mut prepared = false;
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let next = match Word::decode(state) {
                Word::Empty => match self.state.compare_exchange_weak(
                    EMPTY,
                    MARKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        if prepared {
                            waiter.unprepare();
                        }
                        return Poll::Ready(());
                    }
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                },
                Word::Marked => ptr::null(),
                Word::Waiter(head) => head.as_ptr() as *const Waiter,
            };

            if !prepared {
                waiter.prepare(cx);
                prepared = true;
            }
            // SAFETY: the node is not published yet.
            unsafe { waiter.set_next(next) };

            match self
                .state
                .compare_exchange_weak(state, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    tracing::trace!("queued on contended AsyncMutex");
                    return Poll::Pending;
                }
                Err(actual) => state = actual,
            }
        }
    }

    fn debug_assert_idle(&self) {
        // Cached waiters imply the mutex is still locked, so report them first.
        debug_assert!(
            unsafe { (*self.waiters.get()).is_null() },
            "AsyncMutex destroyed with pending waiters"
        );
        debug_assert_eq!(
            self.state.load(Ordering::Relaxed),
            EMPTY,
            "AsyncMutex destroyed while locked"
        );
    }
}

impl<T: ?Sized> Drop for AsyncMutex<T> {
    fn drop(&mut self) {
        self.debug_assert_idle();
    }
}

impl<T: Default> Default for AsyncMutex<T> {
    fn default() -> AsyncMutex<T> {
        AsyncMutex::new(T::default())
    }
}

impl<T> From<T> for AsyncMutex<T> {
    fn from(data: T) -> AsyncMutex<T> {
        AsyncMutex::new(data)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for AsyncMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AsyncMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// Future returned by [`AsyncMutex::acquire()`].
///
/// Dropping it while queued blocks the dropping thread until the lock is handed to it, and then
/// passes the lock on.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Acquire<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
    #[pin]
    waiter: Waiter,
    phase: Phase,
}

impl<T: ?Sized> Future for Acquire<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let waiter = this.waiter.into_ref();

        match this.phase {
            Phase::Idle => {
                if this.mutex.start_acquire(waiter, cx).is_pending() {
                    *this.phase = Phase::Queued;
                    return Poll::Pending;
                }
            }
            Phase::Queued => {
                if waiter.poll_notified(cx).is_pending() {
                    return Poll::Pending;
                }
            }
            Phase::Done => panic!("`Acquire` polled after completion"),
        }

        *this.phase = Phase::Done;
        Poll::Ready(())
    }
}

#[pinned_drop]
impl<T: ?Sized> PinnedDrop for Acquire<'_, T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.phase == Phase::Queued {
            this.waiter.into_ref().park_until_notified();
            // SAFETY: being notified transferred the lock to us.
            unsafe { this.mutex.release() };
        }
    }
}

/// Future returned by [`AsyncMutex::lock()`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Lock<'a, T: ?Sized> {
    #[pin]
    acquire: Acquire<'a, T>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = AsyncMutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<AsyncMutexGuard<'a, T>> {
        let mut acquire = self.project().acquire;
        let mutex = acquire.mutex;
        match acquire.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(AsyncMutexGuard { mutex }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Scoped ownership of an [`AsyncMutex`]. The lock is released exactly once, when the guard is
/// dropped.
#[must_use = "if unused the AsyncMutex will immediately unlock"]
pub struct AsyncMutexGuard<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
}

unsafe impl<T: ?Sized + Send> Send for AsyncMutexGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for AsyncMutexGuard<'_, T> {}

impl<'a, T: ?Sized> AsyncMutexGuard<'a, T> {
    /// Returns the mutex this guard holds.
    pub fn mutex(guard: &AsyncMutexGuard<'a, T>) -> &'a AsyncMutex<T> {
        guard.mutex
    }
}

impl<T: ?Sized> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.release() };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for AsyncMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for AsyncMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
