//! `rsasync` provides lock-free coordination primitives for asynchronous tasks: a single-consumer
//! [`AsyncEvent`], an [`AsyncMutex`] whose contended acquirers suspend instead of blocking a
//! thread, and a [`ConditionVariable`] layered on that mutex.
//!
//! None of the primitives own an executor. A task that has to wait links a waiter node, stored
//! inside the pinned future it is awaiting, into the primitive's atomic state word and returns
//! `Poll::Pending`. Whoever later calls [`AsyncEvent::set()`], releases the mutex, or notifies the
//! condition variable pops that node, hands off to it and wakes the task's `Waker`; the task then
//! resumes on whichever executor polls it.
//!
//! Misuse (awaiting an event from two tasks at once, releasing an unlocked mutex, notifying a
//! condition variable without holding its mutex) is a contract violation reported by assertions,
//! not a recoverable error.
//!
//! Pending futures from this crate are not meant to be cancelled. Dropping one while it is queued
//! blocks the dropping thread (parked with `parking_lot_core`) until the primitive hands off to it.
//! [`EventWait`] is the exception: it withdraws its registration without blocking unless
//! [`AsyncEvent::set()`] already claimed it.
//!
//! ```
//! use rsasync::{AsyncMutex, ConditionVariable};
//! use futures::executor::block_on;
//!
//! let queue = AsyncMutex::new(Vec::new());
//! let ready = ConditionVariable::new(&queue);
//!
//! std::thread::scope(|s| {
//!     s.spawn(|| block_on(async {
//!         let mut guard = queue.lock().await;
//!         guard.push("hello");
//!         ready.notify_one();
//!     }));
//!
//!     block_on(async {
//!         let guard = ready.wait_until(queue.lock().await, |q| !q.is_empty()).await;
//!         assert_eq!(*guard, ["hello"]);
//!     });
//! });
//! ```

mod condvar;
mod event;
mod mutex;
mod waiter;

pub use condvar::ConditionVariable;
pub use event::{AsyncEvent, EventState, EventWait};
pub use mutex::{Acquire, AsyncMutex, AsyncMutexGuard, Lock};

#[cfg(test)]
mod tests;
