use crate::*;
use futures::executor::block_on;
use futures::task::{waker, ArcWake};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

/// Waker that counts how often it was woken, for polling futures by hand.
struct WakeCount(AtomicUsize);

impl ArcWake for WakeCount {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_waker() -> (Arc<WakeCount>, Waker) {
    let count = Arc::new(WakeCount(AtomicUsize::new(0)));
    let waker = waker(count.clone());
    (count, waker)
}

fn wakes(count: &WakeCount) -> usize {
    count.0.load(Ordering::SeqCst)
}

fn poll<F: Future + ?Sized>(future: Pin<&mut F>, waker: &Waker) -> Poll<F::Output> {
    future.poll(&mut Context::from_waker(waker))
}

#[test]
fn event_set_before_wait() {
    let event = AsyncEvent::new(EventState::Unset);
    event.set();
    block_on(event.wait());
    assert!(event.is_set());
}

#[test]
fn event_wakes_waiter_once() {
    let event = AsyncEvent::new(EventState::Unset);
    let (count, waker) = counting_waker();

    let mut wait = Box::pin(event.wait());
    assert!(poll(wait.as_mut(), &waker).is_pending());
    assert!(poll(wait.as_mut(), &waker).is_pending());
    assert_eq!(wakes(&count), 0);

    event.set();
    assert_eq!(wakes(&count), 1);
    // The signal went to the waiter.
    assert!(!event.is_set());
    assert!(poll(wait.as_mut(), &waker).is_ready());

    event.set();
    assert_eq!(wakes(&count), 1);
    assert!(event.is_set());
}

#[test]
#[should_panic(expected = "already has a waiter")]
fn event_rejects_second_waiter() {
    let event = AsyncEvent::new(EventState::Unset);
    let (_count, waker) = counting_waker();

    let mut first = Box::pin(event.wait());
    let mut second = Box::pin(event.wait());
    assert!(poll(first.as_mut(), &waker).is_pending());
    let _ = poll(second.as_mut(), &waker);
}

#[test]
fn event_dropped_waiter_withdraws() {
    let event = AsyncEvent::new(EventState::Unset);
    let (count, waker) = counting_waker();

    let mut wait = Box::pin(event.wait());
    assert!(poll(wait.as_mut(), &waker).is_pending());
    drop(wait);

    // A new waiter may register now that the first one is gone.
    let mut wait = Box::pin(event.wait());
    assert!(poll(wait.as_mut(), &waker).is_pending());
    event.set();
    assert_eq!(wakes(&count), 1);
    assert!(poll(wait.as_mut(), &waker).is_ready());
}

#[test]
fn event_signal_survives_dropped_waiter() {
    let event = AsyncEvent::new(EventState::Unset);
    let (_count, waker) = counting_waker();

    let mut wait = Box::pin(event.wait());
    assert!(poll(wait.as_mut(), &waker).is_pending());
    event.set();
    // Woken but never observed the signal.
    drop(wait);
    assert!(event.is_set());
}

#[test]
fn event_suspend_and_resume() {
    // This is the main event we're trying to wait on
    let event1 = Arc::new(AsyncEvent::new(EventState::Unset));
    // And this event is used to tell the main thread that the worker thread is ready for it
    let event2 = Arc::new(AsyncEvent::new(EventState::Unset));
    let thread = {
        let event1 = event1.clone();
        let event2 = event2.clone();
        thread::spawn(move || {
            assert!(!event1.is_set());
            // Signal that we are about to wait for event1
            event2.set();
            block_on(event1.wait());
        })
    };
    block_on(event2.wait());
    thread::sleep(Duration::from_millis(10));
    event1.set();
    thread.join().unwrap();
}

#[test]
fn event_concurrent_sets() {
    const THREAD_COUNT: usize = 8;
    let event = AsyncEvent::new(EventState::Unset);

    thread::scope(|s| {
        let waiter = s.spawn(|| block_on(event.wait()));
        for _ in 0..THREAD_COUNT {
            s.spawn(|| event.set());
        }
        waiter.join().unwrap();
    });
}

#[test]
fn mutex_excludes_across_threads() {
    const THREAD_COUNT: usize = 4;
    const INCREMENTS: usize = 100_000;

    // Deliberately not an atomic: the mutex alone must order the increments.
    let counter = AsyncMutex::new(0_usize);
    thread::scope(|s| {
        for _ in 0..THREAD_COUNT {
            s.spawn(|| {
                block_on(async {
                    for _ in 0..INCREMENTS {
                        let mut guard = counter.lock().await;
                        *guard += 1;
                    }
                })
            });
        }
    });
    assert!(!counter.is_locked());
    assert_eq!(counter.into_inner(), THREAD_COUNT * INCREMENTS);
}

/// Counter that relies entirely on an external lock for synchronization.
struct Unsynchronized(UnsafeCell<usize>);

unsafe impl Sync for Unsynchronized {}

impl Unsynchronized {
    /// # Safety
    ///
    /// The caller must hold the lock guarding this counter.
    unsafe fn increment(&self) {
        *self.0.get() += 1;
    }
}

#[test]
fn mutex_raw_acquire_across_threads() {
    const THREAD_COUNT: usize = 4;
    const INCREMENTS: usize = 10_000;

    let lock = AsyncMutex::new(());
    let counter = Unsynchronized(UnsafeCell::new(0));
    thread::scope(|s| {
        for _ in 0..THREAD_COUNT {
            s.spawn(|| {
                block_on(async {
                    for i in 0..INCREMENTS {
                        if i % 2 == 0 || !lock.try_acquire() {
                            lock.acquire().await;
                        }
                        unsafe {
                            counter.increment();
                            lock.release();
                        }
                    }
                })
            });
        }
    });
    assert!(!lock.is_locked());
    assert_eq!(counter.0.into_inner(), THREAD_COUNT * INCREMENTS);
}

#[test]
fn mutex_serves_waiters_in_arrival_order() {
    let mutex = AsyncMutex::new(Vec::new());
    let (count, waker) = counting_waker();
    let holder = mutex.try_lock().unwrap();

    let mut w1 = Box::pin(mutex.lock());
    let mut w2 = Box::pin(mutex.lock());
    let mut w3 = Box::pin(mutex.lock());
    assert!(poll(w1.as_mut(), &waker).is_pending());
    assert!(poll(w2.as_mut(), &waker).is_pending());
    assert!(poll(w3.as_mut(), &waker).is_pending());

    drop(holder);
    assert_eq!(wakes(&count), 1);
    assert!(poll(w3.as_mut(), &waker).is_pending());
    assert!(poll(w2.as_mut(), &waker).is_pending());
    let Poll::Ready(mut guard) = poll(w1.as_mut(), &waker) else {
        panic!("first waiter was not handed the lock");
    };
    guard.push(1);
    drop(guard);

    assert_eq!(wakes(&count), 2);
    assert!(poll(w3.as_mut(), &waker).is_pending());
    let Poll::Ready(mut guard) = poll(w2.as_mut(), &waker) else {
        panic!("second waiter was not handed the lock");
    };
    guard.push(2);
    drop(guard);

    assert_eq!(wakes(&count), 3);
    let Poll::Ready(mut guard) = poll(w3.as_mut(), &waker) else {
        panic!("third waiter was not handed the lock");
    };
    guard.push(3);
    drop(guard);

    assert!(!mutex.is_locked());
    drop((w1, w2, w3));
    assert_eq!(mutex.into_inner(), vec![1, 2, 3]);
}

#[test]
fn mutex_serves_cached_waiters_before_new_arrivals() {
    let mutex = AsyncMutex::new(Vec::new());
    let (w1_count, w1_waker) = counting_waker();
    let (w2_count, w2_waker) = counting_waker();
    let (w3_count, w3_waker) = counting_waker();
    let holder = mutex.try_lock().unwrap();

    let mut w1 = Box::pin(mutex.lock());
    let mut w2 = Box::pin(mutex.lock());
    assert!(poll(w1.as_mut(), &w1_waker).is_pending());
    assert!(poll(w2.as_mut(), &w2_waker).is_pending());

    // Drains [w1, w2]: w1 takes the lock, w2 stays cached.
    drop(holder);
    assert_eq!(wakes(&w1_count), 1);
    let Poll::Ready(mut guard) = poll(w1.as_mut(), &w1_waker) else {
        panic!("first waiter was not handed the lock");
    };

    // w3 arrives after the drain, onto the atomic stack.
    let mut w3 = Box::pin(mutex.lock());
    assert!(poll(w3.as_mut(), &w3_waker).is_pending());
    guard.push(1);
    drop(guard);

    assert_eq!(wakes(&w2_count), 1);
    assert_eq!(wakes(&w3_count), 0);
    assert!(poll(w3.as_mut(), &w3_waker).is_pending());
    let Poll::Ready(mut guard) = poll(w2.as_mut(), &w2_waker) else {
        panic!("cached waiter was not served first");
    };
    guard.push(2);
    drop(guard);

    assert_eq!(wakes(&w3_count), 1);
    let Poll::Ready(mut guard) = poll(w3.as_mut(), &w3_waker) else {
        panic!("late waiter was not handed the lock");
    };
    guard.push(3);
    drop(guard);

    drop((w1, w2, w3));
    assert_eq!(mutex.into_inner(), vec![1, 2, 3]);
}

#[test]
fn mutex_handoff_keeps_lock_held() {
    let mutex = AsyncMutex::new(());
    let (_count, waker) = counting_waker();
    let holder = mutex.try_lock().unwrap();

    let mut waiter = Box::pin(mutex.lock());
    assert!(poll(waiter.as_mut(), &waker).is_pending());
    drop(holder);

    // Ownership already belongs to the woken waiter.
    assert!(mutex.is_locked());
    assert!(mutex.try_lock().is_none());
    let Poll::Ready(guard) = poll(waiter.as_mut(), &waker) else {
        panic!("waiter was not handed the lock");
    };
    drop(guard);
    assert!(mutex.try_lock().is_some());
}

#[test]
fn mutex_dropped_waiter_passes_lock_on() {
    let mutex = AsyncMutex::new(0);
    let (count, waker) = counting_waker();
    let holder = mutex.try_lock().unwrap();

    let mut dropped = Box::pin(mutex.lock());
    let mut next = Box::pin(mutex.lock());
    assert!(poll(dropped.as_mut(), &waker).is_pending());
    assert!(poll(next.as_mut(), &waker).is_pending());

    thread::scope(|s| {
        s.spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(holder);
        });
        // Parks until `holder` hands the lock over, then releases it to `next`.
        drop(dropped);
    });

    assert_eq!(wakes(&count), 2);
    assert!(mutex.is_locked());
    let Poll::Ready(mut guard) = poll(next.as_mut(), &waker) else {
        panic!("lock was not passed on");
    };
    *guard += 1;
    drop(guard);
    drop(next);
    assert_eq!(mutex.into_inner(), 1);
}

#[test]
fn condvar_producer_consumer() {
    const MESSAGE_COUNT: usize = 100;

    let queue = AsyncMutex::new(VecDeque::<String>::new());
    let ready = ConditionVariable::new(&queue);

    let received = thread::scope(|s| {
        let consumer = s.spawn(|| {
            block_on(async {
                let mut received = Vec::new();
                while received.len() < MESSAGE_COUNT {
                    let mut guard = ready.wait_until(queue.lock().await, |q| !q.is_empty()).await;
                    assert!(queue.is_locked());
                    received.extend(guard.drain(..));
                }
                received
            })
        });

        s.spawn(|| {
            block_on(async {
                for i in 0..MESSAGE_COUNT {
                    let mut guard = queue.lock().await;
                    guard.push_back(format!("Message-{i}"));
                    ready.notify_one();
                }
            })
        });

        consumer.join().unwrap()
    });

    let expected: Vec<String> = (0..MESSAGE_COUNT).map(|i| format!("Message-{i}")).collect();
    assert_eq!(received, expected);
    assert!(!queue.is_locked());
}

#[test]
fn condvar_wait_until_satisfied_does_not_suspend() {
    let flag = AsyncMutex::new(true);
    let changed = ConditionVariable::new(&flag);
    let (count, waker) = counting_waker();

    let mut wait = Box::pin(async { *changed.wait_until(flag.lock().await, |f| *f).await });
    assert_eq!(poll(wait.as_mut(), &waker), Poll::Ready(true));
    assert_eq!(wakes(&count), 0);
}

#[test]
fn condvar_wait_releases_mutex() {
    let flag = AsyncMutex::new(false);
    let changed = ConditionVariable::new(&flag);
    let (count, waker) = counting_waker();

    let mut wait = Box::pin(changed.wait_until(flag.try_lock().unwrap(), |f| *f));
    assert!(poll(wait.as_mut(), &waker).is_pending());
    assert!(!flag.is_locked());

    let mut guard = flag.try_lock().unwrap();
    *guard = true;
    changed.notify_one();
    assert_eq!(wakes(&count), 1);

    // Woken, but the mutex is still ours.
    assert!(poll(wait.as_mut(), &waker).is_pending());
    drop(guard);
    assert_eq!(wakes(&count), 2);

    let Poll::Ready(guard) = poll(wait.as_mut(), &waker) else {
        panic!("waiter did not re-acquire the mutex");
    };
    assert!(*guard);
}

#[test]
fn condvar_notify_one_wakes_latest_waiter() {
    let mutex = AsyncMutex::new(());
    let changed = ConditionVariable::new(&mutex);
    let (first_count, first_waker) = counting_waker();
    let (second_count, second_waker) = counting_waker();

    let mut first = Box::pin(changed.wait(mutex.try_lock().unwrap()));
    assert!(poll(first.as_mut(), &first_waker).is_pending());
    let mut second = Box::pin(changed.wait(mutex.try_lock().unwrap()));
    assert!(poll(second.as_mut(), &second_waker).is_pending());

    let guard = mutex.try_lock().unwrap();
    changed.notify_one();
    assert_eq!(wakes(&first_count), 0);
    assert_eq!(wakes(&second_count), 1);

    changed.notify_one();
    assert_eq!(wakes(&first_count), 1);

    // Nothing left to wake.
    changed.notify_one();
    drop(guard);

    // Both re-acquire the now free mutex without suspending.
    assert!(poll(second.as_mut(), &second_waker).is_ready());
    assert!(poll(first.as_mut(), &first_waker).is_ready());
}

#[test]
fn condvar_notify_all_wakes_everyone() {
    const WAITER_COUNT: usize = 5;

    let mutex = AsyncMutex::new(0_usize);
    let changed = ConditionVariable::new(&mutex);
    let (count, waker) = counting_waker();

    let mut waits = Vec::new();
    for _ in 0..WAITER_COUNT {
        // Each wait releases the mutex once registered, so the next one can take it.
        let mut wait = Box::pin(changed.wait(mutex.try_lock().unwrap()));
        assert!(poll(wait.as_mut(), &waker).is_pending());
        waits.push(wait);
    }
    assert!(!mutex.is_locked());

    let guard = mutex.try_lock().unwrap();
    changed.notify_all();
    assert_eq!(wakes(&count), WAITER_COUNT);
    drop(guard);

    // Each waiter re-acquires the mutex in turn.
    for wait in waits.iter_mut() {
        let mut guard = loop {
            if let Poll::Ready(guard) = poll(wait.as_mut(), &waker) {
                break guard;
            }
        };
        *guard += 1;
    }
    drop(waits);
    assert_eq!(mutex.into_inner(), WAITER_COUNT);
}

#[test]
#[should_panic(expected = "guard of another mutex")]
fn condvar_rejects_foreign_guard() {
    let paired = AsyncMutex::new(());
    let other = AsyncMutex::new(());
    let changed = ConditionVariable::new(&paired);
    let _guard = block_on(changed.wait(other.try_lock().unwrap()));
}

#[test]
fn condvar_wakes_threads_waiting_on_flag() {
    const THREAD_COUNT: usize = 4;

    let released = AsyncMutex::new(false);
    let changed = ConditionVariable::new(&released);
    let started = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREAD_COUNT {
            s.spawn(|| {
                block_on(async {
                    let guard = released.lock().await;
                    started.fetch_add(1, Ordering::SeqCst);
                    let guard = changed.wait_until(guard, |released| *released).await;
                    assert!(*guard);
                })
            });
        }

        while started.load(Ordering::SeqCst) < THREAD_COUNT {
            thread::yield_now();
        }
        block_on(async {
            let mut guard = released.lock().await;
            *guard = true;
            changed.notify_all();
        });
    });
}
