//! This example dispatches work from the main thread to a small pool of worker threads, each
//! driving its own task. Workers wait on a [`ConditionVariable`] for the shared queue to fill, and
//! the last worker to shut down signals an [`AsyncEvent`] that the main thread awaits.
//!
//! [`ConditionVariable`]: rsasync::ConditionVariable
//! [`AsyncEvent`]: rsasync::AsyncEvent

use futures::executor::block_on;
use rsasync::{AsyncEvent, AsyncMutex, ConditionVariable, EventState};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
enum ThreadMessage {
    /// Hands off a value to a worker thread for processing
    Input(u32),
    /// Tells one worker to exit
    Shutdown,
}

const THREAD_COUNT: usize = 3;

static QUEUE: AsyncMutex<VecDeque<ThreadMessage>> = AsyncMutex::new(VecDeque::new());
static QUEUED: ConditionVariable<'static, VecDeque<ThreadMessage>> =
    ConditionVariable::new(&QUEUE);
static RUNNING: AsyncMutex<usize> = AsyncMutex::new(THREAD_COUNT);
static DRAINED: AsyncEvent = AsyncEvent::new(EventState::Unset);

async fn worker(thread_idx: usize) {
    loop {
        // The condition is checked with the mutex held, and the mutex is released while the
        // task is suspended.
        let mut queue = QUEUED.wait_until(QUEUE.lock().await, |q| !q.is_empty()).await;
        let message = queue.pop_front().expect("woken with an empty queue");
        // Let other workers at the queue while this one processes its message.
        drop(queue);

        match message {
            ThreadMessage::Input(value) => eprintln!("Thread {thread_idx} handling value {value}"),
            ThreadMessage::Shutdown => break,
        }
    }

    let mut running = RUNNING.lock().await;
    *running -= 1;
    if *running == 0 {
        DRAINED.set();
    }
}

pub fn main() {
    let mut threads = Vec::with_capacity(THREAD_COUNT);
    for thread_idx in 0..THREAD_COUNT {
        threads.push(std::thread::spawn(move || block_on(worker(thread_idx))));
    }

    block_on(async {
        // Dispatch each value exactly once to exactly one worker.
        for value in [4, 8, 15, 16, 23, 42] {
            let mut queue = QUEUE.lock().await;
            queue.push_back(ThreadMessage::Input(value));
            QUEUED.notify_one();
        }

        let mut queue = QUEUE.lock().await;
        queue.extend([ThreadMessage::Shutdown; THREAD_COUNT]);
        QUEUED.notify_all();
        drop(queue);

        // Wait for the thread pool to drain
        DRAINED.wait().await;
    });

    for jh in threads {
        jh.join().expect("Worker thread panicked!");
    }
    eprintln!("All work completed - exiting!")
}
