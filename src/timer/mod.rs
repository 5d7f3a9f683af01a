//! One-shot timers
//!
//! The runtime needs exactly one thing from a timer: `after(duration)`
//! fires a callback once, and an unfired timer can be disarmed. The
//! [`Timer`] trait is the seam for host environments that already have a
//! timer wheel; [`ThreadTimer`] is the built-in implementation, a single
//! thread sleeping on a deadline heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Handle to a single armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(pub u64);

/// Callback fired when a timer elapses. Runs on the timer's own thread.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timer interface, suppliable by the host environment.
pub trait Timer: Send + Sync + 'static {
    /// Arm a timer that fires `callback` once after `delay`.
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerKey;

    /// Disarm a timer. Returns `true` if it had not fired yet; `false`
    /// means the callback already ran or is about to.
    fn cancel(&self, key: TimerKey) -> bool;
}

/// Entry on the deadline heap. Ordered so the heap pops earliest first.
struct TimerEntry {
    deadline: Instant,
    key: TimerKey,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.0.cmp(&self.key.0))
    }
}

/// Armed timers: the deadline heap plus the callbacks still alive.
///
/// Disarming removes the callback and leaves a stale heap entry, which the
/// timer thread skips when it pops.
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, TimerCallback>,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
    next_key: AtomicU64,
    shutdown: AtomicBool,
}

/// Built-in timer: one dedicated thread and a deadline heap.
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadTimer {
    /// Spawn the timer thread.
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
            wakeup: Condvar::new(),
            next_key: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("tianxing-timer".to_string())
            .spawn(move || timer_loop(&loop_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ThreadTimer {
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerKey {
        let key = TimerKey(self.shared.next_key.fetch_add(1, Ordering::SeqCst));
        let deadline = Instant::now() + delay;
        {
            let mut queue = self.shared.queue.lock();
            queue.heap.push(TimerEntry { deadline, key });
            queue.callbacks.insert(key.0, callback);
        }
        trace!(?key, ?delay, "timer armed");
        self.shared.wakeup.notify_one();
        key
    }

    fn cancel(&self, key: TimerKey) -> bool {
        let disarmed = self.shared.queue.lock().callbacks.remove(&key.0).is_some();
        if disarmed {
            trace!(?key, "timer disarmed");
        }
        disarmed
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Timer thread main loop: run due callbacks, sleep until the next
/// deadline (or until a new timer is armed).
fn timer_loop(shared: &Arc<TimerShared>) {
    loop {
        let mut due: Vec<TimerCallback> = Vec::new();
        {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();

                while let Some(entry) = queue.heap.peek() {
                    if entry.deadline > now {
                        break;
                    }
                    let key = queue.heap.pop().map(|e| e.key);
                    if let Some(key) = key {
                        // Stale entries (disarmed timers) have no callback.
                        if let Some(callback) = queue.callbacks.remove(&key.0) {
                            due.push(callback);
                        }
                    }
                }
                if !due.is_empty() {
                    break;
                }

                match queue.heap.peek().map(|e| e.deadline) {
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut queue, deadline);
                    }
                    None => {
                        shared.wakeup.wait(&mut queue);
                    }
                }
            }
        }

        // Callbacks run outside the lock; they may arm new timers.
        for callback in due {
            callback();
        }
    }
}
