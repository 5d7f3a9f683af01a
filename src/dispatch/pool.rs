//! Worker pool dispatcher
//!
//! Fixed set of worker threads draining one shared FIFO channel. With a
//! single worker this doubles as the confined dispatcher: one consumer on
//! a FIFO queue yields a total execution order.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Dispatch;
use crate::error::DispatcherClosed;
use crate::task::Continuation;

thread_local! {
    /// Marks runtime worker threads so the blocking bridge can detect
    /// misuse (blocking a worker starves the pool).
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a runtime worker.
pub(crate) fn on_worker_thread() -> bool {
    IS_WORKER.with(|flag| flag.get())
}

/// A dispatcher backed by a fixed number of worker threads.
pub struct WorkerPool {
    /// Sender side of the shared work queue. Dropped on shutdown so the
    /// workers drain the remaining continuations and exit.
    sender: Mutex<Option<Sender<Continuation>>>,
    /// Worker threads, joined on shutdown.
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Closed flag; `schedule` fails once set.
    closed: AtomicBool,
    /// Pool name, also the worker thread name prefix.
    name: String,
}

impl WorkerPool {
    /// Spawn a pool with the given name prefix and worker count.
    ///
    /// A count of zero falls back to the available parallelism.
    pub fn new(name: &str, num_workers: usize) -> Arc<Self> {
        let num_workers = if num_workers == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            num_workers
        };

        let (sender, receiver) = channel::unbounded::<Continuation>();
        let pool = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            closed: AtomicBool::new(false),
            name: name.to_string(),
        });

        let mut workers = pool.workers.lock();
        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || worker_loop(worker_id, receiver))
                .expect("failed to spawn dispatcher worker");
            workers.push(worker);
        }
        drop(workers);

        pool
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }
}

/// Worker thread main loop: drain the shared queue until it disconnects.
fn worker_loop(worker_id: usize, receiver: Receiver<Continuation>) {
    IS_WORKER.with(|flag| flag.set(true));
    debug!(worker_id, "dispatcher worker started");

    while let Ok(continuation) = receiver.recv() {
        continuation.run();
    }

    debug!(worker_id, "dispatcher worker stopped");
}

impl Dispatch for WorkerPool {
    fn schedule(&self, continuation: Continuation) -> Result<(), DispatcherClosed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatcherClosed);
        }
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(continuation).map_err(|_| DispatcherClosed),
            None => Err(DispatcherClosed),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.name, "dispatcher shutting down");

        // Disconnect the queue; workers finish what is already enqueued.
        self.sender.lock().take();

        let current = thread::current().id();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            // A pool can be dropped from one of its own workers (the last
            // continuation holding the pool alive). That worker is already
            // exiting; joining it would deadlock.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!(pool = %self.name, "dispatcher worker panicked");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
