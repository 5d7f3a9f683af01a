//! Dispatchers: assigning ready continuations to execution contexts
//!
//! A dispatcher is a policy object plus (usually) a work queue. Jobs
//! reference dispatchers, they never own them. Three policies ship with the
//! runtime:
//!
//! - [`Dispatcher::pooled`] — fixed-size shared worker pool. FIFO per
//!   worker, no ordering guarantee across workers.
//! - [`Dispatcher::confined`] — exactly one worker; total FIFO order for
//!   everything scheduled on it. Use when a task must observe sequential
//!   semantics on shared state.
//! - [`Dispatcher::unconfined`] — no queue at all. The first leg of a task
//!   runs synchronously on the caller; each later resumption runs on
//!   whatever thread fires the wake. Advanced; easy to misuse.
//!
//! External collaborators may supply their own policy through [`Dispatch`].

pub mod pool;

use std::sync::Arc;

use crate::error::DispatcherClosed;
use crate::task::Continuation;

pub use pool::WorkerPool;


/// Scheduling policy interface.
///
/// `schedule` must guarantee eventual execution of the continuation unless
/// the dispatcher has been shut down, in which case it fails with
/// [`DispatcherClosed`]. Worker-pool internals are left to the
/// implementation: a thread pool, an event loop, or no queue at all.
pub trait Dispatch: Send + Sync + 'static {
    /// Enqueue a continuation for execution.
    fn schedule(&self, continuation: Continuation) -> Result<(), DispatcherClosed>;

    /// Stop accepting work and release workers. Idempotent.
    fn shutdown(&self);

    /// Whether `schedule` would fail.
    fn is_closed(&self) -> bool;

    /// Diagnostic name, used in logs and thread names.
    fn name(&self) -> &str;
}

/// Shared handle to a dispatcher. Cheap to clone; many jobs reference the
/// same underlying policy object.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<dyn Dispatch>,
}

impl Dispatcher {
    /// Dispatcher backed by a fixed-size shared worker pool.
    pub fn pooled(num_workers: usize) -> Self {
        Self {
            inner: WorkerPool::new("tianxing-worker", num_workers),
        }
    }

    /// Dispatcher confined to a single worker thread (total FIFO order).
    pub fn confined() -> Self {
        Self {
            inner: WorkerPool::new("tianxing-confined", 1),
        }
    }

    /// Dispatcher without a queue: runs continuations inline on whichever
    /// thread schedules them.
    pub fn unconfined() -> Self {
        Self {
            inner: Arc::new(Unconfined),
        }
    }

    /// Wrap a caller-supplied policy object.
    pub fn custom(inner: Arc<dyn Dispatch>) -> Self {
        Self { inner }
    }

    /// Enqueue a continuation.
    #[inline]
    pub fn schedule(&self, continuation: Continuation) -> Result<(), DispatcherClosed> {
        self.inner.schedule(continuation)
    }

    /// Shut the underlying policy down.
    #[inline]
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Whether the dispatcher has been shut down.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Diagnostic name.
    #[inline]
    pub fn name(&self) -> &str {
        self.inner.name()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The queue-less dispatcher.
///
/// `schedule` executes the continuation before returning, on the calling
/// thread. Resumption therefore happens wherever the awaited resource
/// fires its wake (a timer thread, a completing job's worker). Never
/// introduces a queue of its own.
struct Unconfined;

impl Dispatch for Unconfined {
    fn schedule(&self, continuation: Continuation) -> Result<(), DispatcherClosed> {
        continuation.run();
        Ok(())
    }

    fn shutdown(&self) {}

    fn is_closed(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "unconfined"
    }
}
