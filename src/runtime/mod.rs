//! Runtime façade
//!
//! [`Runtime`] owns the shared infrastructure — the default worker pool,
//! the timer, the global job registry and statistics — and provides the
//! blocking bridge ([`Runtime::block_on`]) that enters the task system
//! from ordinary synchronous code.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::dispatch::pool::{on_worker_thread, WorkerPool};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{TaskError, TaskResult};
use crate::job::{Job, JobId, JobIdGenerator};
use crate::scope::Scope;
use crate::task::{Continuation, TaskCell};
use crate::timer::{ThreadTimer, Timer};

#[cfg(test)]
mod tests;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of workers in the default dispatcher pool. Zero means the
    /// available parallelism.
    pub num_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_workers: num_cpus,
        }
    }
}

/// Runtime statistics.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Tasks launched (including spawned deferreds).
    pub tasks_launched: AtomicUsize,
    /// Task bodies that returned normally.
    pub tasks_completed: AtomicUsize,
    /// Task bodies that unwound with a cancellation signal.
    pub tasks_cancelled: AtomicUsize,
    /// Task bodies that raised a failure.
    pub tasks_failed: AtomicUsize,
    /// Timeout controllers whose timer won the race.
    pub timeouts_fired: AtomicUsize,
    /// Launches rejected because the parent was draining.
    pub launches_rejected: AtomicUsize,
}

impl RuntimeStats {
    /// Record a launched task.
    #[inline]
    pub fn record_launched(&self) {
        self.tasks_launched.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a rejected launch.
    #[inline]
    pub fn record_rejected(&self) {
        self.launches_rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a fired timeout.
    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts_fired.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a task body outcome.
    pub fn record_outcome(&self, outcome: &TaskResult<()>) {
        match outcome {
            Ok(()) => self.tasks_completed.fetch_add(1, Ordering::SeqCst),
            Err(TaskError::Cancelled(_)) => self.tasks_cancelled.fetch_add(1, Ordering::SeqCst),
            Err(TaskError::Failed(_)) => self.tasks_failed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// Shared services handed to every scope.
pub(crate) struct RuntimeShared {
    pub(crate) job_ids: JobIdGenerator,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) stats: Arc<RuntimeStats>,
    /// Global job registry: every live job by ID, insertion-ordered.
    /// Holds weak references only; entries are purged lazily.
    registry: RwLock<IndexMap<JobId, Weak<Job>>>,
}

impl RuntimeShared {
    pub(crate) fn register_job(&self, job: &Arc<Job>) {
        self.registry
            .write()
            .insert(job.id(), Arc::downgrade(job));
    }
}

/// The coroutine runtime: scheduler infrastructure plus the entry bridge.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    pool: Arc<WorkerPool>,
    default_dispatcher: Dispatcher,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.pool.num_workers())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with a custom configuration and the built-in
    /// thread timer.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_timer_source(config, Arc::new(ThreadTimer::new()))
    }

    /// Create a runtime with a host-supplied timer implementation.
    pub fn with_timer_source(config: RuntimeConfig, timer: Arc<dyn Timer>) -> Self {
        let pool = WorkerPool::new("tianxing-worker", config.num_workers);
        let default_dispatcher = Dispatcher::custom(pool.clone());
        let shared = Arc::new(RuntimeShared {
            job_ids: JobIdGenerator::new(),
            timer,
            stats: Arc::new(RuntimeStats::default()),
            registry: RwLock::new(IndexMap::new()),
        });
        debug!(workers = pool.num_workers(), "runtime started");
        Self {
            shared,
            pool,
            default_dispatcher,
        }
    }

    /// The dispatcher backed by the runtime's shared worker pool.
    #[inline]
    pub fn default_dispatcher(&self) -> Dispatcher {
        self.default_dispatcher.clone()
    }

    /// Runtime statistics.
    #[inline]
    pub fn stats(&self) -> &Arc<RuntimeStats> {
        &self.shared.stats
    }

    /// IDs of jobs that are still alive, purging dead registry entries.
    pub fn live_jobs(&self) -> Vec<JobId> {
        let mut registry = self.shared.registry.write();
        registry.retain(|_, job| job.upgrade().is_some());
        registry.keys().copied().collect()
    }

    /// The blocking bridge: run `body` as a root task and occupy the
    /// calling thread until the root job's subtree has fully drained.
    ///
    /// Returns the body's value, or re-raises the root cause if the tree
    /// was cancelled or failed.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a runtime worker thread; blocking a
    /// worker on a child tree risks starving the pool.
    pub fn block_on<T, F, Fut>(&self, body: F) -> TaskResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut,
        Fut: std::future::Future<Output = TaskResult<T>> + Send + 'static,
    {
        assert!(
            !on_worker_thread(),
            "Runtime::block_on called from inside a runtime worker thread; \
             use a suspension point instead"
        );

        let root = Job::new_root(
            self.shared.job_ids.next_id(),
            self.default_dispatcher.clone(),
        );
        self.shared.register_job(&root);
        let scope = Scope::new(
            root.clone(),
            self.default_dispatcher.clone(),
            self.shared.clone(),
        );

        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let fut = body(scope);
        let stats = self.shared.stats.clone();
        let job = root.clone();
        let value_slot = slot.clone();
        let wrapped = async move {
            let outcome = match fut.await {
                Ok(value) => {
                    *value_slot.lock() = Some(value);
                    Ok(())
                }
                Err(err) => Err(err),
            };
            stats.record_outcome(&outcome);
            job.body_finished(outcome);
        };
        self.shared.stats.record_launched();

        let cell = TaskCell::new(root.clone(), Box::pin(wrapped));
        if let Err(err) = self.default_dispatcher.schedule(Continuation::new(cell)) {
            return Err(TaskError::failed(anyhow::anyhow!(err)));
        }

        // Park the calling thread until the root job is terminal. This is
        // the one deliberately blocking operation in the runtime.
        let waker = Waker::from(Arc::new(ThreadUnparker {
            thread: thread::current(),
        }));
        while root.register_terminal_waiter(&waker) {
            thread::park();
        }

        match root.state() {
            crate::job::JobState::Completed => match slot.lock().take() {
                Some(value) => Ok(value),
                None => Err(TaskError::failed(anyhow::anyhow!(
                    "root task completed without a value"
                ))),
            },
            _ => Err(TaskError::from_terminal_cause(root.cancel_cause())),
        }
    }

    /// Shut the default worker pool down, draining already-queued work.
    /// Further launches fail with `DispatcherClosed`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Waker that unparks the thread blocked in [`Runtime::block_on`].
struct ThreadUnparker {
    thread: Thread,
}

impl Wake for ThreadUnparker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}
