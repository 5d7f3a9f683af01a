//! Job tree and lifecycle state machine
//!
//! A [`Job`] is the cancellation/completion handle for one task and a node
//! in the strict parent/child ownership tree. Parents hold owning references
//! to their children in insertion order; children keep a weak back-reference
//! to the parent used only for completion callbacks and failure escalation,
//! so the tree never forms reference cycles.
//!
//! State machine:
//!
//! ```text
//! Active ──► Completing ──► Completed
//!   │            │
//!   ▼            ▼
//! Cancelling ──► Cancelled
//! ```
//!
//! Transitions only move forward. `Completing` and `Cancelling` are draining
//! states: no new children are accepted, and the terminal state is reached
//! only once every child is terminal. Cancellation flows top-down through
//! the tree; completion flows bottom-up.

use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::error::{CancelCause, SpawnError};


/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

/// Generator for unique job IDs.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
    next_id: AtomicU64,
}

impl JobIdGenerator {
    /// Create a new generator starting at zero.
    #[inline]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
        }
    }

    /// Generate the next job ID.
    #[inline]
    pub fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Running normally; accepts new children.
    Active,
    /// Body finished normally; draining remaining children.
    Completing,
    /// Cancellation requested; draining children before `Cancelled`.
    Cancelling,
    /// Terminal: finished normally, all children terminal first.
    Completed,
    /// Terminal: cancelled (explicitly, by propagation, or by failure).
    Cancelled,
}

impl JobState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobState::Active,
            1 => JobState::Completing,
            2 => JobState::Cancelling,
            3 => JobState::Completed,
            _ => JobState::Cancelled,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            JobState::Active => 0,
            JobState::Completing => 1,
            JobState::Cancelling => 2,
            JobState::Completed => 3,
            JobState::Cancelled => 4,
        }
    }

    /// Terminal states never transition again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    /// Draining states no longer accept children.
    #[inline]
    pub fn is_draining(&self) -> bool {
        matches!(self, JobState::Completing | JobState::Cancelling)
    }

    /// Whether the job is on the cancellation track.
    #[inline]
    pub fn is_cancelling(&self) -> bool {
        matches!(self, JobState::Cancelling | JobState::Cancelled)
    }
}

/// Mutable job internals, guarded by one mutex.
struct JobInner {
    /// Weak back-reference; traversal only, never ownership.
    parent: Weak<Job>,
    /// Live children in insertion order (deterministic cancel iteration).
    children: SmallVec<[Arc<Job>; 4]>,
    /// Cancellation cause; immutable once set.
    cause: Option<CancelCause>,
    /// Whether the task body has finished (or the scope was closed).
    body_done: bool,
    /// Failure escalation stops at boundary jobs; the failure is instead
    /// re-raised to whoever waits on the boundary.
    boundary: bool,
    /// Wakers to fire when this job reaches a terminal state.
    terminal_waiters: Vec<Waker>,
    /// Wakers parked at suspension points, to interrupt on cancel.
    cancel_waiters: Vec<Waker>,
}

/// Cancellation/completion handle and tree node for one task.
pub struct Job {
    /// Unique job ID.
    id: JobId,
    /// Dispatcher the owning task resumes on. Referenced, never owned.
    dispatcher: Dispatcher,
    /// Current state (atomic for lock-free liveness queries).
    state: AtomicU8,
    /// Non-cancellable depth; suspension points skip the liveness check
    /// while it is non-zero.
    shield: AtomicUsize,
    /// Everything else, behind one lock.
    inner: Mutex<JobInner>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dispatcher", &self.dispatcher.name())
            .finish()
    }
}

impl Job {
    /// Create a root job with no parent.
    pub(crate) fn new_root(id: JobId, dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            id,
            dispatcher,
            state: AtomicU8::new(JobState::Active.as_u8()),
            shield: AtomicUsize::new(0),
            inner: Mutex::new(JobInner {
                parent: Weak::new(),
                children: SmallVec::new(),
                cause: None,
                body_done: false,
                boundary: true,
                terminal_waiters: Vec::new(),
                cancel_waiters: Vec::new(),
            }),
        })
    }

    /// Create a child job attached under `parent`.
    ///
    /// Fails synchronously if the parent is draining or terminal.
    pub(crate) fn child(
        parent: &Arc<Job>,
        id: JobId,
        dispatcher: Dispatcher,
        boundary: bool,
    ) -> Result<Arc<Self>, SpawnError> {
        let child = Arc::new(Self {
            id,
            dispatcher,
            state: AtomicU8::new(JobState::Active.as_u8()),
            shield: AtomicUsize::new(0),
            inner: Mutex::new(JobInner {
                parent: Arc::downgrade(parent),
                children: SmallVec::new(),
                cause: None,
                body_done: false,
                boundary,
                terminal_waiters: Vec::new(),
                cancel_waiters: Vec::new(),
            }),
        });

        {
            let mut inner = parent.inner.lock();
            if parent.state() != JobState::Active {
                return Err(SpawnError::ParentDraining(parent.id));
            }
            inner.children.push(child.clone());
        }
        trace!(parent = %parent.id, child = %id, "attached child job");

        Ok(child)
    }

    /// Create a stillborn job, already `Cancelled` with the given cause.
    ///
    /// Used when a launch is rejected by a draining parent: the caller
    /// still gets a handle, but the body never runs.
    pub(crate) fn new_cancelled(
        id: JobId,
        dispatcher: Dispatcher,
        cause: CancelCause,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            dispatcher,
            state: AtomicU8::new(JobState::Cancelled.as_u8()),
            shield: AtomicUsize::new(0),
            inner: Mutex::new(JobInner {
                parent: Weak::new(),
                children: SmallVec::new(),
                cause: Some(cause),
                body_done: true,
                boundary: false,
                terminal_waiters: Vec::new(),
                cancel_waiters: Vec::new(),
            }),
        })
    }

    /// Get the job ID.
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The dispatcher this job's task resumes on.
    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Non-suspending liveness query for compute-bound loops.
    ///
    /// `true` while the job has not been cancelled. Cancellation is
    /// cooperative: a body that neither suspends nor polls this is not
    /// cancellable.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state(), JobState::Active | JobState::Completing)
    }

    /// Whether this job is terminal.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether cancellation has been requested (or completed).
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelling()
    }

    /// The cancellation cause, if one has been recorded.
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.inner.lock().cause.clone()
    }

    /// Number of live (non-terminal) children.
    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Request cancellation of this job and, transitively, every live
    /// descendant (depth-first, children before self).
    ///
    /// Returns immediately; the owning task observes cancellation at its
    /// next suspension point or liveness check. Returns `false` if the job
    /// was already cancelling or terminal (the recorded cause is immutable).
    pub fn cancel(self: &Arc<Self>, cause: CancelCause) -> bool {
        let (children, waiters) = {
            let mut inner = self.inner.lock();
            let state = self.state();
            if state.is_terminal() || state == JobState::Cancelling {
                return false;
            }
            if inner.cause.is_none() {
                inner.cause = Some(cause.clone());
            }
            self.state
                .store(JobState::Cancelling.as_u8(), Ordering::SeqCst);
            let children: SmallVec<[Arc<Job>; 4]> = inner.children.clone();
            let waiters = std::mem::take(&mut inner.cancel_waiters);
            (children, waiters)
        };

        debug!(job = %self.id, %cause, "job cancelling");

        // Children first: each recursion drains its own subtree before
        // this job can become terminal.
        for child in &children {
            child.cancel(cause.clone());
        }

        // Interrupt suspension points parked on this job.
        for waker in waiters {
            waker.wake();
        }

        self.try_complete();
        true
    }

    /// Record the task body's outcome and run the resulting transition.
    pub(crate) fn body_finished(self: &Arc<Self>, outcome: Result<(), crate::error::TaskError>) {
        use crate::error::TaskError;

        enum Step {
            Complete,
            Cancel(CancelCause),
            Fail(Arc<anyhow::Error>),
        }

        let step = {
            let mut inner = self.inner.lock();
            inner.body_done = true;
            let state = self.state();
            match outcome {
                Ok(()) => {
                    if state == JobState::Active {
                        self.state
                            .store(JobState::Completing.as_u8(), Ordering::SeqCst);
                    }
                    Step::Complete
                }
                Err(TaskError::Cancelled(cause)) => {
                    if state.is_cancelling() {
                        // Expected unwind of an already-cancelling job;
                        // swallowed, never re-raised.
                        Step::Complete
                    } else {
                        // A cancellation signal from elsewhere (e.g. an
                        // awaited job) reached the top of this body:
                        // treat as cancellation of self.
                        Step::Cancel(cause)
                    }
                }
                Err(TaskError::Failed(error)) => Step::Fail(error),
            }
        };

        match step {
            Step::Complete => self.try_complete(),
            Step::Cancel(cause) => {
                self.cancel(cause);
            }
            Step::Fail(error) => self.fail(error),
        }
    }

    /// Escalate a body failure: cancel self with the error as cause, then
    /// notify the parent, which cancels all siblings and keeps escalating
    /// until a scope boundary (or the root) absorbs it.
    fn fail(self: &Arc<Self>, error: Arc<anyhow::Error>) {
        debug!(job = %self.id, %error, "task body failed");
        let cause = CancelCause::Failed { error };
        self.cancel(cause.clone());

        let (parent, boundary) = {
            let inner = self.inner.lock();
            (inner.parent.upgrade(), inner.boundary)
        };
        if !boundary {
            if let Some(parent) = parent {
                parent.child_failed(cause);
            }
        }
    }

    /// A child failed: cancel this job (and thereby the failing child's
    /// siblings) and continue escalating unless this is a boundary.
    fn child_failed(self: &Arc<Self>, cause: CancelCause) {
        let changed = self.cancel(cause.clone());
        if !changed {
            return;
        }
        let (parent, boundary) = {
            let inner = self.inner.lock();
            (inner.parent.upgrade(), inner.boundary)
        };
        if !boundary {
            if let Some(parent) = parent {
                parent.child_failed(cause);
            }
        }
    }

    /// Called by a child that reached a terminal state.
    fn child_terminal(self: &Arc<Self>, child: JobId) {
        {
            let mut inner = self.inner.lock();
            inner.children.retain(|c| c.id != child);
        }
        self.try_complete();
    }

    /// Promote to a terminal state if the body is done and every child is
    /// terminal. The single lock makes this the "first writer wins" point:
    /// exactly one terminal state is ever recorded.
    fn try_complete(self: &Arc<Self>) {
        let (terminal, waiters, parent) = {
            let mut inner = self.inner.lock();
            let state = self.state();
            if state.is_terminal() || !inner.body_done || !inner.children.is_empty() {
                return;
            }
            let terminal = if state == JobState::Cancelling {
                JobState::Cancelled
            } else {
                JobState::Completed
            };
            self.state.store(terminal.as_u8(), Ordering::SeqCst);
            let waiters = std::mem::take(&mut inner.terminal_waiters);
            inner.cancel_waiters.clear();
            (terminal, waiters, inner.parent.upgrade())
        };

        debug!(job = %self.id, state = ?terminal, "job reached terminal state");

        for waker in waiters {
            waker.wake();
        }
        if let Some(parent) = parent {
            parent.child_terminal(self.id);
        }
    }

    /// Mark the body as done without a task outcome. Used by scopes whose
    /// lifetime is ended explicitly rather than by a returning body.
    pub(crate) fn mark_body_done(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.body_done = true;
            if self.state() == JobState::Active {
                self.state
                    .store(JobState::Completing.as_u8(), Ordering::SeqCst);
            }
        }
        self.try_complete();
    }

    /// Register a waker to fire once this job is terminal.
    ///
    /// Returns `false` (without registering) if the job is already
    /// terminal, so the caller can complete immediately.
    pub(crate) fn register_terminal_waiter(&self, waker: &Waker) -> bool {
        let mut inner = self.inner.lock();
        if self.state().is_terminal() {
            return false;
        }
        if !inner.terminal_waiters.iter().any(|w| w.will_wake(waker)) {
            inner.terminal_waiters.push(waker.clone());
        }
        true
    }

    /// Register a waker parked at a suspension point, to be woken when
    /// this job starts cancelling.
    pub(crate) fn register_cancel_waiter(&self, waker: &Waker) {
        {
            let mut inner = self.inner.lock();
            if !self.state().is_cancelling() {
                if !inner.cancel_waiters.iter().any(|w| w.will_wake(waker)) {
                    inner.cancel_waiters.push(waker.clone());
                }
                return;
            }
        }
        // Cancel already in flight; wake immediately (outside the lock)
        // rather than park.
        waker.wake_by_ref();
    }

    /// Whether suspension points currently skip the liveness check.
    #[inline]
    pub(crate) fn is_shielded(&self) -> bool {
        self.shield.load(Ordering::SeqCst) > 0
    }
}

/// RAII guard for the non-cancellable cleanup mode.
///
/// While alive, suspension points of the guarded job skip the liveness
/// check, so cleanup cannot be interrupted by the very cancellation that
/// triggered it.
pub(crate) struct ShieldGuard {
    job: Arc<Job>,
}

impl ShieldGuard {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        job.shield.fetch_add(1, Ordering::SeqCst);
        Self { job }
    }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        self.job.shield.fetch_sub(1, Ordering::SeqCst);
    }
}
