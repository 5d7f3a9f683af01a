//! Task cells and the poll driver
//!
//! Each launched task is an explicit continuation-passing state machine: a
//! pinned future plus a saved "resume here" record. The driver pulls ready
//! continuations off dispatcher queues and polls them; a waker re-enqueues
//! the continuation on the task's own dispatcher when the awaited resource
//! fires. No native stack switching is involved.
//!
//! Ownership: a parked task is kept alive precisely by the waker clones
//! registered with whatever it waits on (a timer, a job's waiter list, an
//! event). Once those fire or are cleared, the cell and its future are
//! reclaimed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::CancelCause;
use crate::job::{Job, JobId};

/// Type-erased task body. The typed result is written to a shared slot by
/// the wrapper future; the driver only sees `()`.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Driver-side scheduling state of one task.
///
/// Distinct from [`crate::job::JobState`]: this tracks where the
/// continuation is (queued, being polled, parked), not the job lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    /// On a dispatcher queue, waiting for a worker.
    Queued = 0,
    /// A worker is polling the future right now.
    Polling = 1,
    /// Parked at a suspension point, waiting for a wake.
    Parked = 2,
    /// A wake arrived while polling; re-enqueue instead of parking.
    Notified = 3,
    /// The future ran to completion and was dropped.
    Done = 4,
}

impl PollState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => PollState::Queued,
            1 => PollState::Polling,
            2 => PollState::Parked,
            3 => PollState::Notified,
            _ => PollState::Done,
        }
    }
}

/// One task's continuation storage, shared between the driver, its waker
/// clones, and the dispatcher queue it travels through.
pub(crate) struct TaskCell {
    job: Arc<Job>,
    future: Mutex<Option<BoxFuture>>,
    poll_state: AtomicU8,
}

impl TaskCell {
    /// Create a cell in the `Queued` state, ready to be scheduled.
    pub(crate) fn new(job: Arc<Job>, future: BoxFuture) -> Arc<Self> {
        Arc::new(Self {
            job,
            future: Mutex::new(Some(future)),
            poll_state: AtomicU8::new(PollState::Queued as u8),
        })
    }

    fn state(&self) -> PollState {
        PollState::from_u8(self.poll_state.load(Ordering::SeqCst))
    }
}

/// An opaque resumption point: the remainder of a task body plus the job
/// it belongs to. Owned exclusively by whatever it is registered against
/// until run exactly once, then discarded.
pub struct Continuation {
    cell: Arc<TaskCell>,
}

impl Continuation {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    /// The job this continuation belongs to.
    pub fn job_id(&self) -> JobId {
        self.cell.job.id()
    }

    /// Drive the task one step: poll until it completes or parks again.
    pub fn run(self) {
        drive(&self.cell);
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("job", &self.cell.job.id())
            .field("state", &self.cell.state())
            .finish()
    }
}

/// Poll one task. Handles completion, re-parking, body panics, and the
/// lost-wake race where a waker fires while the future is mid-poll.
fn drive(cell: &Arc<TaskCell>) {
    if cell.state() == PollState::Done {
        return;
    }
    cell.poll_state
        .store(PollState::Polling as u8, Ordering::SeqCst);

    // The cell is its own waker; clones of this waker are what keep a
    // parked task alive.
    let waker = Waker::from(cell.clone());
    let mut cx = Context::from_waker(&waker);

    enum Outcome {
        Completed,
        Pending,
        Panicked(String),
    }

    let outcome = {
        let mut slot = cell.future.lock();
        let Some(future) = slot.as_mut() else {
            cell.poll_state
                .store(PollState::Done as u8, Ordering::SeqCst);
            return;
        };
        // Contain body panics: a panicking task must become a failed job,
        // not a dead worker thread.
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            future.as_mut().poll(&mut cx)
        })) {
            Ok(Poll::Ready(())) => {
                // Drop the state machine now that it has completed.
                *slot = None;
                Outcome::Completed
            }
            Ok(Poll::Pending) => Outcome::Pending,
            Err(payload) => {
                *slot = None;
                Outcome::Panicked(panic_message(payload))
            }
        }
    };

    match outcome {
        Outcome::Completed => {
            cell.poll_state
                .store(PollState::Done as u8, Ordering::SeqCst);
        }
        Outcome::Panicked(message) => {
            warn!(job = %cell.job.id(), %message, "task body panicked");
            cell.poll_state
                .store(PollState::Done as u8, Ordering::SeqCst);
            cell.job.body_finished(Err(crate::error::TaskError::failed(
                anyhow::anyhow!("task panicked: {}", message),
            )));
        }
        Outcome::Pending => {
            // Park, unless a wake arrived during the poll — then
            // re-enqueue so the wake is not lost.
            let parked = cell.poll_state.compare_exchange(
                PollState::Polling as u8,
                PollState::Parked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if parked.is_err() {
                cell.poll_state
                    .store(PollState::Queued as u8, Ordering::SeqCst);
                reschedule(cell);
            }
        }
    }
}

/// Best-effort extraction of a panic payload message.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Re-enqueue a cell on its job's dispatcher.
fn reschedule(cell: &Arc<TaskCell>) {
    let dispatcher = cell.job.dispatcher().clone();
    if let Err(closed) = dispatcher.schedule(Continuation::new(cell.clone())) {
        // The task can never be polled again; force the job terminal so
        // the tree is not wedged.
        warn!(job = %cell.job.id(), dispatcher = dispatcher.name(), %closed,
            "dropping continuation: dispatcher is shut down");
        cell.future.lock().take();
        cell.poll_state
            .store(PollState::Done as u8, Ordering::SeqCst);
        cell.job
            .cancel(CancelCause::with_reason("dispatcher shut down"));
        cell.job.mark_body_done();
    }
}

impl Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            match self.state() {
                PollState::Parked => {
                    if self
                        .poll_state
                        .compare_exchange(
                            PollState::Parked as u8,
                            PollState::Queued as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        reschedule(self);
                        return;
                    }
                }
                PollState::Polling => {
                    if self
                        .poll_state
                        .compare_exchange(
                            PollState::Polling as u8,
                            PollState::Notified as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                // Already queued, already notified, or done: nothing to do.
                PollState::Queued | PollState::Notified | PollState::Done => return,
            }
        }
    }
}
