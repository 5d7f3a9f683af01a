//! Suspension points
//!
//! Everything a task can wait on is one of three targets: a timer, another
//! job's terminal state, or an external signal. [`Suspend`] implements the
//! single registration/resume protocol over that tagged variant:
//!
//! 1. check the suspending job's liveness — if it is cancelling, resume
//!    immediately with the cancellation signal instead of waiting;
//! 2. otherwise register the continuation with the target (and with the
//!    job's cancel-notify list so cancellation interrupts the wait) and
//!    park without blocking the worker.
//!
//! Shielded jobs (non-cancellable cleanup) skip step 1 entirely.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CancelCause, TaskError, TaskResult};
use crate::job::Job;
use crate::timer::{Timer, TimerKey};

/// What a suspension point is waiting on.
pub enum WaitTarget {
    /// A one-shot timer for the given duration.
    Timer(Duration),
    /// Another job reaching a terminal state.
    JobTerminal(Arc<Job>),
    /// An external one-shot signal.
    Signal(Arc<Event>),
}

impl std::fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitTarget::Timer(d) => f.debug_tuple("Timer").field(d).finish(),
            WaitTarget::JobTerminal(job) => f.debug_tuple("JobTerminal").field(&job.id()).finish(),
            WaitTarget::Signal(_) => f.debug_tuple("Signal").finish(),
        }
    }
}

/// A one-shot external signal tasks can wait for.
///
/// `set` fires it exactly once; later `set` calls are no-ops. Waiters
/// registered before the fire are woken; waits after the fire complete
/// immediately.
pub struct Event {
    inner: Mutex<EventInner>,
}

struct EventInner {
    fired: bool,
    waiters: Vec<Waker>,
}

impl Event {
    /// Create an unfired event.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EventInner {
                fired: false,
                waiters: Vec::new(),
            }),
        })
    }

    /// Fire the event, waking every waiter.
    pub fn set(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.fired {
                return;
            }
            inner.fired = true;
            std::mem::take(&mut inner.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Whether the event has fired.
    pub fn is_set(&self) -> bool {
        self.inner.lock().fired
    }

    /// Register a waiter. Returns `false` if the event already fired.
    fn register(&self, waker: &Waker) -> bool {
        let mut inner = self.inner.lock();
        if inner.fired {
            return false;
        }
        if !inner.waiters.iter().any(|w| w.will_wake(waker)) {
            inner.waiters.push(waker.clone());
        }
        true
    }
}

/// State of an armed timer belonging to one `Suspend`.
struct ArmedTimer {
    timer: Arc<dyn Timer>,
    key: TimerKey,
    fired: Arc<Mutex<bool>>,
}

/// The suspension future: one task parked on one [`WaitTarget`].
pub struct Suspend {
    /// The suspending task's own job; liveness is checked against it.
    job: Arc<Job>,
    target: WaitTarget,
    /// Timer source, used when the target is [`WaitTarget::Timer`].
    timer: Option<Arc<dyn Timer>>,
    armed: Option<ArmedTimer>,
}

impl Suspend {
    pub(crate) fn new(job: Arc<Job>, timer: Option<Arc<dyn Timer>>, target: WaitTarget) -> Self {
        Self {
            job,
            target,
            timer,
            armed: None,
        }
    }

    fn cancellation(&self) -> TaskError {
        TaskError::Cancelled(
            self.job
                .cancel_cause()
                .unwrap_or_else(CancelCause::requested),
        )
    }
}

impl Future for Suspend {
    type Output = TaskResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let shielded = this.job.is_shielded();
        if !shielded && this.job.is_cancelled() {
            return Poll::Ready(Err(this.cancellation()));
        }

        match &this.target {
            WaitTarget::Timer(delay) => {
                if let Some(armed) = &this.armed {
                    if *armed.fired.lock() {
                        return Poll::Ready(Ok(()));
                    }
                } else {
                    let Some(timer) = this.timer.clone() else {
                        return Poll::Ready(Err(TaskError::failed(anyhow::anyhow!(
                            "no timer source available for sleep"
                        ))));
                    };
                    let fired = Arc::new(Mutex::new(false));
                    let flag = fired.clone();
                    let waker = cx.waker().clone();
                    let key = timer.after(
                        *delay,
                        Box::new(move || {
                            *flag.lock() = true;
                            waker.wake();
                        }),
                    );
                    this.armed = Some(ArmedTimer { timer, key, fired });
                }
            }
            WaitTarget::JobTerminal(target) => {
                if !target.register_terminal_waiter(cx.waker()) {
                    return Poll::Ready(Ok(()));
                }
            }
            WaitTarget::Signal(event) => {
                if !event.register(cx.waker()) {
                    return Poll::Ready(Ok(()));
                }
            }
        }

        if !shielded {
            this.job.register_cancel_waiter(cx.waker());
        }
        Poll::Pending
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        // Disarm a pending timer so an abandoned sleep cannot fire late.
        if let Some(armed) = self.armed.take() {
            if !*armed.fired.lock() {
                armed.timer.cancel(armed.key);
            }
        }
    }
}

/// Internal wait for a job's terminal state with no liveness check.
///
/// Scope drains use this: a draining scope must keep waiting for its
/// children even while it is itself being cancelled.
pub(crate) struct WaitTerminal {
    job: Arc<Job>,
}

impl WaitTerminal {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        Self { job }
    }
}

impl Future for WaitTerminal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.job.register_terminal_waiter(cx.waker()) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}
