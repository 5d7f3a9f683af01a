//! Structured scopes
//!
//! A [`Scope`] bundles {owner job, dispatcher, runtime services} and is the
//! only way to launch tasks: every task body receives its scope as an
//! explicit parameter, and no child can outlive the scope's job. There is
//! no ambient "current scope" — capability passing is always explicit.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::error::{CancelCause, TaskError, TaskResult};
use crate::job::{Job, JobId, ShieldGuard};
use crate::runtime::RuntimeShared;
use crate::task::{Continuation, TaskCell};
use crate::wait::{Suspend, WaitTarget, WaitTerminal};

#[cfg(test)]
mod tests;

/// Capability bundle for launching child tasks under one job.
#[derive(Clone)]
pub struct Scope {
    job: Arc<Job>,
    dispatcher: Dispatcher,
    shared: Arc<RuntimeShared>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("job", &self.job.id())
            .field("dispatcher", &self.dispatcher.name())
            .finish()
    }
}

impl Scope {
    pub(crate) fn new(
        job: Arc<Job>,
        dispatcher: Dispatcher,
        shared: Arc<RuntimeShared>,
    ) -> Self {
        Self {
            job,
            dispatcher,
            shared,
        }
    }

    /// The job owning this scope.
    #[inline]
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// The scope's job ID.
    #[inline]
    pub fn id(&self) -> JobId {
        self.job.id()
    }

    /// The dispatcher children launched from this scope run on.
    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Non-suspending liveness query (cooperative cancellation for
    /// compute-bound loops).
    #[inline]
    pub fn is_active(&self) -> bool {
        self.job.is_active()
    }

    /// Same scope job, different dispatcher for children launched through
    /// the returned handle.
    pub fn with_dispatcher(&self, dispatcher: Dispatcher) -> Scope {
        Scope {
            job: self.job.clone(),
            dispatcher,
            shared: self.shared.clone(),
        }
    }

    /// Cancel this scope's job (and transitively all descendants).
    pub fn cancel(&self) {
        self.job.cancel(CancelCause::requested());
    }

    /// Cancel with a reason string recorded as the cause.
    pub fn cancel_with_reason(&self, reason: &str) {
        self.job.cancel(CancelCause::with_reason(reason));
    }

    /// Explicitly end a scope whose lifetime is not tied to a task body
    /// (e.g. a root scope). The job drains its children and completes.
    pub fn close(&self) {
        self.job.mark_body_done();
    }

    // =========================================================================
    // Launching
    // =========================================================================

    /// Launch a child task. Returns its [`Job`] handle.
    ///
    /// The child's first instruction runs only after `launch` returns
    /// (never inline), unless the dispatcher is unconfined. If this
    /// scope's job is already draining or terminal, the body never runs
    /// and the returned job is already `Cancelled`.
    pub fn launch<F, Fut>(&self, body: F) -> Arc<Job>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let id = self.shared.job_ids.next_id();
        let child = match Job::child(&self.job, id, self.dispatcher.clone(), false) {
            Ok(child) => child,
            Err(err) => {
                debug!(parent = %self.job.id(), %err, "launch rejected");
                self.shared.stats.record_rejected();
                return Job::new_cancelled(
                    id,
                    self.dispatcher.clone(),
                    CancelCause::with_reason("launched into a closed scope"),
                );
            }
        };
        self.shared.register_job(&child);

        let body_scope = self.child_scope(&child);
        let fut = body(body_scope);
        let stats = self.shared.stats.clone();
        let job = child.clone();
        let wrapped = async move {
            let outcome = fut.await;
            stats.record_outcome(&outcome);
            job.body_finished(outcome);
        };

        self.shared.stats.record_launched();
        self.schedule_body(&child, Box::pin(wrapped));
        child
    }

    /// Launch a child task whose success value can be awaited.
    ///
    /// The deferred handle suspends its waiter until the child job is
    /// terminal, then yields the stored value or re-raises the child's
    /// cancellation cause.
    pub fn spawn<T, F, Fut>(&self, body: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let id = self.shared.job_ids.next_id();
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let child = match Job::child(&self.job, id, self.dispatcher.clone(), false) {
            Ok(child) => child,
            Err(err) => {
                debug!(parent = %self.job.id(), %err, "spawn rejected");
                self.shared.stats.record_rejected();
                let job = Job::new_cancelled(
                    id,
                    self.dispatcher.clone(),
                    CancelCause::with_reason("spawned into a closed scope"),
                );
                return Deferred { job, slot };
            }
        };
        self.shared.register_job(&child);

        let body_scope = self.child_scope(&child);
        let fut = body(body_scope);
        let stats = self.shared.stats.clone();
        let job = child.clone();
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
        self.schedule_body(&child, Box::pin(wrapped));
        Deferred { job: child, slot }
    }

    fn child_scope(&self, child: &Arc<Job>) -> Scope {
        Scope {
            job: child.clone(),
            dispatcher: self.dispatcher.clone(),
            shared: self.shared.clone(),
        }
    }

    fn schedule_body(&self, child: &Arc<Job>, future: crate::task::BoxFuture) {
        let cell = TaskCell::new(child.clone(), future);
        if let Err(err) = self.dispatcher.schedule(Continuation::new(cell)) {
            debug!(job = %child.id(), %err, "scheduling failed, cancelling job");
            child.cancel(CancelCause::with_reason("dispatcher shut down"));
            child.mark_body_done();
        }
    }

    // =========================================================================
    // Suspension points
    // =========================================================================

    /// Suspend for `delay` without blocking the worker.
    pub fn sleep(&self, delay: std::time::Duration) -> Suspend {
        Suspend::new(
            self.job.clone(),
            Some(self.shared.timer.clone()),
            WaitTarget::Timer(delay),
        )
    }

    /// Suspend until `job` reaches a terminal state.
    ///
    /// Resolves `Ok(())` whatever the target's outcome; use
    /// [`Deferred::wait`] to re-raise the target's cause. Errs only if the
    /// *waiting* job is cancelled first.
    pub fn join(&self, job: &Arc<Job>) -> Suspend {
        Suspend::new(self.job.clone(), None, WaitTarget::JobTerminal(job.clone()))
    }

    /// Suspend until the event fires.
    pub fn wait(&self, event: &Arc<crate::wait::Event>) -> Suspend {
        Suspend::new(self.job.clone(), None, WaitTarget::Signal(event.clone()))
    }

    // =========================================================================
    // Structured blocks
    // =========================================================================

    /// Run `body` in a new child scope and return only once that scope's
    /// job and every descendant is terminal.
    ///
    /// If any task in the subtree fails, the whole call fails with that
    /// cause after the subtree has been cancelled and drained.
    pub async fn nested<T, F, Fut>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let (_, result) = self.scoped_inner(None, body).await;
        result
    }

    /// Race `body` against a timer.
    ///
    /// If the timer fires first, the child scope is cancelled with a
    /// timed-out cause and that cause is re-raised here. If the body
    /// finishes first the timer is disarmed; the job state machine
    /// guarantees a late fire can never touch the terminal job.
    pub async fn with_timeout<T, F, Fut>(
        &self,
        timeout: std::time::Duration,
        body: F,
    ) -> TaskResult<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let (_, result) = self.scoped_inner(Some(timeout), body).await;
        result
    }

    /// Like [`Scope::with_timeout`], but this scope's own timeout is
    /// swallowed and reported as `None`. Failures and foreign
    /// cancellation still raise.
    pub async fn with_timeout_or_none<T, F, Fut>(
        &self,
        timeout: std::time::Duration,
        body: F,
    ) -> TaskResult<Option<T>>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let (child, result) = self.scoped_inner(Some(timeout), body).await;
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_timeout_of(child) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Shared implementation of the structured blocks: child scope, body
    /// inline, optional timeout race, full drain, outcome from the
    /// terminal state.
    async fn scoped_inner<T, F, Fut>(
        &self,
        timeout: Option<std::time::Duration>,
        body: F,
    ) -> (JobId, TaskResult<T>)
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let id = self.shared.job_ids.next_id();
        let child = match Job::child(&self.job, id, self.dispatcher.clone(), true) {
            Ok(child) => child,
            Err(_) => {
                // The enclosing scope is already draining; surface its
                // cancellation instead of running the body.
                let cause = self
                    .job
                    .cancel_cause()
                    .unwrap_or_else(CancelCause::requested);
                return (id, Err(TaskError::Cancelled(cause)));
            }
        };
        self.shared.register_job(&child);

        let timer_key = timeout.map(|after| {
            let job = child.clone();
            let stats = self.shared.stats.clone();
            self.shared.timer.after(
                after,
                Box::new(move || {
                    if job.cancel(CancelCause::timed_out(job.id(), after)) {
                        stats.record_timeout();
                    }
                }),
            )
        });

        let child_scope = self.child_scope(&child);
        let outcome = body(child_scope).await;

        if let Some(key) = timer_key {
            self.shared.timer.cancel(key);
        }

        let (unit_outcome, value) = match outcome {
            Ok(value) => (Ok(()), Some(value)),
            Err(err) => (Err(err), None),
        };
        child.body_finished(unit_outcome);

        // Drain: the block must not return while any descendant is live,
        // even if this scope is itself being cancelled.
        WaitTerminal::new(child.clone()).await;

        trace!(job = %child.id(), state = ?child.state(), "scoped block drained");

        let result = match child.state() {
            crate::job::JobState::Completed => match value {
                Some(value) => Ok(value),
                None => Err(TaskError::failed(anyhow::anyhow!(
                    "scope completed without a value"
                ))),
            },
            _ => Err(TaskError::from_terminal_cause(child.cancel_cause())),
        };
        (id, result)
    }

    /// Run cleanup that must not be interrupted by cancellation.
    ///
    /// While `body` runs, suspension points of this scope's job skip the
    /// liveness check, so even an already-cancelling job can finish its
    /// cleanup (including suspending cleanup like a final flush). Do not
    /// launch new children inside: a draining job still rejects them.
    pub async fn non_cancellable<T, F, Fut>(&self, body: F) -> TaskResult<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let _shield = ShieldGuard::new(self.job.clone());
        body(self.clone()).await
    }
}

/// Future-like handle to a task launched with [`Scope::spawn`].
pub struct Deferred<T> {
    job: Arc<Job>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Deferred<T> {
    /// The underlying job handle.
    #[inline]
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Suspend `scope`'s task until this task is terminal, then return the
    /// value or re-raise the cancellation cause.
    pub fn wait<'a>(&'a self, scope: &Scope) -> DeferredWait<'a, T> {
        DeferredWait {
            deferred: self,
            suspend: Suspend::new(
                scope.job().clone(),
                None,
                WaitTarget::JobTerminal(self.job.clone()),
            ),
        }
    }

    /// Non-suspending check: the value, if the task completed and the
    /// value has not been taken yet.
    pub fn try_value(&self) -> Option<T> {
        if self.job.state() == crate::job::JobState::Completed {
            self.slot.lock().take()
        } else {
            None
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("job", &self.job.id())
            .field("state", &self.job.state())
            .finish()
    }
}

/// Future returned by [`Deferred::wait`].
pub struct DeferredWait<'a, T> {
    deferred: &'a Deferred<T>,
    suspend: Suspend,
}

impl<T> Future for DeferredWait<'_, T> {
    type Output = TaskResult<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::task::Poll;

        let this = self.get_mut();
        match std::pin::Pin::new(&mut this.suspend).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {
                let job = &this.deferred.job;
                match job.state() {
                    crate::job::JobState::Completed => {
                        match this.deferred.slot.lock().take() {
                            Some(value) => Poll::Ready(Ok(value)),
                            None => Poll::Ready(Err(TaskError::failed(anyhow::anyhow!(
                                "deferred value already consumed"
                            )))),
                        }
                    }
                    _ => Poll::Ready(Err(TaskError::from_terminal_cause(job.cancel_cause()))),
                }
            }
        }
    }
}
