//! Runtime errors and cancellation causes
//!
//! The taxonomy distinguishes `Cancelled` (expected, cooperative control
//! flow) from `Failed` (an unexpected error raised by a task body). Only
//! failures escalate through the job tree; cancellation is absorbed by the
//! job machinery and surfaces again solely through `await`/`join`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;

/// Result type for task bodies and suspension primitives.
pub type TaskResult<T> = Result<T, TaskError>;

/// Why a job was cancelled.
///
/// A cause is recorded exactly once per job and is immutable afterwards.
/// Causes are cheap to clone so they can propagate through arbitrarily
/// deep job trees.
#[derive(Debug, Clone)]
pub enum CancelCause {
    /// Explicit cancellation request, optionally with a reason.
    Requested {
        /// Human-readable reason supplied by the caller.
        reason: Option<Arc<str>>,
    },
    /// A timeout controller cancelled the job.
    TimedOut {
        /// The job the timeout was armed for.
        job: JobId,
        /// The configured deadline.
        after: Duration,
    },
    /// A task body raised an error; the error became the cause.
    Failed {
        /// The originating error.
        error: Arc<anyhow::Error>,
    },
}

impl CancelCause {
    /// Plain cancellation request without a reason.
    #[inline]
    pub fn requested() -> Self {
        CancelCause::Requested { reason: None }
    }

    /// Cancellation request carrying a reason string.
    #[inline]
    pub fn with_reason(reason: impl Into<Arc<str>>) -> Self {
        CancelCause::Requested {
            reason: Some(reason.into()),
        }
    }

    /// Timeout cause owned by the given job.
    #[inline]
    pub fn timed_out(job: JobId, after: Duration) -> Self {
        CancelCause::TimedOut { job, after }
    }

    /// Failure cause wrapping a body error.
    #[inline]
    pub fn failed(error: anyhow::Error) -> Self {
        CancelCause::Failed {
            error: Arc::new(error),
        }
    }

    /// Check whether this cause is the timeout armed for `job`.
    #[inline]
    pub fn is_timeout_of(&self, job: JobId) -> bool {
        matches!(self, CancelCause::TimedOut { job: owner, .. } if *owner == job)
    }

    /// Check whether this cause stems from a body failure.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, CancelCause::Failed { .. })
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Requested { reason: Some(r) } => write!(f, "cancelled: {}", r),
            CancelCause::Requested { reason: None } => write!(f, "cancelled"),
            CancelCause::TimedOut { job, after } => {
                write!(f, "timed out after {:?} ({})", after, job)
            }
            CancelCause::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Error raised out of a task body or suspension point.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was cancelled. Expected control flow, never logged as a
    /// failure; reaching the top of a body it is absorbed and recorded as
    /// the job's cancellation cause.
    #[error("task cancelled: {0}")]
    Cancelled(CancelCause),

    /// The task body raised an error. Escalates: cancels the failing job,
    /// then the parent cancels all siblings, and so on upward.
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    /// Wrap an arbitrary error as a task failure.
    #[inline]
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        TaskError::Failed(Arc::new(error.into()))
    }

    /// Cancellation carrying the given cause.
    #[inline]
    pub fn cancelled(cause: CancelCause) -> Self {
        TaskError::Cancelled(cause)
    }

    /// Whether this is cooperative cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    /// Whether this is a timeout raised by the controller armed for `job`.
    #[inline]
    pub fn is_timeout_of(&self, job: JobId) -> bool {
        matches!(self, TaskError::Cancelled(cause) if cause.is_timeout_of(job))
    }

    /// Re-raise a terminal job's cause to a waiter.
    ///
    /// A failure cause re-raises the original error; everything else
    /// surfaces as the structured cancelled-task condition.
    pub(crate) fn from_terminal_cause(cause: Option<CancelCause>) -> Self {
        match cause {
            Some(CancelCause::Failed { error }) => TaskError::Failed(error),
            Some(other) => TaskError::Cancelled(other),
            None => TaskError::Cancelled(CancelCause::requested()),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(error))
    }
}

/// Error returned when a child could not be attached to a parent job.
#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    /// The parent is draining or terminal and no longer accepts children.
    #[error("parent {0} is no longer accepting children")]
    ParentDraining(JobId),

    /// The target dispatcher was shut down.
    #[error(transparent)]
    DispatcherClosed(#[from] DispatcherClosed),
}

/// The dispatcher's worker pool has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatcher is shut down")]
pub struct DispatcherClosed;
