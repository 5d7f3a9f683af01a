//! TianXing (天行) Coroutine Runtime
//!
//! A structured-concurrency runtime: many lightweight, cooperatively
//! suspending tasks organized into a strict parent/child job tree, with
//! cancellation, timeouts, and dispatcher-based thread affinity.
//!
//! # Example
//!
//! ```no_run
//! use tianxing::{Runtime, TaskResult};
//!
//! fn main() -> TaskResult<()> {
//!     let rt = Runtime::new();
//!     let sum = rt.block_on(|scope| async move {
//!         let a = scope.spawn(|s| async move {
//!             s.sleep(std::time::Duration::from_millis(10)).await?;
//!             Ok(1)
//!         });
//!         let b = scope.spawn(|_| async move { Ok(2) });
//!         Ok(a.wait(&scope).await? + b.wait(&scope).await?)
//!     })?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```
//!
//! Cancellation is cooperative: it is delivered at suspension points
//! (`sleep`, `join`, `wait`, `Deferred::wait`) or observed through the
//! non-suspending [`Scope::is_active`] liveness query. A body that does
//! neither is not cancellable.

#![doc(html_root_url = "https://docs.rs/tianxing")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod dispatch;
pub mod error;
pub mod job;
pub mod runtime;
pub mod scope;
pub mod task;
pub mod timer;
pub mod wait;

// Utility modules
pub mod util;

// Re-exports
pub use dispatch::{Dispatch, Dispatcher, WorkerPool};
pub use error::{CancelCause, DispatcherClosed, SpawnError, TaskError, TaskResult};
pub use job::{Job, JobId, JobState};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats};
pub use scope::{Deferred, Scope};
pub use task::Continuation;
pub use timer::{ThreadTimer, Timer, TimerKey};
pub use wait::{Event, Suspend, WaitTarget};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "TianXing (天行)";
