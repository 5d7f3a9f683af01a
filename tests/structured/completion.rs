//! Completion-order tests
//!
//! A job reaches `Completed` only after every descendant is terminal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tianxing::{CancelCause, Job, JobState, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig { num_workers: 4 })
}

/// Parent job becomes `Completed` only once all children are terminal.
#[test]
fn test_parent_completes_after_all_children() {
    let rt = runtime();
    let children: Arc<Mutex<Vec<Arc<Job>>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = children.clone();

    let parent = rt
        .block_on(move |scope| async move {
            let parent = scope.launch({
                let children = children.clone();
                move |s| async move {
                    for i in 0..4u64 {
                        let job = s.launch(move |inner| async move {
                            inner
                                .sleep(Duration::from_millis(10 + 10 * i))
                                .await?;
                            Ok(())
                        });
                        children.lock().push(job);
                    }
                    // Parent body returns immediately; the job must still
                    // drain all four children first.
                    Ok(())
                }
            });
            scope.join(&parent).await?;
            Ok(parent)
        })
        .expect("block_on");

    assert_eq!(parent.state(), JobState::Completed);
    for child in collected.lock().iter() {
        assert!(
            child.state().is_terminal(),
            "child {} not terminal when parent completed",
            child.id()
        );
    }
}

/// Cancelling P: both children observe cancellation at their next
/// suspension point, and join(P) returns only after both are `Cancelled`.
#[test]
fn test_cancel_parent_joins_after_both_children() {
    let rt = runtime();
    let children: Arc<Mutex<Vec<Arc<Job>>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = children.clone();
    let started = Instant::now();

    let parent = rt
        .block_on(move |scope| async move {
            let parent = scope.launch({
                let children = children.clone();
                move |s| async move {
                    for _ in 0..2 {
                        let job = s.launch(|inner| async move {
                            inner.sleep(Duration::from_secs(30)).await?;
                            Ok(())
                        });
                        children.lock().push(job);
                    }
                    s.sleep(Duration::from_secs(30)).await?;
                    Ok(())
                }
            });

            scope.sleep(Duration::from_millis(50)).await?;
            parent.cancel(CancelCause::requested());
            scope.join(&parent).await?;
            Ok(parent)
        })
        .expect("block_on");

    // join(P) returned: P and both children must be Cancelled, long
    // before their 30s sleeps.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(parent.state(), JobState::Cancelled);
    let children = collected.lock();
    assert_eq!(children.len(), 2);
    for child in children.iter() {
        assert_eq!(child.state(), JobState::Cancelled);
    }
}

/// The root job is terminal by the time block_on returns.
#[test]
fn test_root_job_completes_after_block_on() {
    let rt = runtime();
    let root = rt
        .block_on(|scope| async move { Ok(scope.job().clone()) })
        .expect("block_on");
    assert_eq!(root.state(), JobState::Completed);
}
