//! Scope 单元测试
//!
//! 测试 launch/spawn、结构化块、超时竞争和不可取消清理

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::error::{CancelCause, TaskError};
use crate::job::JobState;
use crate::runtime::{Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig { num_workers: 2 })
}

mod launch_tests {
    use super::*;

    #[test]
    fn test_parent_code_runs_before_child_body() {
        let rt = runtime();
        let confined = Dispatcher::confined();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();

        // Parent and child share one confined worker: the child is queued
        // behind the running parent, so everything the parent does before
        // its next suspension point happens before the child's body.
        rt.block_on(move |scope| async move {
            let parent = scope.with_dispatcher(confined).launch({
                let order = order.clone();
                move |s| async move {
                    let job = s.launch({
                        let order = order.clone();
                        move |_| async move {
                            order.lock().push("child");
                            Ok(())
                        }
                    });
                    order.lock().push("parent");
                    s.join(&job).await?;
                    Ok(())
                }
            });
            scope.join(&parent).await?;
            Ok(())
        })
        .expect("block_on");

        assert_eq!(&*seen.lock(), &["parent", "child"]);
    }

    #[test]
    fn test_launch_into_closed_scope_returns_cancelled_job() {
        let rt = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        rt.block_on(move |scope| async move {
            scope.cancel();
            let job = scope.launch(move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(job.state(), JobState::Cancelled);
            Err::<(), _>(TaskError::Cancelled(CancelCause::requested()))
        })
        .expect_err("scope was cancelled");

        assert!(!ran.load(Ordering::SeqCst), "stillborn body must not run");
    }

    #[test]
    fn test_spawn_round_trip() {
        let rt = runtime();
        let result = rt
            .block_on(|scope| async move {
                let deferred = scope.spawn(|_| async move { Ok(21 * 2) });
                deferred.wait(&scope).await
            })
            .expect("block_on");
        assert_eq!(result, 42);
    }

    #[test]
    fn test_deferred_try_value_after_completion() {
        let rt = runtime();
        rt.block_on(|scope| async move {
            let deferred = scope.spawn(|_| async move { Ok("done") });
            scope.join(deferred.job()).await?;
            assert_eq!(deferred.try_value(), Some("done"));
            // Value is taken exactly once.
            assert_eq!(deferred.try_value(), None);
            Ok(())
        })
        .expect("block_on");
    }

    #[test]
    fn test_await_cancelled_task_reraises() {
        let rt = runtime();
        let err = rt
            .block_on(|scope| async move {
                let deferred = scope.spawn(|s| async move {
                    s.sleep(Duration::from_secs(10)).await?;
                    Ok(1)
                });
                deferred.job().cancel(CancelCause::with_reason("not needed"));
                deferred.wait(&scope).await
            })
            .expect_err("await must re-raise the cancellation");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_with_dispatcher_confined_children() {
        let rt = runtime();
        let confined = Dispatcher::confined();
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();

        rt.block_on(move |scope| async move {
            let confined_scope = scope.with_dispatcher(confined);
            let jobs: Vec<_> = (0..8)
                .map(|i| {
                    let order = order.clone();
                    confined_scope.launch(move |_| async move {
                        order.lock().push(i);
                        Ok(())
                    })
                })
                .collect();
            for job in &jobs {
                scope.join(job).await?;
            }
            Ok(())
        })
        .expect("block_on");

        // One worker, FIFO queue: launch order is execution order.
        assert_eq!(&*seen.lock(), &(0..8).collect::<Vec<_>>());
    }
}

mod nested_tests {
    use super::*;

    #[test]
    fn test_nested_returns_body_value() {
        let rt = runtime();
        let value = rt
            .block_on(|scope| async move {
                scope.nested(|s| async move { Ok(s.id().inner()) }).await
            })
            .expect("block_on");
        // The nested scope got its own job.
        assert!(value > 0);
    }

    #[test]
    fn test_nested_waits_for_all_descendants() {
        let rt = runtime();
        let done = Arc::new(AtomicUsize::new(0));
        let seen = done.clone();

        rt.block_on(move |scope| async move {
            scope
                .nested(|s| async move {
                    for _ in 0..3 {
                        let done = done.clone();
                        s.launch(move |inner| async move {
                            inner.sleep(Duration::from_millis(20)).await?;
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                    // Return immediately; the block must still drain.
                    Ok(())
                })
                .await
        })
        .expect("block_on");

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_nested_reraises_child_failure() {
        let rt = runtime();
        let err = rt
            .block_on(|scope| async move {
                scope
                    .nested(|s| async move {
                        s.launch(|_| async move { Err(TaskError::failed(anyhow::anyhow!("kaput"))) });
                        s.sleep(Duration::from_secs(10)).await?;
                        Ok(())
                    })
                    .await
            })
            .expect_err("failure must surface");
        match err {
            TaskError::Failed(e) => assert!(e.to_string().contains("kaput")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}

mod timeout_tests {
    use super::*;

    #[test]
    fn test_body_first_returns_value() {
        let rt = runtime();
        let value = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout(Duration::from_secs(5), |s| async move {
                        s.sleep(Duration::from_millis(10)).await?;
                        Ok("fast")
                    })
                    .await
            })
            .expect("block_on");
        assert_eq!(value, "fast");
    }

    #[test]
    fn test_timer_first_raises_timeout() {
        let rt = runtime();
        let err = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout(Duration::from_millis(20), |s| async move {
                        s.sleep(Duration::from_secs(10)).await?;
                        Ok(())
                    })
                    .await
            })
            .expect_err("timeout must raise");
        match err {
            TaskError::Cancelled(CancelCause::TimedOut { after, .. }) => {
                assert_eq!(after, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_or_none_swallows_own_timeout() {
        let rt = runtime();
        let value = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout_or_none(Duration::from_millis(20), |s| async move {
                        s.sleep(Duration::from_secs(10)).await?;
                        Ok(7)
                    })
                    .await
            })
            .expect("or_none never raises its own timeout");
        assert_eq!(value, None);
    }

    #[test]
    fn test_or_none_returns_value_when_body_wins() {
        let rt = runtime();
        let value = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout_or_none(Duration::from_secs(5), |_| async move { Ok(7) })
                    .await
            })
            .expect("block_on");
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_or_none_does_not_swallow_failure() {
        let rt = runtime();
        let err = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout_or_none(Duration::from_secs(5), |_| async move {
                        Err::<(), _>(TaskError::failed(anyhow::anyhow!("real failure")))
                    })
                    .await
            })
            .expect_err("failures pass through or_none");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_nested_timeout_propagates_through_outer_or_none() {
        let rt = runtime();
        // The inner with_timeout raises its own timeout; the outer or_none
        // must NOT swallow it (it is not the outer scope's timeout).
        let err = rt
            .block_on(|scope| async move {
                scope
                    .with_timeout_or_none(Duration::from_secs(5), |s| async move {
                        s.with_timeout(Duration::from_millis(10), |inner| async move {
                            inner.sleep(Duration::from_secs(10)).await?;
                            Ok(())
                        })
                        .await?;
                        Ok(())
                    })
                    .await
            })
            .expect_err("inner timeout is foreign to the outer block");
        assert!(err.is_cancelled());
    }
}

mod non_cancellable_tests {
    use super::*;

    #[test]
    fn test_cleanup_survives_cancellation() {
        let rt = runtime();
        let cleaned = Arc::new(AtomicBool::new(false));
        let seen = cleaned.clone();

        rt.block_on(move |scope| async move {
            let job = scope.launch({
                let cleaned = cleaned.clone();
                move |s| async move {
                    let worked = s.sleep(Duration::from_secs(10)).await;
                    if worked.is_err() {
                        // Suspending cleanup, exempt from the liveness check.
                        s.non_cancellable(|c| async move {
                            c.sleep(Duration::from_millis(10)).await?;
                            cleaned.store(true, Ordering::SeqCst);
                            Ok(())
                        })
                        .await?;
                    }
                    worked
                }
            });
            scope.sleep(Duration::from_millis(30)).await?;
            job.cancel(CancelCause::requested());
            scope.join(&job).await?;
            Ok(())
        })
        .expect("block_on");

        assert!(seen.load(Ordering::SeqCst), "cleanup must have run");
    }
}

mod liveness_tests {
    use super::*;

    #[test]
    fn test_is_active_observes_cancellation() {
        let rt = runtime();
        let iterations = Arc::new(AtomicUsize::new(0));
        let seen = iterations.clone();

        rt.block_on(move |scope| async move {
            let job = scope.launch({
                let iterations = iterations.clone();
                move |s| async move {
                    // Compute-bound loop: cancellable only via polling.
                    while s.is_active() {
                        iterations.fetch_add(1, Ordering::SeqCst);
                        std::thread::yield_now();
                    }
                    Ok(())
                }
            });
            scope.sleep(Duration::from_millis(20)).await?;
            job.cancel(CancelCause::requested());
            scope.join(&job).await?;
            Ok(())
        })
        .expect("block_on");

        assert!(seen.load(Ordering::SeqCst) > 0);
    }
}
