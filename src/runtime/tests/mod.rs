//! Runtime 单元测试
//!
//! 测试阻塞桥、配置、统计计数和任务注册表

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::TaskError;
use crate::runtime::{Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig { num_workers: 2 })
}

mod config_tests {
    use super::*;

    #[test]
    fn test_config_default_has_workers() {
        let config = RuntimeConfig::default();
        assert!(config.num_workers >= 1);
    }

    #[test]
    fn test_runtime_debug_format() {
        let rt = runtime();
        let debug = format!("{:?}", rt);
        assert!(debug.contains("Runtime"));
    }
}

mod block_on_tests {
    use super::*;

    #[test]
    fn test_block_on_returns_value() {
        let rt = runtime();
        let value = rt
            .block_on(|_| async move { Ok(1234) })
            .expect("block_on");
        assert_eq!(value, 1234);
    }

    #[test]
    fn test_block_on_propagates_failure() {
        let rt = runtime();
        let err = rt
            .block_on(|_| async move { Err::<(), _>(TaskError::failed(anyhow::anyhow!("broken"))) })
            .expect_err("failure reaches the bridge");
        match err {
            TaskError::Failed(e) => assert!(e.to_string().contains("broken")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_block_on_waits_for_launched_children() {
        let rt = runtime();
        let value = rt
            .block_on(|scope| async move {
                let deferred = scope.spawn(|s| async move {
                    s.sleep(Duration::from_millis(20)).await?;
                    Ok(7)
                });
                deferred.wait(&scope).await
            })
            .expect("block_on");
        assert_eq!(value, 7);
    }

    #[test]
    fn test_block_on_after_shutdown_fails() {
        let rt = runtime();
        rt.shutdown();
        let result = rt.block_on(|_| async move { Ok(()) });
        assert!(result.is_err());
    }
}

mod stats_tests {
    use super::*;

    #[test]
    fn test_stats_count_outcomes() {
        let rt = runtime();
        rt.block_on(|scope| async move {
            let ok = scope.launch(|_| async move { Ok(()) });
            let bad = scope.nested(|s| async move {
                s.launch(|_| async move {
                    Err(TaskError::failed(anyhow::anyhow!("counted failure")))
                });
                s.sleep(Duration::from_secs(5)).await
            });
            let _ = bad.await;
            scope.join(&ok).await?;
            Ok(())
        })
        .expect("block_on");

        let stats = rt.stats();
        // Root + ok child + failing child.
        assert_eq!(stats.tasks_launched.load(Ordering::SeqCst), 3);
        assert!(stats.tasks_completed.load(Ordering::SeqCst) >= 2);
        assert_eq!(stats.tasks_failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_count_timeouts() {
        let rt = runtime();
        let _ = rt.block_on(|scope| async move {
            scope
                .with_timeout_or_none(Duration::from_millis(10), |s| async move {
                    s.sleep(Duration::from_secs(10)).await?;
                    Ok(())
                })
                .await
        });
        assert_eq!(rt.stats().timeouts_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_count_rejected_launches() {
        let rt = runtime();
        let _ = rt.block_on(|scope| async move {
            scope.cancel();
            let _ = scope.launch(|_| async move { Ok(()) });
            Err::<(), _>(TaskError::Cancelled(crate::error::CancelCause::requested()))
        });
        assert_eq!(rt.stats().launches_rejected.load(Ordering::SeqCst), 1);
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_live_jobs_purges_dead_entries() {
        let rt = runtime();
        rt.block_on(|scope| async move {
            let job = scope.launch(|_| async move { Ok(()) });
            scope.join(&job).await?;
            Ok(())
        })
        .expect("block_on");

        // Everything has drained; terminal jobs are dropped and purged.
        let live = rt.live_jobs();
        assert!(live.is_empty(), "unexpected live jobs: {:?}", live);
    }

    #[test]
    fn test_live_jobs_sees_held_job_handles() {
        let rt = runtime();
        let job = rt
            .block_on(|scope| async move {
                // Hand the job handle out of the tree; the registry entry
                // stays alive as long as the handle does.
                Ok(scope.job().clone())
            })
            .expect("block_on");

        let live = rt.live_jobs();
        assert_eq!(live, vec![job.id()]);

        drop(job);
        assert!(rt.live_jobs().is_empty());
    }
}
