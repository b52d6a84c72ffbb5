//! End-to-end tests for the task engine through its public API.
//!
//! Every test runs under `TEST_TIMEOUT` so a stuck dispatch loop fails fast
//! instead of hanging the suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use agent_runtime::config::EngineConfig;
use agent_runtime::error::{ErrorKind, ExecutionError};
use agent_runtime::task::{
    CheckpointStore, Executor, FileCheckpointStore, RetryPolicy, TaskContext, TaskDefinition,
    TaskEngine, TaskStatus,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT: Option<Duration> = Some(Duration::from_secs(3));

fn config() -> EngineConfig {
    EngineConfig {
        max_concurrent_tasks: 2,
        scheduler_tick: Duration::from_millis(10),
        cleanup_interval: Duration::from_secs(3600),
        enable_checkpoints: false,
        ..Default::default()
    }
}

/// Sleeps for `hold`, tracking how many copies run at once.
fn overlapping(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>, hold: Duration) -> TaskDefinition {
    TaskDefinition::new(
        "overlap",
        Executor::from_async(move |_, _| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }),
    )
}

#[tokio::test]
async fn concurrency_cap_holds_third_task_pending() {
    timeout(TEST_TIMEOUT, async {
        let engine = TaskEngine::new(config());
        engine.start();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let def = overlapping(active.clone(), peak.clone(), Duration::from_millis(100));
            ids.push(engine.submit(def).await.unwrap());
        }

        assert_eq!(engine.get_status(&ids[0]).await, Some(TaskStatus::Running));
        assert_eq!(engine.get_status(&ids[1]).await, Some(TaskStatus::Running));
        assert_eq!(engine.get_status(&ids[2]).await, Some(TaskStatus::Pending));
        assert_eq!(engine.get_statistics().await.running_tasks, 2);

        for id in &ids {
            let result = engine.wait_for_task(id, WAIT).await.unwrap().unwrap();
            assert_eq!(result.status, TaskStatus::Completed);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(engine.get_statistics().await.total_completed, 3);
        engine.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retries_exhaust_into_failure() {
    timeout(TEST_TIMEOUT, async {
        let engine = TaskEngine::new(config());
        engine.start();

        let errors = Arc::new(AtomicU32::new(0));
        let seen = errors.clone();
        engine.add_error_listener(Arc::new(move |e| {
            assert_eq!(e.error_kind, ErrorKind::Runtime);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let def = TaskDefinition::new(
            "always-fails",
            Executor::from_async(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExecutionError::runtime("upstream unavailable"))
                }
            }),
        )
        .with_retry_policy(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(5), Duration::from_millis(20))
                .with_jitter(false),
        );

        let id = engine.submit(def).await.unwrap();
        let result = engine.wait_for_task(&id, WAIT).await.unwrap().unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error.as_deref(), Some("Runtime error: upstream unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 3);

        let stats = engine.get_statistics().await;
        assert_eq!(stats.total_retried, 2);
        assert_eq!(stats.total_failed, 1);
        engine.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancelling_pending_task_never_runs_it() {
    timeout(TEST_TIMEOUT, async {
        let engine = TaskEngine::new(config());
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let def = TaskDefinition::new(
            "never",
            Executor::from_async(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        );

        let id = engine.submit(def).await.unwrap();
        assert!(engine.cancel(&id).await.unwrap());
        assert!(engine.cancel(&id).await.unwrap());

        engine.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(engine.get_status(&id).await, Some(TaskStatus::Cancelled));
        engine.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn checkpoint_survives_into_fresh_context() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
        let engine = TaskEngine::with_checkpoint_store(config(), Some(store.clone()));
        engine.start();

        let def = TaskDefinition::new(
            "checkpointed",
            Executor::from_async(|_, ctx| async move {
                ctx.set_data("cursor", json!(42));
                ctx.set_metadata("source", json!("feed"));
                let id = ctx
                    .create_checkpoint(true)
                    .await
                    .map_err(|e| ExecutionError::Other(e.into()))?;
                Ok::<_, ExecutionError>(json!(id))
            }),
        )
        .with_id("job-1");

        let id = engine.submit(def).await.unwrap();
        let result = engine.wait_for_task(&id, WAIT).await.unwrap().unwrap();
        let checkpoint_id = result
            .result
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();

        let listed = store.list("job-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checkpoint_id, checkpoint_id);

        let fresh = TaskContext::new("job-1-replay", Some(store.clone()), Duration::ZERO);
        fresh.restore_checkpoint(&checkpoint_id).await.unwrap();
        assert_eq!(fresh.status(), TaskStatus::Running);
        assert_eq!(fresh.get_data("cursor"), Some(json!(42)));
        assert_eq!(fresh.get_metadata("source"), Some(json!("feed")));
        assert!(fresh.started_at().is_some());
        engine.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failing_listeners_do_not_affect_tasks() {
    timeout(TEST_TIMEOUT, async {
        let engine = TaskEngine::new(config());
        engine.start();

        let completions = Arc::new(AtomicU32::new(0));
        let progress = Arc::new(AtomicU32::new(0));
        engine.add_completion_listener(Arc::new(|_| anyhow::bail!("sink offline")));
        engine.add_completion_listener(Arc::new(|_| panic!("listener bug")));
        let seen = completions.clone();
        engine.add_completion_listener(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        engine.add_progress_listener(Arc::new(|_| anyhow::bail!("progress sink offline")));
        let seen = progress.clone();
        engine.add_progress_listener(Arc::new(move |p| {
            assert!(p.progress <= 100);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let def = TaskDefinition::new(
            "reports",
            Executor::from_async(|_, ctx| async move {
                for pct in [10, 60, 150] {
                    ctx.report_progress(pct, "working", None)
                        .await
                        .map_err(|e| ExecutionError::Other(e.into()))?;
                }
                Ok::<_, ExecutionError>(json!("done"))
            }),
        );

        let id = engine.submit(def).await.unwrap();
        let result = engine.wait_for_task(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(progress.load(Ordering::SeqCst), 3);
        engine.stop().await;
    })
    .await
    .expect("test timed out");
}
