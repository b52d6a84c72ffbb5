//! Background loops and per-dispatch execution.
//!
//! Async executors run on the runtime under `tokio::time::timeout`. Blocking
//! executors run on the blocking pool behind a semaphore; their deadline is
//! watched from the runtime side, and on expiry the worker thread is detached
//! after its cancellation signal fires.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::listeners::panic_message;
use crate::task::context::TaskContext;
use crate::task::engine::EngineInner;
use crate::task::types::{AsyncExecutorFn, BlockingExecutorFn, Executor, TaskParams};

/// One dispatch of a task.
pub(super) struct Launch {
    pub task_id: String,
    pub executor: Executor,
    pub params: TaskParams,
    pub context: Arc<TaskContext>,
    pub deadline: Duration,
    pub attempt: u32,
}

/// How one execution attempt ended.
pub(super) enum Outcome {
    Completed(serde_json::Value),
    Failed(ExecutionError),
    TimedOut(Duration),
    Cancelled,
}

impl Outcome {
    fn from_error(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Cancelled => Self::Cancelled,
            ExecutionError::Timeout(after) => Self::TimedOut(after),
            other => Self::Failed(other),
        }
    }
}

pub(super) async fn run(inner: Arc<EngineInner>, launch: Launch) {
    let started = Instant::now();
    let outcome = match launch.executor.clone() {
        Executor::Async(f) => run_async(f, &launch).await,
        Executor::Blocking(f) => run_blocking(f, &launch, inner.blocking_slots.clone()).await,
    };
    inner.finish(&launch.task_id, outcome, started.elapsed()).await;
}

async fn run_async(f: AsyncExecutorFn, launch: &Launch) -> Outcome {
    let token = launch.context.cancellation_token();
    let params = launch.params.clone();
    let context = launch.context.clone();
    // Build the future inside the guard so a panic in the closure body is caught too.
    let work = AssertUnwindSafe(async move { f(params, context).await }).catch_unwind();

    tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Cancelled,
        res = tokio::time::timeout(launch.deadline, work) => match res {
            Ok(Ok(Ok(value))) => Outcome::Completed(value),
            Ok(Ok(Err(e))) => Outcome::from_error(e),
            Ok(Err(panic)) => Outcome::Failed(ExecutionError::runtime(format!(
                "executor panicked: {}",
                panic_message(&panic)
            ))),
            Err(_) => {
                token.cancel();
                Outcome::TimedOut(launch.deadline)
            }
        },
    }
}

async fn run_blocking(f: BlockingExecutorFn, launch: &Launch, slots: Arc<Semaphore>) -> Outcome {
    let token = launch.context.cancellation_token();
    let params = launch.params.clone();
    let context = launch.context.clone();

    // The permit moves onto the worker thread, so a detached thread keeps
    // its slot until it actually returns.
    let work = async move {
        let Ok(permit) = slots.acquire_owned().await else {
            return Err(ExecutionError::Cancelled);
        };
        match tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(params, context)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(ExecutionError::runtime(format!(
                "blocking executor panicked: {e}"
            ))),
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Cancelled,
        res = tokio::time::timeout(launch.deadline, work) => match res {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(e)) => Outcome::from_error(e),
            Err(_) => {
                tracing::warn!(
                    task_id = %launch.task_id,
                    deadline_ms = launch.deadline.as_millis() as u64,
                    "Blocking task exceeded its deadline, detaching worker"
                );
                token.cancel();
                Outcome::TimedOut(launch.deadline)
            }
        },
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Dispatch candidates every `scheduler_tick`.
pub(super) fn spawn_dispatch_loop(
    inner: Arc<EngineInner>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(inner.config.scheduler_tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => inner.dispatch_ready().await,
            }
        }
        tracing::debug!("Dispatch loop stopped");
    })
}

/// Prune finished tasks every `cleanup_interval`.
pub(super) fn spawn_cleanup_loop(
    inner: Arc<EngineInner>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(inner.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = inner.cleanup_completed().await;
                    if removed > 0 {
                        tracing::debug!(removed, "Cleanup sweep finished");
                    }
                }
            }
        }
        tracing::debug!("Cleanup loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_outcomes_are_classified() {
        assert!(matches!(
            Outcome::from_error(ExecutionError::Cancelled),
            Outcome::Cancelled
        ));
        assert!(matches!(
            Outcome::from_error(ExecutionError::Timeout(Duration::from_secs(1))),
            Outcome::TimedOut(_)
        ));
        assert!(matches!(
            Outcome::from_error(ExecutionError::runtime("x")),
            Outcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn zero_period_ticker_does_not_panic() {
        let mut t = ticker(Duration::ZERO);
        t.tick().await;
    }
}
