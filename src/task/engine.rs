//! Task execution engine: registry, dispatch, completion and retry.
//!
//! Tasks are dispatched in submission order by a polling loop (and eagerly on
//! submit/resume/retry) until `max_concurrent_tasks` are running. Priority is
//! stored on the definition but never consulted for ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{CheckpointError, EngineError, ErrorKind};
use crate::listeners::{
    CompletionListener, ErrorListener, ProgressListener, StateChangeListener, TaskListeners,
    dispatch,
};
use crate::task::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::task::context::TaskContext;
use crate::task::scheduler::{self, Launch, Outcome};
use crate::task::types::{TaskDefinition, TaskError, TaskResult, TaskStatus};

/// Registry entry for one accepted task.
struct TaskEntry {
    definition: TaskDefinition,
    context: Arc<TaskContext>,
    /// Latest outcome. A FAILED result may be interim while a retry is pending.
    result: Option<TaskResult>,
    /// Completion handle; resolves once, with the final result.
    completion: Arc<watch::Sender<Option<TaskResult>>>,
    attempts: u32,
    running: bool,
    retry_ready: bool,
    finished: bool,
}

impl TaskEntry {
    fn is_candidate(&self) -> bool {
        !self.running
            && !self.finished
            && !self.context.should_pause()
            && !self.context.should_cancel()
            && (self.result.is_none() || self.retry_ready)
    }

    fn status(&self) -> TaskStatus {
        if self.running {
            return self.context.status();
        }
        self.result
            .as_ref()
            .map(|r| r.status)
            .unwrap_or_else(|| self.context.status())
    }

    /// Entries the cleanup sweep must leave alone this cycle.
    fn is_pinned(&self) -> bool {
        self.running
            || self.completion.borrow().is_none()
            || self.completion.receiver_count() > 0
            || self.context.has_active_listeners()
    }

    fn result_with(&self, status: TaskStatus, execution_time: Duration) -> TaskResult {
        let mut result = TaskResult::new(self.definition.id.clone(), status);
        result.attempts = self.attempts;
        result.started_at = self.context.started_at();
        result.execution_time = execution_time;
        result.metadata = self.definition.metadata.clone();
        result
    }
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, TaskEntry>,
    /// Submission order; defines the dispatch candidate order.
    order: Vec<String>,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    retried: u64,
    finished: u64,
    total_execution_time: Duration,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shutdown: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

/// What `finish` decided under the registry lock.
enum Settlement {
    Final {
        context: Arc<TaskContext>,
        completion: Arc<watch::Sender<Option<TaskResult>>>,
        result: TaskResult,
        error: Option<TaskError>,
    },
    Retry {
        token: CancellationToken,
        delay: Duration,
        attempt: u32,
        error: TaskError,
    },
}

/// Engine statistics. Diagnostic only.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub is_running: bool,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timed_out: u64,
    pub total_retried: u64,
    pub current_tasks: usize,
    pub running_tasks: usize,
    pub paused_tasks: usize,
    /// Mean execution time of final results, in seconds.
    pub average_execution_time: f64,
    pub status_distribution: HashMap<String, usize>,
    pub config: EngineConfig,
}

pub(super) struct EngineInner {
    pub(super) config: EngineConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    registry: Mutex<Registry>,
    listeners: Arc<TaskListeners>,
    pub(super) blocking_slots: Arc<Semaphore>,
    counters: StdMutex<Counters>,
    lifecycle: StdMutex<Lifecycle>,
}

impl EngineInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_started(&self) -> bool {
        self.lifecycle().started
    }

    /// Launch candidates in submission order until the concurrency cap.
    pub(super) async fn dispatch_ready(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }

        let launches = {
            let mut registry = self.registry.lock().await;
            let Registry { tasks, order } = &mut *registry;
            let mut running = tasks.values().filter(|e| e.running).count();
            let mut launches = Vec::new();

            for id in order.iter() {
                if running >= self.config.max_concurrent_tasks {
                    break;
                }
                let Some(entry) = tasks.get_mut(id) else {
                    continue;
                };
                if !entry.is_candidate() {
                    continue;
                }
                let Some(executor) = entry.definition.executor.clone() else {
                    continue;
                };

                entry.running = true;
                entry.retry_ready = false;
                running += 1;
                launches.push(Launch {
                    task_id: id.clone(),
                    executor,
                    params: entry.definition.parameters.clone(),
                    context: entry.context.clone(),
                    deadline: entry
                        .definition
                        .timeout
                        .unwrap_or(self.config.default_timeout),
                    attempt: entry.attempts,
                });
            }
            launches
        };

        for launch in launches {
            launch.context.set_status(TaskStatus::Running);
            tracing::debug!(task_id = %launch.task_id, attempt = launch.attempt, "Dispatching task");
            let inner = self.clone();
            tokio::spawn(async move { scheduler::run(inner, launch).await });
        }
    }

    /// Record an execution outcome: finalize, or schedule a retry.
    pub(super) async fn finish(self: &Arc<Self>, task_id: &str, outcome: Outcome, elapsed: Duration) {
        let settlement = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.tasks.get_mut(task_id) else {
                return;
            };
            entry.running = false;
            if entry.finished {
                tracing::debug!(task_id = %task_id, "Dropping outcome of already finished task");
                return;
            }

            let (result, error, retry) = match outcome {
                Outcome::Completed(value) => {
                    let mut result = entry.result_with(TaskStatus::Completed, elapsed);
                    result.result = Some(value);
                    (result, None, None)
                }
                Outcome::Cancelled => {
                    let mut result = entry.result_with(TaskStatus::Cancelled, elapsed);
                    result.error = Some("Task was cancelled".to_string());
                    result.error_kind = Some(ErrorKind::Cancelled);
                    (result, None, None)
                }
                Outcome::TimedOut(deadline) => {
                    let mut result = entry.result_with(TaskStatus::Timeout, elapsed);
                    let message = format!("Task timed out after {deadline:?}");
                    result.error = Some(message.clone());
                    result.error_kind = Some(ErrorKind::Timeout);
                    let error = TaskError {
                        task_id: task_id.to_string(),
                        error_kind: ErrorKind::Timeout,
                        error_message: message,
                        timestamp: Utc::now(),
                        recoverable: false,
                        retry_count: entry.attempts.saturating_sub(1),
                    };
                    (result, Some(error), None)
                }
                Outcome::Failed(err) => {
                    let mut result = entry.result_with(TaskStatus::Failed, elapsed);
                    result.error = Some(err.to_string());
                    result.error_kind = Some(err.kind());
                    let error =
                        TaskError::from_execution(task_id, &err, entry.attempts.saturating_sub(1));
                    let policy = &entry.definition.retry_policy;
                    let retry = (!err.is_validation() && policy.should_retry(&err, entry.attempts))
                        .then(|| policy.calculate_delay(entry.attempts));
                    (result, Some(error), retry)
                }
            };

            match (retry, error) {
                (Some(delay), Some(error)) => {
                    entry.result = Some(result);
                    Settlement::Retry {
                        token: entry.context.cancellation_token(),
                        delay,
                        attempt: entry.attempts,
                        error,
                    }
                }
                (_, error) => {
                    entry.finished = true;
                    entry.result = Some(result.clone());
                    Settlement::Final {
                        context: entry.context.clone(),
                        completion: entry.completion.clone(),
                        result,
                        error,
                    }
                }
            }
        };

        match settlement {
            Settlement::Final {
                context,
                completion,
                result,
                error,
            } => {
                if context.status() == TaskStatus::Paused {
                    context.resume();
                }
                context.set_status(result.status);
                completion.send_replace(Some(result.clone()));
                self.record_final(&result);

                match result.status {
                    TaskStatus::Completed => {
                        tracing::info!(task_id = %task_id, attempts = result.attempts, "Task completed")
                    }
                    status => {
                        tracing::warn!(
                            task_id = %task_id,
                            status = %status,
                            attempts = result.attempts,
                            error = result.error.as_deref().unwrap_or(""),
                            "Task finished unsuccessfully"
                        )
                    }
                }

                if let Some(error) = error {
                    self.notify_error(&error);
                }
                self.notify_completion(&result);
            }
            Settlement::Retry {
                token,
                delay,
                attempt,
                error,
            } => {
                self.counters().retried += 1;
                tracing::warn!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.error_message,
                    "Task failed, retrying after backoff"
                );
                self.notify_error(&error);
                self.schedule_retry(task_id.to_string(), token, delay);
            }
        }
    }

    /// Sleep out the backoff, bump the attempt counter and re-enter dispatch.
    fn schedule_retry(self: &Arc<Self>, task_id: String, token: CancellationToken, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task_id = %task_id, "Retry backoff cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut registry = inner.registry.lock().await;
                if let Some(entry) = registry.tasks.get_mut(&task_id)
                    && !entry.finished
                {
                    entry.attempts += 1;
                    entry.retry_ready = true;
                    if let Some(result) = entry.result.as_mut() {
                        result.attempts = entry.attempts;
                    }
                }
            }
            inner.dispatch_ready().await;
        });
    }

    /// Drop finished tasks beyond the retention limit, oldest first.
    pub(super) async fn cleanup_completed(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let Registry { tasks, order } = &mut *registry;

        let mut terminal: Vec<(String, DateTime<Utc>)> = tasks
            .iter()
            .filter_map(|(id, entry)| {
                let result = entry.result.as_ref()?;
                result.status.is_terminal().then(|| {
                    (
                        id.clone(),
                        result.completed_at.unwrap_or(entry.definition.created_at),
                    )
                })
            })
            .collect();

        if terminal.len() <= self.config.retained_results {
            return 0;
        }
        terminal.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        let mut skipped = 0;
        for (id, _) in terminal.into_iter().skip(self.config.retained_results) {
            let Some(entry) = tasks.get(&id) else {
                continue;
            };
            if entry.is_pinned() {
                skipped += 1;
                continue;
            }
            tasks.remove(&id);
            removed += 1;
        }

        if removed > 0 {
            order.retain(|id| tasks.contains_key(id));
            tracing::info!(removed, skipped, "Cleaned up completed tasks");
        } else if skipped > 0 {
            tracing::debug!(skipped, "Completed tasks still referenced, skipping cleanup");
        }
        removed
    }

    fn record_final(&self, result: &TaskResult) {
        let mut counters = self.counters();
        match result.status {
            TaskStatus::Completed => counters.completed += 1,
            TaskStatus::Failed => counters.failed += 1,
            TaskStatus::Cancelled => counters.cancelled += 1,
            TaskStatus::Timeout => counters.timed_out += 1,
            _ => {}
        }
        counters.finished += 1;
        counters.total_execution_time += result.execution_time;
    }

    fn notify_error(&self, error: &TaskError) {
        let listeners = self.listeners.error();
        dispatch("error", &error.task_id, &listeners, |l| l(error));
    }

    fn notify_completion(&self, result: &TaskResult) {
        let listeners = self.listeners.completion();
        dispatch("completion", &result.task_id, &listeners, |l| l(result));
    }
}

/// Bounded-concurrency task runtime.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Create an engine. When checkpoints are enabled, contexts get a
    /// [`FileCheckpointStore`] rooted at `checkpoint_storage_path`.
    pub fn new(config: EngineConfig) -> Self {
        let store: Option<Arc<dyn CheckpointStore>> = config.enable_checkpoints.then(|| {
            Arc::new(FileCheckpointStore::new(config.checkpoint_storage_path.clone()))
                as Arc<dyn CheckpointStore>
        });
        Self::with_checkpoint_store(config, store)
    }

    /// Create an engine with an explicit checkpoint backend.
    ///
    /// A `max_concurrent_tasks` of zero would never dispatch anything and is
    /// raised to one.
    pub fn with_checkpoint_store(
        mut config: EngineConfig,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        if config.max_concurrent_tasks == 0 {
            tracing::warn!("max_concurrent_tasks is 0, using 1");
            config.max_concurrent_tasks = 1;
        }
        let slots = config.max_concurrent_tasks;
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry: Mutex::new(Registry::default()),
                listeners: Arc::new(TaskListeners::default()),
                blocking_slots: Arc::new(Semaphore::new(slots)),
                counters: StdMutex::new(Counters::default()),
                lifecycle: StdMutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_started()
    }

    /// Start the dispatch and cleanup loops. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.started {
            tracing::warn!("Task engine already started");
            return;
        }

        let shutdown = CancellationToken::new();
        lifecycle.loops = vec![
            scheduler::spawn_dispatch_loop(self.inner.clone(), shutdown.clone()),
            scheduler::spawn_cleanup_loop(self.inner.clone(), shutdown.clone()),
        ];
        lifecycle.shutdown = Some(shutdown);
        lifecycle.started = true;

        tracing::info!(
            max_concurrent_tasks = self.inner.config.max_concurrent_tasks,
            checkpoints = self.inner.store.is_some(),
            "Task engine started"
        );
    }

    /// Stop the background loops and cancel every running task.
    pub async fn stop(&self) {
        let (shutdown, loops) = {
            let mut lifecycle = self.inner.lifecycle();
            if !lifecycle.started {
                return;
            }
            lifecycle.started = false;
            (
                lifecycle.shutdown.take(),
                std::mem::take(&mut lifecycle.loops),
            )
        };

        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Engine loop ended abnormally");
            }
        }

        let running: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry
                .order
                .iter()
                .filter(|id| registry.tasks.get(*id).is_some_and(|e| e.running))
                .cloned()
                .collect()
        };
        for task_id in running {
            if let Err(e) = self.cancel(&task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to cancel task during shutdown");
            }
        }

        tracing::info!("Task engine stopped");
    }

    /// Accept a task definition. Returns the task id.
    pub async fn submit(&self, mut definition: TaskDefinition) -> Result<String, EngineError> {
        if definition.id.is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        if definition.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition {
                reason: "task name is required".to_string(),
            });
        }
        if definition.executor.is_none() {
            return Err(EngineError::InvalidDefinition {
                reason: "task executor is required".to_string(),
            });
        }
        if definition.timeout.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::InvalidDefinition {
                reason: "timeout must be positive".to_string(),
            });
        }

        let task_id = definition.id.clone();
        {
            let mut registry = self.inner.registry.lock().await;
            if registry.tasks.contains_key(&task_id) {
                return Err(EngineError::DuplicateTask { id: task_id });
            }

            let context = Arc::new(TaskContext::with_shared_listeners(
                task_id.clone(),
                self.inner.store.clone(),
                self.inner.config.checkpoint_interval,
                self.inner.listeners.clone(),
            ));
            tracing::info!(
                task_id = %task_id,
                name = %definition.name,
                priority = definition.priority,
                "Task submitted"
            );
            registry.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    definition,
                    context,
                    result: None,
                    completion: Arc::new(watch::Sender::new(None)),
                    attempts: 1,
                    running: false,
                    retry_ready: false,
                    finished: false,
                },
            );
            registry.order.push(task_id.clone());
        }
        self.inner.counters().submitted += 1;

        self.inner.dispatch_ready().await;
        Ok(task_id)
    }

    /// Cancel a task. Idempotent: a task already cancelled reports `true`,
    /// a task that finished any other way reports `false`.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, EngineError> {
        let (context, completion, result) = {
            let mut registry = self.inner.registry.lock().await;
            let entry = registry
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    id: task_id.to_string(),
                })?;

            if entry.finished {
                return Ok(entry
                    .result
                    .as_ref()
                    .is_some_and(|r| r.status == TaskStatus::Cancelled));
            }

            entry.finished = true;
            entry.running = false;
            entry.retry_ready = false;
            let mut result =
                entry.result_with(TaskStatus::Cancelled, entry.context.execution_time());
            result.error = Some("Task was cancelled".to_string());
            result.error_kind = Some(ErrorKind::Cancelled);
            entry.result = Some(result.clone());
            (entry.context.clone(), entry.completion.clone(), result)
        };

        context.cancel();
        completion.send_replace(Some(result.clone()));
        self.inner.record_final(&result);
        self.inner.notify_completion(&result);
        Ok(true)
    }

    /// Pause a running task. The executor blocks at its next `wait_if_paused`.
    pub async fn pause(&self, task_id: &str) -> Result<bool, EngineError> {
        let context = {
            let registry = self.inner.registry.lock().await;
            let entry = registry
                .tasks
                .get(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            if !entry.running || entry.finished {
                return Ok(false);
            }
            entry.context.clone()
        };
        Ok(context.pause())
    }

    /// Reopen a paused task's gate and re-enter dispatch.
    pub async fn resume(&self, task_id: &str) -> Result<bool, EngineError> {
        let context = {
            let registry = self.inner.registry.lock().await;
            let entry = registry
                .tasks
                .get(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            if entry.finished {
                return Ok(false);
            }
            entry.context.clone()
        };

        if !context.should_pause() {
            return Ok(false);
        }
        context.resume();
        self.inner.dispatch_ready().await;
        Ok(true)
    }

    pub async fn get_status(&self, task_id: &str) -> Option<TaskStatus> {
        let registry = self.inner.registry.lock().await;
        registry.tasks.get(task_id).map(TaskEntry::status)
    }

    /// Latest result. While a retry is pending this is the interim FAILED result.
    pub async fn get_result(&self, task_id: &str) -> Option<TaskResult> {
        let registry = self.inner.registry.lock().await;
        registry.tasks.get(task_id).and_then(|e| e.result.clone())
    }

    /// Task ids in submission order, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<String> {
        let registry = self.inner.registry.lock().await;
        registry
            .order
            .iter()
            .filter(|id| match (status, registry.tasks.get(*id)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(wanted), Some(entry)) => entry.status() == wanted,
            })
            .cloned()
            .collect()
    }

    /// Shared context handle of a task.
    pub async fn context(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        let registry = self.inner.registry.lock().await;
        registry.tasks.get(task_id).map(|e| e.context.clone())
    }

    /// Force a checkpoint of a task's current context state.
    pub async fn checkpoint_task(&self, task_id: &str) -> Result<String, EngineError> {
        let context = self
            .context(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        context
            .create_checkpoint(true)
            .await?
            .ok_or(EngineError::Checkpoint(CheckpointError::Unavailable))
    }

    /// Wait for the final result.
    ///
    /// If `timeout` elapses first the task is cancelled and `None` is returned.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<TaskResult>, EngineError> {
        let mut rx = {
            let registry = self.inner.registry.lock().await;
            registry
                .tasks
                .get(task_id)
                .ok_or_else(|| EngineError::TaskNotFound {
                    id: task_id.to_string(),
                })?
                .completion
                .subscribe()
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
                Ok(Ok(result)) => Some(result.clone()),
                Ok(Err(_)) => Some(None),
                Err(_) => None,
            },
            None => match rx.wait_for(Option::is_some).await {
                Ok(result) => Some(result.clone()),
                Err(_) => Some(None),
            },
        };

        match outcome {
            Some(result) => Ok(result),
            None => {
                tracing::warn!(task_id = %task_id, "Timed out waiting for task, cancelling");
                self.cancel_after_wait(task_id, &rx).await
            }
        }
    }

    /// Cancel a task whose waiter gave up. A task that finished in the
    /// meantime reports its final result instead.
    async fn cancel_after_wait(
        &self,
        task_id: &str,
        rx: &watch::Receiver<Option<TaskResult>>,
    ) -> Result<Option<TaskResult>, EngineError> {
        if self.cancel(task_id).await? {
            return Ok(None);
        }
        Ok(rx.borrow().clone())
    }

    /// Run one cleanup pass now. Returns the number of tasks removed.
    pub async fn cleanup_completed_tasks(&self) -> usize {
        self.inner.cleanup_completed().await
    }

    pub fn add_progress_listener(&self, listener: ProgressListener) {
        self.inner.listeners.add_progress(listener);
    }

    pub fn add_state_change_listener(&self, listener: StateChangeListener) {
        self.inner.listeners.add_state_change(listener);
    }

    pub fn add_error_listener(&self, listener: ErrorListener) {
        self.inner.listeners.add_error(listener);
    }

    pub fn add_completion_listener(&self, listener: CompletionListener) {
        self.inner.listeners.add_completion(listener);
    }

    pub async fn get_statistics(&self) -> EngineStatistics {
        let (current, running, paused, distribution) = {
            let registry = self.inner.registry.lock().await;
            let mut distribution: HashMap<String, usize> = HashMap::new();
            let mut running = 0;
            let mut paused = 0;
            for entry in registry.tasks.values() {
                let status = entry.status();
                *distribution.entry(status.to_string()).or_default() += 1;
                if entry.running {
                    running += 1;
                    if status == TaskStatus::Paused {
                        paused += 1;
                    }
                }
            }
            (registry.tasks.len(), running, paused, distribution)
        };

        let counters = self.inner.counters();
        let average = if counters.finished > 0 {
            counters.total_execution_time.as_secs_f64() / counters.finished as f64
        } else {
            0.0
        };

        EngineStatistics {
            is_running: self.is_running(),
            total_submitted: counters.submitted,
            total_completed: counters.completed,
            total_failed: counters.failed,
            total_cancelled: counters.cancelled,
            total_timed_out: counters.timed_out,
            total_retried: counters.retried,
            current_tasks: current,
            running_tasks: running,
            paused_tasks: paused,
            average_execution_time: average,
            status_distribution: distribution,
            config: self.inner.config.clone(),
        }
    }
}
