//! Per-task runtime state.
//!
//! A `TaskContext` is shared between the engine and the running executor.
//! Field access goes through a `std::sync::Mutex` that is never held across
//! an `.await`, so blocking executors can use the context from worker threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CheckpointError;
use crate::listeners::{ProgressListener, StateChangeListener, TaskListeners, dispatch};
use crate::task::checkpoint::CheckpointStore;
use crate::task::types::{TaskProgress, TaskStatus};

struct ContextState {
    status: TaskStatus,
    metadata: HashMap<String, Value>,
    data: HashMap<String, Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_checkpoint_time: Option<DateTime<Utc>>,
    last_auto_checkpoint: Instant,
}

impl ContextState {
    fn execution_time(&self) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Serializable view of a context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub metadata: HashMap<String, Value>,
    pub data: HashMap<String, Value>,
    pub should_cancel: bool,
    pub should_pause: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub execution_time: f64,
}

/// Mutable runtime state of one task.
pub struct TaskContext {
    task_id: String,
    state: Mutex<ContextState>,
    cancel: CancellationToken,
    /// `true` while paused.
    pause_gate: watch::Sender<bool>,
    store: Option<Arc<dyn CheckpointStore>>,
    auto_checkpoint_interval: Duration,
    progress_listeners: Mutex<Vec<ProgressListener>>,
    state_listeners: Mutex<Vec<StateChangeListener>>,
    shared: Arc<TaskListeners>,
}

impl TaskContext {
    /// Create a standalone context in PENDING.
    ///
    /// `auto_checkpoint_interval` is the minimum spacing between non-forced
    /// checkpoints; zero disables the check.
    pub fn new(
        task_id: impl Into<String>,
        store: Option<Arc<dyn CheckpointStore>>,
        auto_checkpoint_interval: Duration,
    ) -> Self {
        Self::with_shared_listeners(
            task_id,
            store,
            auto_checkpoint_interval,
            Arc::new(TaskListeners::default()),
        )
    }

    pub(crate) fn with_shared_listeners(
        task_id: impl Into<String>,
        store: Option<Arc<dyn CheckpointStore>>,
        auto_checkpoint_interval: Duration,
        shared: Arc<TaskListeners>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            state: Mutex::new(ContextState {
                status: TaskStatus::Pending,
                metadata: HashMap::new(),
                data: HashMap::new(),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                last_checkpoint_time: None,
                last_auto_checkpoint: Instant::now(),
            }),
            cancel: CancellationToken::new(),
            pause_gate: watch::Sender::new(false),
            store,
            auto_checkpoint_interval,
            progress_listeners: Mutex::new(Vec::new()),
            state_listeners: Mutex::new(Vec::new()),
            shared,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Apply a status transition. Returns `true` if the status changed.
    ///
    /// Setting the current status is a silent no-op; transitions outside the
    /// state machine are rejected with a warning.
    pub fn set_status(&self, status: TaskStatus) -> bool {
        let old = {
            let mut state = self.lock();
            let old = state.status;
            if old == status {
                return false;
            }
            if !old.can_transition_to(status) {
                tracing::warn!(
                    task_id = %self.task_id,
                    from = %old,
                    to = %status,
                    "Rejected invalid status transition"
                );
                return false;
            }

            state.status = status;
            let now = Utc::now();
            if status == TaskStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            } else if status.is_terminal() {
                state.completed_at = Some(now);
            }
            old
        };

        tracing::info!(task_id = %self.task_id, from = %old, to = %status, "Task status changed");

        let mut listeners = lock_list(&self.state_listeners).clone();
        listeners.extend(self.shared.state_change());
        dispatch("state change", &self.task_id, &listeners, |l| {
            l(&self.task_id, old, status)
        });
        true
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.lock().metadata.clone()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.lock().metadata.get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.lock().metadata.insert(key.into(), value);
    }

    pub fn data(&self) -> HashMap<String, Value> {
        self.lock().data.clone()
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.lock().data.insert(key.into(), value);
    }

    /// Replace the whole data map.
    pub fn replace_data(&self, data: HashMap<String, Value>) {
        self.lock().data = data;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().completed_at
    }

    pub fn last_checkpoint_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_checkpoint_time
    }

    /// Time since start, up to completion if finished.
    pub fn execution_time(&self) -> Duration {
        self.lock().execution_time()
    }

    /// Persist a snapshot of this context.
    ///
    /// Returns `None` when no store is configured, or when `force` is false
    /// and the auto-checkpoint interval has not elapsed.
    pub async fn create_checkpoint(&self, force: bool) -> Result<Option<String>, CheckpointError> {
        let Some(store) = &self.store else {
            tracing::debug!(task_id = %self.task_id, "No checkpoint store, skipping checkpoint");
            return Ok(None);
        };

        let state_data = {
            let state = self.lock();
            if !force
                && !self.auto_checkpoint_interval.is_zero()
                && state.last_auto_checkpoint.elapsed() < self.auto_checkpoint_interval
            {
                tracing::debug!(task_id = %self.task_id, "Checkpoint interval not elapsed");
                return Ok(None);
            }
            json!({
                "status": state.status,
                "metadata": state.metadata,
                "data": state.data,
                "created_at": state.created_at.to_rfc3339(),
                "started_at": state.started_at.map(|t| t.to_rfc3339()),
                "execution_time": state.execution_time().as_secs_f64(),
            })
        };

        let checkpoint_id = store.create(&self.task_id, state_data).await?;
        if checkpoint_id.is_empty() {
            return Err(CheckpointError::EmptyId {
                task_id: self.task_id.clone(),
            });
        }

        {
            let mut state = self.lock();
            state.last_auto_checkpoint = Instant::now();
            state.last_checkpoint_time = Some(Utc::now());
        }

        tracing::info!(task_id = %self.task_id, checkpoint_id = %checkpoint_id, force, "Checkpoint created");
        Ok(Some(checkpoint_id))
    }

    /// Overwrite status, metadata, data and timestamps from a checkpoint.
    ///
    /// The status is restored verbatim, bypassing the transition check. Any
    /// failure leaves the context untouched.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<(), CheckpointError> {
        let Some(store) = &self.store else {
            return Err(CheckpointError::Unavailable);
        };
        if checkpoint_id.is_empty() {
            return Err(CheckpointError::InvalidArgument(
                "checkpoint_id cannot be empty".to_string(),
            ));
        }

        let state_data = store.restore(checkpoint_id).await?;
        let fields = match state_data.as_object() {
            Some(map) if !map.is_empty() => map,
            _ => {
                return Err(CheckpointError::InvalidState(format!(
                    "checkpoint {checkpoint_id} has no state"
                )));
            }
        };

        let status = match fields.get("status").and_then(Value::as_str) {
            Some(raw) => raw.parse::<TaskStatus>().map_err(CheckpointError::InvalidState)?,
            None => TaskStatus::Pending,
        };
        let metadata = object_field(fields.get("metadata"));
        let data = object_field(fields.get("data"));
        let created_at = timestamp_field(fields.get("created_at"), "created_at")?;
        let started_at = timestamp_field(fields.get("started_at"), "started_at")?;

        {
            let mut state = self.lock();
            state.status = status;
            state.metadata = metadata;
            state.data = data;
            if let Some(created_at) = created_at {
                state.created_at = created_at;
            }
            if let Some(started_at) = started_at {
                state.started_at = Some(started_at);
            }
        }

        tracing::info!(task_id = %self.task_id, checkpoint_id = %checkpoint_id, "Checkpoint restored");
        Ok(())
    }

    /// Publish progress to listeners. Exact multiples of 25 also request an
    /// automatic checkpoint, subject to the checkpoint interval.
    pub async fn report_progress(
        &self,
        progress: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), CheckpointError> {
        let pct = progress.clamp(0, 100) as u8;
        let report = TaskProgress {
            task_id: self.task_id.clone(),
            progress: pct,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        };

        let mut listeners = lock_list(&self.progress_listeners).clone();
        listeners.extend(self.shared.progress());
        dispatch("progress", &self.task_id, &listeners, |l| l(&report));

        if pct % 25 == 0 {
            self.create_checkpoint(false).await?;
        }

        tracing::debug!(task_id = %self.task_id, progress = pct, message = %report.message, "Task progress");
        Ok(())
    }

    pub fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn should_pause(&self) -> bool {
        *self.pause_gate.borrow()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Block until the pause gate opens or the task is cancelled.
    pub async fn wait_if_paused(&self) {
        if !self.should_pause() {
            return;
        }
        tracing::debug!(task_id = %self.task_id, "Task paused, waiting");
        let mut rx = self.pause_gate.subscribe();
        tokio::select! {
            _ = rx.wait_for(|paused| !*paused) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// [`wait_if_paused`](Self::wait_if_paused) for blocking executors.
    pub fn wait_if_paused_blocking(&self) {
        if !self.should_pause() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.block_on(self.wait_if_paused());
        }
    }

    pub fn add_progress_listener(&self, listener: ProgressListener) {
        lock_list(&self.progress_listeners).push(listener);
    }

    pub fn add_state_change_listener(&self, listener: StateChangeListener) {
        lock_list(&self.state_listeners).push(listener);
    }

    /// Whether per-task listeners are attached. Engine-wide listeners don't count.
    pub fn has_active_listeners(&self) -> bool {
        !lock_list(&self.progress_listeners).is_empty()
            || !lock_list(&self.state_listeners).is_empty()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock();
        ContextSnapshot {
            task_id: self.task_id.clone(),
            status: state.status,
            metadata: state.metadata.clone(),
            data: state.data.clone(),
            should_cancel: self.should_cancel(),
            should_pause: self.should_pause(),
            created_at: state.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            last_checkpoint_time: state.last_checkpoint_time,
            execution_time: state.execution_time().as_secs_f64(),
        }
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fire the cancellation signal and move to CANCELLED.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
        self.set_status(TaskStatus::Cancelled);
        tracing::info!(task_id = %self.task_id, "Task cancelled");
    }

    /// Close the pause gate. Only a RUNNING task can be paused.
    pub(crate) fn pause(&self) -> bool {
        if self.status() != TaskStatus::Running {
            return false;
        }
        self.pause_gate.send_replace(true);
        self.set_status(TaskStatus::Paused);
        tracing::info!(task_id = %self.task_id, "Task paused");
        true
    }

    /// Reopen the pause gate.
    pub(crate) fn resume(&self) {
        self.pause_gate.send_replace(false);
        if self.status() == TaskStatus::Paused {
            self.set_status(TaskStatus::Running);
        }
        tracing::info!(task_id = %self.task_id, "Task resumed");
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock_list<L>(list: &Mutex<Vec<L>>) -> MutexGuard<'_, Vec<L>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

fn object_field(value: Option<&Value>) -> HashMap<String, Value> {
    value
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn timestamp_field(
    value: Option<&Value>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, CheckpointError> {
    match value.and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| CheckpointError::InvalidState(format!("invalid {name} {raw:?}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::task::checkpoint::FileCheckpointStore;

    fn file_store(dir: &TempDir) -> Arc<dyn CheckpointStore> {
        Arc::new(FileCheckpointStore::new(dir.path()))
    }

    #[test]
    fn status_timestamps_follow_transitions() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        assert_eq!(ctx.status(), TaskStatus::Pending);
        assert!(ctx.started_at().is_none());

        assert!(ctx.set_status(TaskStatus::Running));
        assert!(ctx.started_at().is_some());
        assert!(ctx.completed_at().is_none());

        assert!(ctx.set_status(TaskStatus::Completed));
        assert!(ctx.completed_at().is_some());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        assert!(!ctx.set_status(TaskStatus::Completed));
        assert_eq!(ctx.status(), TaskStatus::Pending);
        assert!(!ctx.set_status(TaskStatus::Pending));
    }

    #[test]
    fn state_listeners_see_old_and_new() {
        let shared = Arc::new(TaskListeners::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        shared.add_state_change(Arc::new(move |_, from, to| {
            sink.lock().unwrap().push((from, to));
            Ok(())
        }));
        let ctx = TaskContext::with_shared_listeners("t1", None, Duration::ZERO, shared);

        ctx.set_status(TaskStatus::Running);
        ctx.set_status(TaskStatus::Failed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TaskStatus::Pending, TaskStatus::Running),
                (TaskStatus::Running, TaskStatus::Failed)
            ]
        );
        assert!(!ctx.has_active_listeners());
    }

    #[test]
    fn per_task_listeners_count_as_active() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        assert!(!ctx.has_active_listeners());
        ctx.add_progress_listener(Arc::new(|_| Ok(())));
        assert!(ctx.has_active_listeners());
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_on_fresh_context() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let ctx = TaskContext::new("t1", Some(store.clone()), Duration::ZERO);
        ctx.set_status(TaskStatus::Running);
        ctx.set_metadata("owner", json!("alice"));
        ctx.set_data("cursor", json!(42));
        let id = ctx.create_checkpoint(true).await.unwrap().unwrap();
        assert!(ctx.last_checkpoint_time().is_some());

        let fresh = TaskContext::new("t1", Some(store), Duration::ZERO);
        fresh.restore_checkpoint(&id).await.unwrap();
        assert_eq!(fresh.status(), TaskStatus::Running);
        assert_eq!(fresh.metadata(), ctx.metadata());
        assert_eq!(fresh.data(), ctx.data());
        assert_eq!(fresh.started_at(), ctx.started_at());
    }

    #[tokio::test]
    async fn checkpoint_without_store() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        assert!(ctx.create_checkpoint(true).await.unwrap().is_none());
        assert!(matches!(
            ctx.restore_checkpoint("anything").await,
            Err(CheckpointError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn restore_failures_propagate() {
        let dir = TempDir::new().unwrap();
        let ctx = TaskContext::new("t1", Some(file_store(&dir)), Duration::ZERO);
        assert!(matches!(
            ctx.restore_checkpoint("").await,
            Err(CheckpointError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.restore_checkpoint("missing").await,
            Err(CheckpointError::NotFound { .. })
        ));
        assert_eq!(ctx.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn auto_checkpoint_respects_interval() {
        let dir = TempDir::new().unwrap();
        let ctx = TaskContext::new("t1", Some(file_store(&dir)), Duration::from_secs(3600));
        assert!(ctx.create_checkpoint(false).await.unwrap().is_none());
        assert!(ctx.create_checkpoint(true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn progress_checkpoints_on_exact_quarters() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        let ctx = TaskContext::new("t1", Some(store.clone()), Duration::ZERO);

        ctx.report_progress(10, "ten", None).await.unwrap();
        assert_eq!(store.list("t1").await.unwrap().len(), 0);

        ctx.report_progress(25, "quarter", None).await.unwrap();
        assert_eq!(store.list("t1").await.unwrap().len(), 1);

        ctx.report_progress(26, "past quarter", None).await.unwrap();
        assert_eq!(store.list("t1").await.unwrap().len(), 1);

        // Clamped to 100.
        ctx.report_progress(250, "done", None).await.unwrap();
        assert_eq!(store.list("t1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn progress_listener_failure_is_isolated() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        ctx.add_progress_listener(Arc::new(|_| anyhow::bail!("broken listener")));
        let (h, l) = (hits.clone(), last.clone());
        ctx.add_progress_listener(Arc::new(move |p| {
            h.fetch_add(1, Ordering::SeqCst);
            l.store(p.progress as usize, Ordering::SeqCst);
            Ok(())
        }));

        ctx.report_progress(-5, "below zero", None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resume() {
        let ctx = Arc::new(TaskContext::new("t1", None, Duration::ZERO));
        assert!(!ctx.pause());
        ctx.set_status(TaskStatus::Running);
        assert!(ctx.pause());
        assert!(ctx.should_pause());
        assert_eq!(ctx.status(), TaskStatus::Paused);

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ctx.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.status(), TaskStatus::Running);
    }

    #[tokio::test]
    async fn cancel_releases_paused_waiter() {
        let ctx = Arc::new(TaskContext::new("t1", None, Duration::ZERO));
        ctx.set_status(TaskStatus::Running);
        ctx.pause();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_if_paused().await })
        };
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.should_cancel());
        assert_eq!(ctx.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn snapshot_reflects_state() {
        let ctx = TaskContext::new("t1", None, Duration::ZERO);
        ctx.set_data("k", json!("v"));
        let snap = serde_json::to_value(ctx.snapshot()).unwrap();
        assert_eq!(snap["task_id"], "t1");
        assert_eq!(snap["status"], "pending");
        assert_eq!(snap["data"]["k"], "v");
        assert_eq!(snap["should_cancel"], false);
        assert_eq!(snap["execution_time"], 0.0);
    }
}
