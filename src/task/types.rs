//! Task data model: status machine, definitions, results, progress and errors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionError};
use crate::task::context::TaskContext;
use crate::task::retry::RetryPolicy;

/// Opaque key/value map handed to executors and stored on contexts.
pub type TaskParams = HashMap<String, serde_json::Value>;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for a dispatch slot.
    Pending,
    /// Executing.
    Running,
    /// Executing, but blocked on the pause gate.
    Paused,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
    /// Deadline exceeded.
    Timeout,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            (Running, Timeout) | (Running, Paused) |
            // From Paused
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Trait form of an async unit of work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        params: TaskParams,
        ctx: Arc<TaskContext>,
    ) -> Result<serde_json::Value, ExecutionError>;
}

pub type AsyncExecutorFn = Arc<
    dyn Fn(TaskParams, Arc<TaskContext>) -> BoxFuture<'static, Result<serde_json::Value, ExecutionError>>
        + Send
        + Sync,
>;
pub type BlockingExecutorFn =
    Arc<dyn Fn(TaskParams, Arc<TaskContext>) -> Result<serde_json::Value, ExecutionError> + Send + Sync>;

/// The unit of work, tagged with its execution mode.
///
/// `Async` runs on the tokio runtime with a `tokio::time::timeout` deadline.
/// `Blocking` runs on the blocking pool; its deadline is watched by a separate
/// supervisor because a blocking call cannot be preempted. Blocking executors
/// that need to await context operations can use
/// `tokio::runtime::Handle::current().block_on(..)` from inside the closure.
#[derive(Clone)]
pub enum Executor {
    Async(AsyncExecutorFn),
    Blocking(BlockingExecutorFn),
}

impl Executor {
    /// Wrap an async closure.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskParams, Arc<TaskContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |params, ctx| Box::pin(f(params, ctx))))
    }

    /// Wrap a blocking closure.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskParams, Arc<TaskContext>) -> Result<serde_json::Value, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Wrap a [`TaskHandler`].
    pub fn from_handler(handler: Arc<dyn TaskHandler>) -> Self {
        Self::Async(Arc::new(move |params, ctx| {
            let handler = handler.clone();
            Box::pin(async move { handler.run(params, ctx).await })
        }))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async(_) => f.write_str("Executor::Async"),
            Self::Blocking(_) => f.write_str("Executor::Blocking"),
        }
    }
}

/// A submitted unit of work. Immutable once handed to the engine.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub executor: Option<Executor>,
    pub parameters: TaskParams,
    /// 1–10, higher is more important. Stored and reported, not used for dispatch.
    pub priority: u8,
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    /// Create a definition with a generated id and default retry policy.
    pub fn new(name: impl Into<String>, executor: Executor) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut name = name.into();
        if name.is_empty() {
            name = default_name(&id);
        }
        Self {
            id,
            name,
            description: String::new(),
            executor: Some(executor),
            parameters: TaskParams::new(),
            priority: 5,
            timeout: None,
            retry_policy: RetryPolicy::default(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: TaskParams) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

fn default_name(id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("Task-{prefix}")
}

/// Outcome of a task. Produced once per terminal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(serialize_with = "duration_secs")]
    pub execution_time: Duration,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            result: None,
            error: None,
            error_kind: None,
            execution_time: Duration::ZERO,
            attempts: 1,
            started_at: None,
            completed_at: Some(Utc::now()),
            metadata: HashMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

fn duration_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Progress report emitted by a running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    /// Percentage, clamped to 0–100.
    pub progress: u8,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Payload delivered to error listeners.
#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub task_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub retry_count: u32,
}

impl TaskError {
    pub fn from_execution(task_id: &str, error: &ExecutionError, retry_count: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            error_kind: error.kind(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
            recoverable: error.is_recoverable(),
            retry_count,
        }
    }
}
