//! Task execution: definitions, contexts, checkpoints, retry and the engine.

pub mod checkpoint;
pub mod context;
pub mod engine;
pub mod retry;
mod scheduler;
pub mod types;

pub use checkpoint::{CheckpointData, CheckpointStore, FileCheckpointStore};
pub use context::{ContextSnapshot, TaskContext};
pub use engine::{EngineStatistics, TaskEngine};
pub use retry::RetryPolicy;
pub use types::{
    Executor, TaskDefinition, TaskError, TaskHandler, TaskParams, TaskProgress, TaskResult,
    TaskStatus,
};
