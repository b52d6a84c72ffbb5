//! Typed listener callbacks and the dispatch helper shared by both engines.
//!
//! Every listener returns `anyhow::Result<()>`. A listener that errors or
//! panics is logged and skipped; the remaining listeners still run and the
//! caller never sees the failure.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::ConnectionState;
use crate::task::{TaskError, TaskProgress, TaskResult, TaskStatus};

pub type ProgressListener = Arc<dyn Fn(&TaskProgress) -> anyhow::Result<()> + Send + Sync>;
pub type StateChangeListener =
    Arc<dyn Fn(&str, TaskStatus, TaskStatus) -> anyhow::Result<()> + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&TaskError) -> anyhow::Result<()> + Send + Sync>;
pub type CompletionListener = Arc<dyn Fn(&TaskResult) -> anyhow::Result<()> + Send + Sync>;

pub type ConnectionStateListener =
    Arc<dyn Fn(&str, ConnectionState, ConnectionState) -> anyhow::Result<()> + Send + Sync>;
pub type HeartbeatListener = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Engine-global task listeners, fanned out to every context.
///
/// Kept separate from per-task listeners: these never pin a finished task
/// in the registry.
#[derive(Default)]
pub struct TaskListeners {
    progress: RwLock<Vec<ProgressListener>>,
    state_change: RwLock<Vec<StateChangeListener>>,
    error: RwLock<Vec<ErrorListener>>,
    completion: RwLock<Vec<CompletionListener>>,
}

impl TaskListeners {
    pub fn add_progress(&self, listener: ProgressListener) {
        push(&self.progress, listener);
    }

    pub fn add_state_change(&self, listener: StateChangeListener) {
        push(&self.state_change, listener);
    }

    pub fn add_error(&self, listener: ErrorListener) {
        push(&self.error, listener);
    }

    pub fn add_completion(&self, listener: CompletionListener) {
        push(&self.completion, listener);
    }

    pub fn progress(&self) -> Vec<ProgressListener> {
        snapshot(&self.progress)
    }

    pub fn state_change(&self) -> Vec<StateChangeListener> {
        snapshot(&self.state_change)
    }

    pub fn error(&self) -> Vec<ErrorListener> {
        snapshot(&self.error)
    }

    pub fn completion(&self) -> Vec<CompletionListener> {
        snapshot(&self.completion)
    }
}

fn push<L>(list: &RwLock<Vec<L>>, listener: L) {
    list.write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(listener);
}

// Clone out so callbacks run without the lock held.
fn snapshot<L: Clone>(list: &RwLock<Vec<L>>) -> Vec<L> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Invoke each listener in order, isolating failures.
///
/// `kind` and `subject` only feed the log line (e.g. "progress", task id).
pub fn dispatch<L, F>(kind: &str, subject: &str, listeners: &[L], mut call: F)
where
    F: FnMut(&L) -> anyhow::Result<()>,
{
    for (idx, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| call(listener))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    listener = idx,
                    subject = %subject,
                    error = %e,
                    "{} listener failed", kind
                );
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                tracing::error!(
                    listener = idx,
                    subject = %subject,
                    panic = %msg,
                    "{} listener panicked", kind
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
