use std::sync::mpsc;

use ruvltra_engine::Generation;
use thiserror::Error;

pub type TaskId = u64;

/// Typed failure of an admitted (or rejected) task. These are the stable
/// identities a caller can branch on; invalid arguments never reach the
/// pool and are rejected at the protocol boundary instead.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("queue is full ({queued} waiting), retry in ~{retry_after_ms} ms")]
    QueueOverflow { queued: usize, retry_after_ms: u64 },

    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("task cancelled")]
    Cancelled,

    #[error("all backends failed: {message}")]
    Backend { message: String },
}

/// A successful settlement, with full provenance.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: String,
    pub generation: Generation,
}

/// Handle to one admitted task. `wait` blocks until the task settles;
/// every admitted task settles exactly once.
pub struct TaskTicket {
    pub task_id: TaskId,
    pub(crate) receiver: mpsc::Receiver<Result<TaskResult, TaskError>>,
}

impl std::fmt::Debug for TaskTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTicket")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl TaskTicket {
    pub fn wait(self) -> Result<TaskResult, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Cancelled))
    }
}
