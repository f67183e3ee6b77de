use crate::TaskId;

/// How a task's crawl script run ended, as observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// User queued a crawl. Re-queueing a terminal task starts a new run.
    Enqueue {
        task_id: TaskId,
        plugin_id: String,
        now: u64,
    },
    /// User asked to stop a task.
    StopRequested { task_id: TaskId, now: u64 },
    /// User deleted a task; a running task is stopped first.
    DeleteRequested { task_id: TaskId, now: u64 },
    /// The engine reports the end of a task's script run.
    RunFinished {
        task_id: TaskId,
        outcome: RunOutcome,
        now: u64,
    },
    /// Script reported incremental progress in percent.
    ProgressAdded { task_id: TaskId, delta: f64 },
    /// The catalog removed images that belonged to a task.
    ImagesDeleted { task_id: TaskId, count: u64 },
    NoOp,
}
