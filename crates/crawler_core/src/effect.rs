use crate::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Build the per-task context and start the crawl script.
    StartRun { task_id: TaskId, plugin_id: String },
    /// Cancel the script and reject pending admissions for the task.
    CancelRun { task_id: TaskId },
    /// The task released the execution slot; discard its context.
    EndRun { task_id: TaskId },
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        progress: f64,
        error: Option<String>,
    },
    ProgressChanged { task_id: TaskId, progress: f64 },
    TaskRemoved { task_id: TaskId },
}
