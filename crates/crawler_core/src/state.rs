use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::view_model::SchedulerView;

pub type TaskId = String;

/// Highest progress a task may report before it completes.
pub const PROGRESS_CEILING: f64 = 99.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Failed | TaskStatus::Completed
        )
    }

    /// Running or stopping: the task holds the single execution slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub plugin_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    /// Milliseconds since the epoch; set on enqueue and refreshed when a run starts.
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub deleted_count: u64,
    pub error: Option<String>,
}

impl Task {
    fn queued(id: TaskId, plugin_id: String, now: u64) -> Self {
        Self {
            id,
            plugin_id,
            status: TaskStatus::Queued,
            progress: 0.0,
            start_time: now,
            end_time: None,
            deleted_count: 0,
            error: None,
        }
    }
}

/// Scheduler state. At most one task holds the execution slot (`running`);
/// every other live task waits in `queue` in FIFO order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulerState {
    tasks: BTreeMap<TaskId, Task>,
    queue: VecDeque<TaskId>,
    running: Option<TaskId>,
    delete_on_stop: BTreeSet<TaskId>,
    dirty: bool,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// The task currently holding the slot (status running or stopping).
    pub fn running(&self) -> Option<&TaskId> {
        self.running.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &TaskId> {
        self.queue.iter()
    }

    pub fn view(&self) -> SchedulerView {
        SchedulerView {
            running: self.running.clone(),
            queued: self.queue.iter().cloned().collect(),
            tasks: self.tasks.values().cloned().collect(),
            dirty: self.dirty,
        }
    }

    /// Returns whether anything changed since the last call and clears the flag.
    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    /// Inserts a fresh task, or resets a terminal one for a new run.
    /// Returns `false` if the task is already queued or holds the slot.
    pub(crate) fn admit_to_queue(&mut self, task_id: &str, plugin_id: &str, now: u64) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => return false,
            Some(task) => {
                task.plugin_id = plugin_id.to_string();
                task.status = TaskStatus::Queued;
                task.progress = 0.0;
                task.start_time = now;
                task.end_time = None;
                task.error = None;
            }
            None => {
                self.tasks.insert(
                    task_id.to_string(),
                    Task::queued(task_id.to_string(), plugin_id.to_string(), now),
                );
            }
        }
        self.queue.push_back(task_id.to_string());
        self.dirty = true;
        true
    }

    pub(crate) fn remove_from_queue(&mut self, task_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != task_id);
        before != self.queue.len()
    }

    pub(crate) fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        self.remove_from_queue(task_id);
        self.delete_on_stop.remove(task_id);
        if self.running.as_deref() == Some(task_id) {
            self.running = None;
        }
        let removed = self.tasks.remove(task_id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub(crate) fn schedule_delete(&mut self, task_id: &str) {
        self.delete_on_stop.insert(task_id.to_string());
    }

    pub(crate) fn take_scheduled_delete(&mut self, task_id: &str) -> bool {
        self.delete_on_stop.remove(task_id)
    }

    pub(crate) fn release_slot(&mut self) -> Option<TaskId> {
        self.running.take()
    }

    /// Pops the next queued task into the slot if the slot is free.
    pub(crate) fn promote_next(&mut self, now: u64) -> Option<&Task> {
        if self.running.is_some() {
            return None;
        }
        while let Some(next) = self.queue.pop_front() {
            let Some(task) = self.tasks.get_mut(&next) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            task.status = TaskStatus::Running;
            task.progress = 0.0;
            task.start_time = now;
            task.end_time = None;
            self.running = Some(next.clone());
            self.dirty = true;
            return self.tasks.get(&next);
        }
        None
    }
}
