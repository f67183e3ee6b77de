use crate::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulerView {
    pub running: Option<TaskId>,
    pub queued: Vec<TaskId>,
    pub tasks: Vec<Task>,
    pub dirty: bool,
}

impl SchedulerView {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }
}
