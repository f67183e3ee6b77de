use crate::{Effect, Msg, RunOutcome, SchedulerState, TaskStatus, PROGRESS_CEILING};

/// Pure update function: applies a message to state and returns any effects.
pub fn update(mut state: SchedulerState, msg: Msg) -> (SchedulerState, Vec<Effect>) {
    let mut effects = Vec::new();
    match msg {
        Msg::Enqueue {
            task_id,
            plugin_id,
            now,
        } => {
            if state.admit_to_queue(&task_id, &plugin_id, now) {
                push_status(&state, &task_id, &mut effects);
                promote(&mut state, now, &mut effects);
            }
        }
        Msg::StopRequested { task_id, now } => {
            stop(&mut state, &task_id, now, &mut effects);
        }
        Msg::DeleteRequested { task_id, now } => {
            let holds_slot = state
                .task(&task_id)
                .is_some_and(|task| task.status.holds_slot());
            if holds_slot {
                state.schedule_delete(&task_id);
                stop(&mut state, &task_id, now, &mut effects);
            } else if state.remove_task(&task_id).is_some() {
                effects.push(Effect::TaskRemoved { task_id });
            }
        }
        Msg::RunFinished {
            task_id,
            outcome,
            now,
        } => {
            if state.running().map(String::as_str) != Some(task_id.as_str()) {
                // Stale report for a run that no longer holds the slot.
                return (state, effects);
            }
            if let Some(task) = state.task_mut(&task_id) {
                let (status, error) = match (task.status, outcome) {
                    (TaskStatus::Stopping, _) | (_, RunOutcome::Cancelled) => {
                        (TaskStatus::Stopped, None)
                    }
                    (_, RunOutcome::Completed) => (TaskStatus::Completed, None),
                    (_, RunOutcome::Failed(message)) => (TaskStatus::Failed, Some(message)),
                };
                task.status = status;
                task.error = error;
                task.end_time = Some(now);
                if status == TaskStatus::Completed {
                    task.progress = 100.0;
                }
            }
            state.mark_dirty();
            push_status(&state, &task_id, &mut effects);
            state.release_slot();
            effects.push(Effect::EndRun {
                task_id: task_id.clone(),
            });
            if state.take_scheduled_delete(&task_id) && state.remove_task(&task_id).is_some() {
                effects.push(Effect::TaskRemoved { task_id });
            }
            promote(&mut state, now, &mut effects);
        }
        Msg::ProgressAdded { task_id, delta } => {
            if !delta.is_finite() || delta <= 0.0 {
                return (state, effects);
            }
            if let Some(task) = state.task_mut(&task_id) {
                if task.status.holds_slot() {
                    let next = (task.progress + delta).min(PROGRESS_CEILING);
                    if next > task.progress {
                        task.progress = next;
                        effects.push(Effect::ProgressChanged {
                            task_id,
                            progress: next,
                        });
                        state.mark_dirty();
                    }
                }
            }
        }
        Msg::ImagesDeleted { task_id, count } => {
            if let Some(task) = state.task_mut(&task_id) {
                task.deleted_count = task.deleted_count.saturating_add(count);
                state.mark_dirty();
            }
        }
        Msg::NoOp => {}
    }

    (state, effects)
}

fn stop(state: &mut SchedulerState, task_id: &str, now: u64, effects: &mut Vec<Effect>) {
    let Some(task) = state.task_mut(task_id) else {
        return;
    };
    match task.status {
        TaskStatus::Queued => {
            task.status = TaskStatus::Stopped;
            task.end_time = Some(now);
            state.remove_from_queue(task_id);
            state.mark_dirty();
            push_status(state, task_id, effects);
        }
        TaskStatus::Running => {
            task.status = TaskStatus::Stopping;
            state.mark_dirty();
            push_status(state, task_id, effects);
            effects.push(Effect::CancelRun {
                task_id: task_id.to_string(),
            });
        }
        TaskStatus::Stopping | TaskStatus::Stopped | TaskStatus::Failed | TaskStatus::Completed => {}
    }
}

fn promote(state: &mut SchedulerState, now: u64, effects: &mut Vec<Effect>) {
    let Some(task) = state.promote_next(now) else {
        return;
    };
    let task_id = task.id.clone();
    let plugin_id = task.plugin_id.clone();
    push_status(state, &task_id, effects);
    effects.push(Effect::StartRun { task_id, plugin_id });
}

fn push_status(state: &SchedulerState, task_id: &str, effects: &mut Vec<Effect>) {
    if let Some(task) = state.task(task_id) {
        effects.push(Effect::StatusChanged {
            task_id: task.id.clone(),
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
        });
    }
}
