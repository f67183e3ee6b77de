use chrono::{DateTime, Local};
use crawler_core::TaskStatus;
use crawler_engine::{DownloadState, EngineEvent};
use engine_logging::{engine_info, engine_warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Download outcomes seen while the engine ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub completed: usize,
    pub failed: usize,
    pub tasks_failed: usize,
}

impl EventSummary {
    pub fn record(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::DownloadState(state) => match state.state {
                DownloadState::Completed => self.completed += 1,
                DownloadState::Failed => self.failed += 1,
                _ => {}
            },
            EngineEvent::TaskStatus {
                status: TaskStatus::Failed,
                ..
            } => self.tasks_failed += 1,
            _ => {}
        }
    }
}

/// One log line per event worth showing; progress ticks and intermediate download
/// states are left out.
pub fn describe(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::TaskStatus {
            task_id,
            status,
            progress,
            error,
        } => Some(match error {
            Some(error) => format!("task {task_id}: {} ({error})", status.as_str()),
            None => format!("task {task_id}: {} at {progress:.1}%", status.as_str()),
        }),
        EngineEvent::TaskRemoved { task_id } => Some(format!("task {task_id}: removed")),
        EngineEvent::DownloadState(state) => match state.state {
            DownloadState::Completed | DownloadState::Failed => {
                let started = DateTime::from_timestamp_millis(state.start_time as i64)
                    .map(|time| time.with_timezone(&Local).format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "?".to_string());
                Some(match &state.error {
                    Some(error) => format!(
                        "[{}] {} {} (started {started}): {error}",
                        state.task_id, state.state, state.url
                    ),
                    None => format!(
                        "[{}] {} {} (started {started})",
                        state.task_id, state.state, state.url
                    ),
                })
            }
            _ => None,
        },
        EngineEvent::ArchiverLog {
            archive_path,
            message,
            ..
        } => Some(format!("archive {}: {message}", archive_path.display())),
        EngineEvent::TaskProgress { .. } => None,
    }
}

/// Logs events until the sending side closes, then returns the tally.
pub fn spawn_event_printer(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) -> JoinHandle<EventSummary> {
    tokio::spawn(async move {
        let mut summary = EventSummary::default();
        while let Some(event) = events.recv().await {
            summary.record(&event);
            let Some(line) = describe(&event) else {
                continue;
            };
            match &event {
                EngineEvent::ArchiverLog { .. } => engine_warn!("{}", line),
                EngineEvent::DownloadState(state) if state.state == DownloadState::Failed => {
                    engine_warn!("{}", line)
                }
                _ => engine_info!("{}", line),
            }
        }
        summary
    })
}
