use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crawler_core::TaskId;
use engine_logging::engine_task_log;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::CrawlError;

/// Download limits for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_concurrency: usize,
    pub interval_ms: u64,
}

/// Authorises exactly one download. Dropping it frees the concurrency slot.
pub struct AdmissionTicket {
    task_id: TaskId,
    native_interception: bool,
    granted_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Whether the host can redirect a browser-initiated download to a chosen path.
    pub fn native_interception(&self) -> bool {
        self.native_interception
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

impl fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("task_id", &self.task_id)
            .field("native_interception", &self.native_interception)
            .finish()
    }
}

struct TaskGate {
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
    interval_ms: AtomicU64,
    /// Serialises waiters in arrival order and remembers the previous grant.
    /// `tokio::sync::Mutex` is fair, which gives FIFO admission within a task.
    order: tokio::sync::Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl TaskGate {
    fn in_flight(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }
}

/// Per-task admission gates: a concurrency semaphore plus a minimum interval
/// between consecutive grants.
#[derive(Clone)]
pub struct DownloadAdmission {
    gates: Arc<Mutex<HashMap<TaskId, Arc<TaskGate>>>>,
    native_interception: bool,
}

impl DownloadAdmission {
    pub fn new(native_interception: bool) -> Self {
        Self {
            gates: Arc::new(Mutex::new(HashMap::new())),
            native_interception,
        }
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<TaskGate>>> {
        self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, task_id: &str) -> Option<Arc<TaskGate>> {
        self.gates().get(task_id).cloned()
    }

    /// Opens (or replaces) the gate for a task. Cancelling `cancel` rejects every waiter.
    pub fn open(&self, task_id: &str, limits: AdmissionLimits, cancel: CancellationToken) {
        let max_concurrency = limits.max_concurrency.max(1);
        let gate = TaskGate {
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            interval_ms: AtomicU64::new(limits.interval_ms),
            order: tokio::sync::Mutex::new(None),
            cancel,
        };
        if let Some(previous) = self.gates().insert(task_id.to_string(), Arc::new(gate)) {
            previous.cancel.cancel();
        }
    }

    /// Rejects all waiters and forgets the gate. Tickets already granted stay valid.
    pub fn close(&self, task_id: &str) {
        if let Some(gate) = self.gates().remove(task_id) {
            gate.cancel.cancel();
        }
    }

    pub fn is_open(&self, task_id: &str) -> bool {
        self.gates().contains_key(task_id)
    }

    pub fn set_interval(&self, task_id: &str, interval_ms: u64) -> Result<(), CrawlError> {
        let gate = self
            .gate(task_id)
            .ok_or_else(|| CrawlError::TaskNotRunning(task_id.to_string()))?;
        gate.interval_ms.store(interval_ms, Ordering::Relaxed);
        engine_task_log!(log::Level::Debug, task_id, "download interval set to {} ms", interval_ms);
        Ok(())
    }

    /// Downloads of `task_id` currently holding a ticket.
    pub fn in_flight(&self, task_id: &str) -> usize {
        self.gate(task_id).map_or(0, |gate| gate.in_flight())
    }

    /// Waits until the task has a free download slot and its interval has elapsed.
    ///
    /// Waiters are served in arrival order. If the task is stopped while waiting,
    /// returns [`CrawlError::AdmissionCancelled`].
    pub async fn prepare(&self, task_id: &str) -> Result<AdmissionTicket, CrawlError> {
        let gate = self
            .gate(task_id)
            .ok_or_else(|| CrawlError::TaskNotRunning(task_id.to_string()))?;
        let cancelled = || CrawlError::AdmissionCancelled {
            task_id: task_id.to_string(),
        };
        if gate.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let wait = async {
            let mut last_grant = gate.order.lock().await;
            let permit = gate
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| cancelled())?;

            if let Some(previous) = *last_grant {
                let interval = Duration::from_millis(gate.interval_ms.load(Ordering::Relaxed));
                tokio::time::sleep_until(previous + interval).await;
            }
            let granted_at = Instant::now();
            *last_grant = Some(granted_at);
            Ok::<_, CrawlError>((permit, granted_at))
        };

        let (permit, granted_at) = tokio::select! {
            biased;
            _ = gate.cancel.cancelled() => return Err(cancelled()),
            result = wait => result?,
        };

        Ok(AdmissionTicket {
            task_id: task_id.to_string(),
            native_interception: self.native_interception,
            granted_at,
            _permit: permit,
        })
    }
}

impl fmt::Debug for DownloadAdmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadAdmission")
            .field("tasks", &self.gates().len())
            .field("native_interception", &self.native_interception)
            .finish()
    }
}
