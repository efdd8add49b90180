//! One-shot timers as spawned tokio tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use corehost_runtime::{HostFut, TimerId, Timers};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

#[derive(Default)]
pub struct TokioTimers {
    next: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioTimers {
    /// Timers that have neither fired nor been cleared.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Timers for TokioTimers {
    /// Must be called from within a tokio runtime.
    fn set_timeout(&self, delay: Duration, callback: HostFut<'static, ()>) -> TimerId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let tasks = Arc::clone(&self.tasks);
        // Hold the lock across spawn so a zero delay cannot remove the entry
        // before it is inserted.
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            sleep(delay).await;
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            callback.await;
        });
        guard.insert(id, task);
        debug!(timer = id, delay_ms = delay.as_millis() as u64, "timer set");
        id
    }

    fn clear_timeout(&self, id: TimerId) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = task {
            task.abort();
            debug!(timer = id, "timer cleared");
        }
    }
}
