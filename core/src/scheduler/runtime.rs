use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{ScheduledCall, Scheduler, TimerHandle};

/// Scheduler backed by tokio timers.
///
/// Each timer is a sleeping task that sends its call down an unbounded
/// channel when it wakes. The receiver is handed back from `new`; feed it to
/// `EffectEngine::pump` (or route calls yourself).
pub struct TokioScheduler {
    runtime: Handle,
    tx: mpsc::UnboundedSender<ScheduledCall>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<ScheduledCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            runtime,
            tx,
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        };
        (scheduler, rx)
    }

    /// Scheduler on the runtime the caller is running in
    pub fn current() -> (Self, mpsc::UnboundedReceiver<ScheduledCall>) {
        Self::new(Handle::current())
    }

    /// Timers still sleeping
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay_secs: f64, call: ScheduledCall, _persistent: bool) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::try_from_secs_f64(delay_secs.max(0.0)).unwrap_or(Duration::MAX);
        let tx = self.tx.clone();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(call).is_err() {
                tracing::debug!("Timer fired after receiver closed");
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.remove(&handle.0) {
            task.abort();
        }
    }
}
