use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use super::{ScheduledCall, Scheduler, TimerHandle};
use crate::clock::{Clock, add_secs};

/// A timer waiting in a `ManualScheduler`
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTimer {
    pub handle: TimerHandle,
    pub due_at: DateTime<Utc>,
    pub call: ScheduledCall,
    pub persistent: bool,
}

#[derive(Debug, Default)]
struct TimerQueue {
    next_id: u64,
    /// (due, handle) -> timer; handle breaks ties in scheduling order
    timers: BTreeMap<(DateTime<Utc>, u64), PendingTimer>,
    /// handle -> due, for cancellation
    due_index: HashMap<u64, DateTime<Utc>>,
}

/// Polled scheduler: timers fire when the host calls `drain_due`.
///
/// Deadlines are computed from the shared clock at scheduling time. Calls that
/// come due together are returned in deadline order, then scheduling order.
pub struct ManualScheduler {
    clock: Arc<dyn Clock>,
    queue: Mutex<TimerQueue>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.len())
            .finish()
    }
}

impl ManualScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(TimerQueue::default()),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and return every call due at or before the clock's current time
    pub fn drain_due(&self) -> Vec<ScheduledCall> {
        let now = self.clock.now();
        let mut queue = self.queue();
        let mut due = Vec::new();
        while let Some(entry) = queue.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            queue.due_index.remove(&timer.handle.0);
            due.push(timer.call);
        }
        due
    }

    /// Deadline of the earliest pending timer
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue().timers.keys().next().map(|(due, _)| *due)
    }

    /// Snapshot of all pending timers in firing order
    pub fn pending(&self) -> Vec<PendingTimer> {
        self.queue().timers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending timer, as a process restart would
    pub fn clear(&self) {
        let mut queue = self.queue();
        queue.timers.clear();
        queue.due_index.clear();
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay_secs: f64, call: ScheduledCall, persistent: bool) -> TimerHandle {
        let due_at = add_secs(self.clock.now(), delay_secs.max(0.0));
        let mut queue = self.queue();
        let id = queue.next_id;
        queue.next_id += 1;
        let handle = TimerHandle(id);
        queue.due_index.insert(id, due_at);
        queue.timers.insert(
            (due_at, id),
            PendingTimer {
                handle,
                due_at,
                call,
                persistent,
            },
        );
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut queue = self.queue();
        if let Some(due_at) = queue.due_index.remove(&handle.0) {
            queue.timers.remove(&(due_at, handle.0));
        }
    }
}
