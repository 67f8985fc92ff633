//! Delayed-callback adapter
//!
//! Schedulers store plain `ScheduledCall` values instead of closures, so a
//! pending timer is just data: it can be inspected, dropped on restart, and
//! routed back to whichever handler owns the record. The handler decides
//! whether a call is still live by comparing its generation with the
//! record's current one, so `cancel` only needs to be best-effort.

mod manual;
mod runtime;

pub use self::manual::{ManualScheduler, PendingTimer};
pub use self::runtime::TokioScheduler;

use boons_types::EntityId;
use serde::{Deserialize, Serialize};

/// What a scheduled call does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Periodic `on_tick`
    Tick,
    /// Natural end of a timed effect
    Expire,
}

/// A callback target: one record on one entity, at one timer generation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub owner: EntityId,
    pub record_key: String,
    pub kind: TimerKind,
    pub generation: u64,
}

/// Opaque handle returned by `schedule_after`, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

pub trait Scheduler: Send + Sync {
    /// Deliver `call` after `delay_secs`. `persistent` timers are expected to
    /// survive a restart; the engine re-derives them from record state via
    /// `EffectHandler::rearm` rather than trusting handles across restarts.
    fn schedule_after(&self, delay_secs: f64, call: ScheduledCall, persistent: bool) -> TimerHandle;

    /// Best-effort cancellation. Unknown or already-fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}
