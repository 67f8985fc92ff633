//! Timer-driven behavior of `EffectHandler`
//!
//! Every (re)arm, pause and removal bumps the record's generation. Scheduled
//! calls capture the generation they were armed with, so a call that outlives
//! its timer (cancel raced the scheduler, or the process restarted) finds a
//! mismatch and is dropped.

use boons_types::EntityId;

use super::definition::EffectDefinition;
use super::handler::{EffectHandler, RemoveOptions};
use crate::clock::{add_secs, secs_between};
use crate::context::Context;
use crate::error::EffectError;
use crate::events::{PresenceSignal, SignalHandler};
use crate::scheduler::{ScheduledCall, TimerHandle, TimerKind};

/// Scheduler handles currently armed for one record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ArmedTimers {
    pub tick: Option<TimerHandle>,
    pub expire: Option<TimerHandle>,
}

impl EffectHandler {
    // ─── Arming ─────────────────────────────────────────────────────────────

    /// Cancel outstanding timers, start a new generation, optionally run the
    /// first tick, then schedule the next tick and expiry.
    ///
    /// Timers are scheduled even when the first tick fails; its error is
    /// returned afterwards.
    pub(super) fn arm(
        &mut self,
        record_key: &str,
        def: &EffectDefinition,
        fire_first_tick: bool,
        ctx: &mut Context,
    ) -> Result<(), EffectError> {
        self.cancel_timers(record_key);
        let Some(record) = self.record_mut(record_key) else {
            return Ok(());
        };
        record.generation = record.generation.wrapping_add(1);
        let ticking = record.is_ticking();

        let ticked = if fire_first_tick && ticking {
            self.fire_tick(record_key, def, true, ctx)
        } else {
            Ok(())
        };
        self.schedule_timers(record_key);
        ticked
    }

    /// Run `on_tick` and advance the tick bookkeeping whether or not the hook
    /// succeeded
    pub(super) fn fire_tick(
        &mut self,
        record_key: &str,
        def: &EffectDefinition,
        is_first: bool,
        ctx: &mut Context,
    ) -> Result<(), EffectError> {
        let ticked = self.run_hook(record_key, "on_tick", def, ctx, |hooks, hook, ctx| {
            hooks.on_tick(is_first, hook, ctx)
        });
        let now = self.now();
        if let Some(record) = self.record_mut(record_key) {
            record.last_tick_at = now;
            record.tick_count = record.tick_count.saturating_add(1);
        }
        ticked
    }

    fn timer_call(&self, record_key: &str, kind: TimerKind, generation: u64) -> ScheduledCall {
        ScheduledCall {
            owner: self.owner.clone(),
            record_key: record_key.to_string(),
            kind,
            generation,
        }
    }

    /// Schedule expiry and next tick from the record's current state
    fn schedule_timers(&mut self, record_key: &str) {
        let now = self.now();
        let Some(record) = self.records.as_ref().and_then(|records| records.get(record_key)) else {
            return;
        };
        if record.paused || record.is_depleted() {
            return;
        }
        let expire_in = record.remaining(now);
        let tick_in = record.time_to_next_tick(now);
        let generation = record.generation;

        let expire = expire_in.map(|delay| {
            let call = self.timer_call(record_key, TimerKind::Expire, generation);
            self.services.scheduler.schedule_after(delay, call, true)
        });
        let tick = tick_in.map(|delay| {
            let call = self.timer_call(record_key, TimerKind::Tick, generation);
            self.services.scheduler.schedule_after(delay, call, true)
        });
        self.timers
            .insert(record_key.to_string(), ArmedTimers { tick, expire });
    }

    /// Replace the tick timer after a tick fired; expiry is left alone
    fn schedule_next_tick(&mut self, record_key: &str) {
        let Some(record) = self.records.as_ref().and_then(|records| records.get(record_key)) else {
            return;
        };
        if record.paused || record.is_depleted() || !record.is_ticking() {
            return;
        }
        let call = self.timer_call(record_key, TimerKind::Tick, record.generation);
        let handle = self
            .services
            .scheduler
            .schedule_after(record.tick_interval, call, true);

        let armed = self.timers.entry(record_key.to_string()).or_default();
        if let Some(previous) = armed.tick.replace(handle) {
            self.services.scheduler.cancel(previous);
        }
    }

    pub(super) fn cancel_timers(&mut self, record_key: &str) {
        if let Some(armed) = self.timers.remove(record_key) {
            for handle in [armed.tick, armed.expire].into_iter().flatten() {
                self.services.scheduler.cancel(handle);
            }
        }
    }

    /// Cancel every timer this handler armed. Records keep their state, so
    /// `rearm` can pick them up again.
    pub fn disarm(&mut self) {
        let keys: Vec<String> = self.timers.keys().cloned().collect();
        for key in keys {
            self.cancel_timers(&key);
        }
    }

    /// Reschedule timers for every active record from persisted state, as
    /// after a restart. Ticks missed while down are not replayed (at most one
    /// fires right away) and overdue expiries fire immediately.
    pub fn rearm(&mut self) -> Result<usize, EffectError> {
        self.ensure_loaded()?;
        let keys: Vec<String> = self
            .records
            .as_ref()
            .map(|records| {
                records
                    .values()
                    .filter(|r| !r.paused && self.services.registry.contains(&r.definition_key))
                    .map(|r| r.record_key.clone())
                    .collect()
            })
            .unwrap_or_default();

        for key in &keys {
            self.cancel_timers(key);
            if let Some(record) = self.record_mut(key) {
                record.generation = record.generation.wrapping_add(1);
            }
            self.schedule_timers(key);
        }
        if !keys.is_empty() {
            self.save()?;
        }
        tracing::debug!(owner = %self.owner, armed = keys.len(), "Re-armed effect timers");
        Ok(keys.len())
    }

    // ─── Scheduler callbacks ────────────────────────────────────────────────

    /// Entry point for fired timers. Calls for other owners, missing or
    /// paused records, or an old generation are discarded.
    pub fn handle_timer(&mut self, call: &ScheduledCall, ctx: &mut Context) -> Result<(), EffectError> {
        if !self.is_owned_by(&call.owner) {
            tracing::debug!(owner = %self.owner, target = %call.owner, "Ignoring timer for another owner");
            return Ok(());
        }
        self.ensure_loaded()?;

        let live = self
            .records
            .as_ref()
            .and_then(|records| records.get(&call.record_key))
            .is_some_and(|r| !r.paused && r.generation == call.generation);
        if !live {
            tracing::debug!(
                owner = %self.owner,
                record = %call.record_key,
                kind = ?call.kind,
                generation = call.generation,
                "Discarding stale timer"
            );
            return Ok(());
        }

        match call.kind {
            TimerKind::Tick => self.tick_due(&call.record_key, ctx),
            TimerKind::Expire => self.expire_due(&call.record_key, ctx),
        }
    }

    fn tick_due(&mut self, record_key: &str, ctx: &mut Context) -> Result<(), EffectError> {
        let now = self.now();
        let Some((definition_key, spent)) = self
            .record_mut(record_key)
            .map(|r| (r.definition_key.clone(), r.is_spent(now)))
        else {
            return Ok(());
        };
        let Some(def) = self.definition(&definition_key) else {
            return self.cleanup(ctx).map(|_| ());
        };
        if spent {
            tracing::debug!(owner = %self.owner, record = record_key, "Skipping tick for spent effect");
            return Ok(());
        }

        let ticked = self.fire_tick(record_key, &def, false, ctx);
        self.schedule_next_tick(record_key);
        self.save()?;
        ticked
    }

    fn expire_due(&mut self, record_key: &str, ctx: &mut Context) -> Result<(), EffectError> {
        let expired = self.remove_loaded(record_key, RemoveOptions::expire(), ctx);
        let cleaned = match expired {
            Ok(_) => self.cleanup(ctx).map(|_| ()),
            Err(e) => Err(e),
        };
        self.save()?;
        cleaned
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pause / resume
    // ═══════════════════════════════════════════════════════════════════════

    /// Freeze a record's duration and tick countdown. Returns false for
    /// unknown or already-paused records.
    pub fn pause(&mut self, record_key: &str, ctx: &mut Context) -> Result<bool, EffectError> {
        self.ensure_loaded()?;
        let now = self.now();
        let min_tick = self.services.config.min_tick_resume_secs;
        let Some(record) = self.record_mut(record_key) else {
            return Ok(false);
        };
        if record.paused {
            return Ok(false);
        }

        let remaining_duration = record
            .duration
            .secs()
            .map(|total| (total - secs_between(record.started_at, now)).max(0.0));
        let remaining_to_next_tick = record
            .is_ticking()
            .then(|| (record.tick_interval - secs_between(record.last_tick_at, now)).max(min_tick));

        record.remaining_duration = remaining_duration;
        record.remaining_to_next_tick = remaining_to_next_tick;
        record.paused = true;
        record.generation = record.generation.wrapping_add(1);
        let definition_key = record.definition_key.clone();
        self.cancel_timers(record_key);

        let paused = match self.definition(&definition_key) {
            Some(def) => self.run_hook(record_key, "on_pause", &def, ctx, |hooks, hook, ctx| {
                hooks.on_pause(hook, ctx)
            }),
            None => Ok(()),
        };
        self.save()?;
        tracing::debug!(owner = %self.owner, record = record_key, ?remaining_duration, "Paused effect");
        paused.map(|()| true)
    }

    /// Resume a paused record so that exactly the snapshotted time remains.
    /// Returns false for unknown or unpaused records.
    pub fn unpause(&mut self, record_key: &str, ctx: &mut Context) -> Result<bool, EffectError> {
        self.ensure_loaded()?;
        let now = self.now();
        let Some(record) = self.record_mut(record_key) else {
            return Ok(false);
        };
        if !record.paused {
            return Ok(false);
        }

        if let (Some(total), Some(remaining)) = (record.duration.secs(), record.remaining_duration) {
            record.started_at = add_secs(now, -(total - remaining));
        }
        if record.is_ticking()
            && let Some(to_next) = record.remaining_to_next_tick
        {
            record.last_tick_at = add_secs(now, -(record.tick_interval - to_next));
        }
        record.paused = false;
        record.remaining_duration = None;
        record.remaining_to_next_tick = None;
        let definition_key = record.definition_key.clone();

        let unpaused = match self.definition(&definition_key) {
            Some(def) => {
                self.arm(record_key, &def, false, ctx)?;
                self.run_hook(record_key, "on_unpause", &def, ctx, |hooks, hook, ctx| {
                    hooks.on_unpause(hook, ctx)
                })
            }
            None => Ok(()),
        };
        self.save()?;
        tracing::debug!(owner = %self.owner, record = record_key, "Unpaused effect");
        unpaused.map(|()| true)
    }

    /// Pause every running record whose definition pauses offline
    pub fn pause_all_offline(&mut self, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.offline_keys(false)?;
        let mut paused = 0;
        for key in keys {
            if self.pause(&key, ctx)? {
                paused += 1;
            }
        }
        Ok(paused)
    }

    /// Resume every paused record whose definition pauses offline
    pub fn unpause_all_offline(&mut self, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.offline_keys(true)?;
        let mut resumed = 0;
        for key in keys {
            if self.unpause(&key, ctx)? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    fn offline_keys(&mut self, paused: bool) -> Result<Vec<String>, EffectError> {
        self.ensure_loaded()?;
        let registry = &self.services.registry;
        Ok(self
            .records
            .as_ref()
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.paused == paused)
                    .filter(|r| {
                        registry
                            .get(&r.definition_key)
                            .is_some_and(|d| d.spec.pauses_when_offline)
                    })
                    .map(|r| r.record_key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// React to the owner going offline or coming back. Signals for other
    /// entities are ignored. Returns the number of records paused or resumed.
    pub fn handle_presence(&mut self, signal: &PresenceSignal, ctx: &mut Context) -> Result<usize, EffectError> {
        if !self.is_owned_by(signal.entity()) {
            return Ok(0);
        }
        let changed = match signal {
            PresenceSignal::Offline { .. } => self.pause_all_offline(ctx)?,
            PresenceSignal::Online { .. } => self.unpause_all_offline(ctx)?,
        };
        tracing::debug!(owner = %self.owner, online = signal.is_online(), changed, "Presence changed");
        Ok(changed)
    }

    pub fn is_owned_by(&self, entity: &EntityId) -> bool {
        &self.owner == entity
    }
}

impl SignalHandler for EffectHandler {
    fn handle_signal(&mut self, signal: &PresenceSignal, ctx: &mut Context) -> Result<(), EffectError> {
        self.handle_presence(signal, ctx).map(|_| ())
    }
}
