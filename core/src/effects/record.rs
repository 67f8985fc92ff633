//! Runtime state of one applied effect

use boons_types::{EffectDuration, EffectSpec, EntityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::secs_between;

/// Persisted state of one applied effect instance on one entity.
///
/// Times are stored as absolute timestamps; while paused, the
/// `remaining_*` snapshots are authoritative and the timestamps are
/// rewritten on unpause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectRecord {
    pub record_key: String,
    pub definition_key: String,
    pub stacks: i32,

    // ─── Timing ─────────────────────────────────────────────────────────────
    pub started_at: DateTime<Utc>,
    pub duration: EffectDuration,
    pub tick_interval: f64,
    pub last_tick_at: DateTime<Utc>,

    // ─── Pause state ────────────────────────────────────────────────────────
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_to_next_tick: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EntityId>,
    #[serde(default)]
    pub side_data: Map<String, Value>,

    /// Timer epoch; scheduled calls carrying another value are stale
    #[serde(default)]
    pub generation: u64,
    /// `on_tick` invocations so far
    #[serde(default)]
    pub tick_count: u32,
}

impl EffectRecord {
    /// Fresh record for `spec`, started at `now` with one stack
    pub fn new(record_key: impl Into<String>, spec: &EffectSpec, now: DateTime<Utc>) -> Self {
        Self {
            record_key: record_key.into(),
            definition_key: spec.key.clone(),
            stacks: 1,
            started_at: now,
            duration: spec.duration,
            tick_interval: spec.tick_interval,
            last_tick_at: now,
            paused: false,
            remaining_duration: None,
            remaining_to_next_tick: None,
            source: None,
            side_data: Map::new(),
            generation: 0,
            tick_count: 0,
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.tick_interval > 0.0
    }

    /// Seconds of duration consumed so far (pauses excluded)
    pub fn elapsed(&self, now: DateTime<Utc>) -> f64 {
        match (self.paused, self.duration, self.remaining_duration) {
            (true, EffectDuration::Timed(total), Some(remaining)) => total - remaining,
            _ => secs_between(self.started_at, now),
        }
    }

    /// Seconds left for timed effects, `None` for permanent/instant ones
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<f64> {
        let total = self.duration.secs()?;
        if self.paused
            && let Some(remaining) = self.remaining_duration
        {
            return Some(remaining.max(0.0));
        }
        Some((total - self.elapsed(now)).max(0.0))
    }

    /// Duration ran out while active
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.remaining(now).is_some_and(|r| r <= 0.0)
    }

    pub fn is_depleted(&self) -> bool {
        self.stacks <= 0
    }

    /// Whether `cleanup` should purge this record
    pub fn is_spent(&self, now: DateTime<Utc>) -> bool {
        self.is_depleted() || self.is_expired(now)
    }

    /// Seconds until the next tick is due (0 if overdue)
    pub fn time_to_next_tick(&self, now: DateTime<Utc>) -> Option<f64> {
        if !self.is_ticking() {
            return None;
        }
        if self.paused
            && let Some(remaining) = self.remaining_to_next_tick
        {
            return Some(remaining);
        }
        Some((self.tick_interval - secs_between(self.last_tick_at, now)).max(0.0))
    }

    pub fn side_value(&self, key: &str) -> Option<&Value> {
        self.side_data.get(key)
    }
}
