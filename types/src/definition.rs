//! Effect definition data
//!
//! An `EffectSpec` is the data half of an effect kind: identity, lifecycle
//! parameters and stat modifiers. Specs are loaded from TOML files or built in
//! code; the engine pairs each one with a hooks object at registration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::modifier::{Modifier, ModifierOp};

// ═══════════════════════════════════════════════════════════════════════════
// Duration
// ═══════════════════════════════════════════════════════════════════════════

/// Longest accepted duration or tick interval, about 3000 years. Deadlines
/// past this start running into the end of the representable calendar.
pub const MAX_DURATION_SECS: f64 = 1.0e11;

/// How long an applied effect lasts.
///
/// Serialized as a plain number: any negative or non-finite value is
/// permanent, `0` is instantaneous, and a positive value is a duration in
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub enum EffectDuration {
    /// Lasts until removed
    #[default]
    Permanent,
    /// Fires its apply hooks once and is never persisted
    Instant,
    /// Lasts the given number of seconds
    Timed(f64),
}

impl EffectDuration {
    pub fn is_timed(&self) -> bool {
        matches!(self, Self::Timed(_))
    }

    /// Seconds for timed effects, `None` otherwise
    pub fn secs(&self) -> Option<f64> {
        match self {
            Self::Timed(secs) => Some(*secs),
            _ => None,
        }
    }

    /// Why this duration can't be scheduled, if it can't
    pub fn problem(&self) -> Option<String> {
        let secs = self.secs()?;
        if !secs.is_finite() || secs <= 0.0 {
            Some(format!("duration {secs} must be a positive finite number"))
        } else if secs > MAX_DURATION_SECS {
            Some(format!("duration {secs} exceeds {MAX_DURATION_SECS} seconds"))
        } else {
            None
        }
    }
}

impl From<f64> for EffectDuration {
    fn from(secs: f64) -> Self {
        if secs < 0.0 || !secs.is_finite() {
            Self::Permanent
        } else if secs == 0.0 {
            Self::Instant
        } else {
            Self::Timed(secs)
        }
    }
}

impl From<EffectDuration> for f64 {
    fn from(duration: EffectDuration) -> Self {
        match duration {
            EffectDuration::Permanent => -1.0,
            EffectDuration::Instant => 0.0,
            EffectDuration::Timed(secs) => secs,
        }
    }
}

/// Stacking policy derived from `max_stacks`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCap {
    /// `max_stacks == 1`: reapplication never adds stacks
    Single,
    /// `max_stacks > 1`
    Capped(i32),
    /// `max_stacks < 1`: accumulate without limit
    Uncapped,
}

// ═══════════════════════════════════════════════════════════════════════════
// Effect Spec
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable template for an effect kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectSpec {
    /// Unique identifier for this kind (e.g. "poison")
    pub key: String,

    /// Display name (falls back to the key when empty)
    #[serde(default)]
    pub name: String,

    /// Display description
    #[serde(default)]
    pub flavor: String,

    #[serde(default = "default_true")]
    pub visible: bool,

    /// Event names this effect reacts to
    #[serde(default)]
    pub triggers: BTreeSet<String>,

    // ─── Lifecycle ──────────────────────────────────────────────────────────
    #[serde(default)]
    pub duration: EffectDuration,

    /// Seconds between ticks (0 = no ticking)
    #[serde(default)]
    pub tick_interval: f64,

    /// Pause while the owning entity is offline
    #[serde(default)]
    pub pauses_when_offline: bool,

    /// Reset the duration when reapplied
    #[serde(default = "default_true")]
    pub refresh_on_reapply: bool,

    /// One record per owner regardless of source
    #[serde(default = "default_true")]
    pub unique: bool,

    // ─── Stacking ───────────────────────────────────────────────────────────
    /// 1 = no stacking, >1 = capped, <1 = uncapped
    #[serde(default = "default_one")]
    pub max_stacks: i32,

    /// Stacks granted on first application
    #[serde(default = "default_one")]
    pub default_stacks: i32,

    #[serde(default, rename = "modifier")]
    pub modifiers: Vec<Modifier>,
}

impl EffectSpec {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            flavor: String::new(),
            visible: true,
            triggers: BTreeSet::new(),
            duration: EffectDuration::Permanent,
            tick_interval: 0.0,
            pauses_when_offline: false,
            refresh_on_reapply: true,
            unique: true,
            max_stacks: 1,
            default_stacks: 1,
            modifiers: Vec::new(),
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    pub fn with_duration(mut self, duration: impl Into<EffectDuration>) -> Self {
        self.duration = duration.into();
        self
    }

    pub fn with_tick_interval(mut self, secs: f64) -> Self {
        self.tick_interval = secs;
        self
    }

    pub fn with_trigger(mut self, event: impl Into<String>) -> Self {
        self.triggers.insert(event.into());
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn with_stacking(mut self, max_stacks: i32, default_stacks: i32) -> Self {
        self.max_stacks = max_stacks;
        self.default_stacks = default_stacks;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn refresh_on_reapply(mut self, refresh: bool) -> Self {
        self.refresh_on_reapply = refresh;
        self
    }

    pub fn pauses_when_offline(mut self, pauses: bool) -> Self {
        self.pauses_when_offline = pauses;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    /// Name for display, falling back to the key
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.key
        } else {
            &self.name
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.tick_interval > 0.0
    }

    pub fn stack_cap(&self) -> StackCap {
        match self.max_stacks {
            1 => StackCap::Single,
            n if n > 1 => StackCap::Capped(n),
            _ => StackCap::Uncapped,
        }
    }

    /// Modifiers affecting `stat`
    pub fn modifiers_for<'a>(&'a self, stat: &'a str) -> impl Iterator<Item = &'a Modifier> + 'a {
        self.modifiers.iter().filter(move |m| m.stat == stat)
    }

    pub fn has_stat(&self, stat: &str) -> bool {
        self.modifiers.iter().any(|m| m.stat == stat)
    }

    pub fn has_trigger(&self, event: &str) -> bool {
        self.triggers.contains(event)
    }

    /// Human-readable problems with this spec (empty when valid)
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.key.trim().is_empty() {
            problems.push("key is empty".to_string());
        }
        if let Some(problem) = self.duration.problem() {
            problems.push(problem);
        }
        if !self.tick_interval.is_finite()
            || self.tick_interval < 0.0
            || self.tick_interval > MAX_DURATION_SECS
        {
            problems.push(format!(
                "tick_interval {} must be between 0 and {MAX_DURATION_SECS}",
                self.tick_interval
            ));
        }
        if self.default_stacks < 1 {
            problems.push(format!(
                "default_stacks {} is below 1 (treated as 1)",
                self.default_stacks
            ));
        }
        for modifier in &self.modifiers {
            if modifier.stat.trim().is_empty() {
                problems.push("modifier with empty stat".to_string());
            }
            if !modifier.value.is_finite() || !modifier.per_stack.is_finite() {
                problems.push(format!("modifier for '{}' is not finite", modifier.stat));
            }
            if modifier.operation == ModifierOp::Divide && modifier.value <= -1.0 {
                problems.push(format!(
                    "divide modifier for '{}' drives the denominator to zero or below",
                    modifier.stat
                ));
            }
        }
        problems
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serde Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn default_true() -> bool {
    true
}

fn default_one() -> i32 {
    1
}

// ═══════════════════════════════════════════════════════════════════════════
// Config File Structure
// ═══════════════════════════════════════════════════════════════════════════

/// Root structure for effect definition files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionConfig {
    #[serde(default, rename = "effect")]
    pub effects: Vec<EffectSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_effect_toml() {
        let toml = r#"
[[effect]]
key = "poison"
name = "Poison"
flavor = "You feel sick."
duration = 30
tick_interval = 5
unique = false
refresh_on_reapply = false
max_stacks = 5
triggers = ["drink_antidote"]

[[effect.modifier]]
stat = "regen"
operation = "add"
value = -1.0
per_stack = -0.5
"#;

        let config: DefinitionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.effects.len(), 1);
        let spec = &config.effects[0];
        assert_eq!(spec.key, "poison");
        assert_eq!(spec.duration, EffectDuration::Timed(30.0));
        assert_eq!(spec.tick_interval, 5.0);
        assert_eq!(spec.stack_cap(), StackCap::Capped(5));
        assert!(spec.has_trigger("drink_antidote"));
        assert!(spec.has_stat("regen"));
        assert!(spec.visible);
        assert_eq!(spec.default_stacks, 1);
    }

    #[test]
    fn test_defaults_match_permanent_unique_buff() {
        let config: DefinitionConfig = toml::from_str(
            r#"
[[effect]]
key = "blessing"
"#,
        )
        .unwrap();
        let spec = &config.effects[0];
        assert_eq!(spec.duration, EffectDuration::Permanent);
        assert!(spec.unique);
        assert!(spec.refresh_on_reapply);
        assert_eq!(spec.stack_cap(), StackCap::Single);
        assert_eq!(spec.display_name(), "blessing");
        assert!(spec.problems().is_empty());
    }

    #[test]
    fn test_duration_number_encoding() {
        assert_eq!(EffectDuration::from(-1.0), EffectDuration::Permanent);
        assert_eq!(EffectDuration::from(-30.0), EffectDuration::Permanent);
        assert_eq!(EffectDuration::from(0.0), EffectDuration::Instant);
        assert_eq!(EffectDuration::from(12.5), EffectDuration::Timed(12.5));
        assert_eq!(EffectDuration::from(f64::INFINITY), EffectDuration::Permanent);
        assert_eq!(EffectDuration::from(f64::NAN), EffectDuration::Permanent);

        let json = serde_json::to_string(&EffectDuration::Permanent).unwrap();
        assert_eq!(json, "-1.0");
    }

    #[test]
    fn test_stack_cap_legacy_uncapped() {
        let spec = EffectSpec::new("rage", "Rage").with_stacking(0, 1);
        assert_eq!(spec.stack_cap(), StackCap::Uncapped);
        let spec = EffectSpec::new("rage", "Rage").with_stacking(-3, 1);
        assert_eq!(spec.stack_cap(), StackCap::Uncapped);
    }

    #[test]
    fn test_problems_reported() {
        let mut spec = EffectSpec::new("", "Broken")
            .with_tick_interval(-2.0)
            .with_modifier(Modifier::divide("speed", -1.0));
        spec.default_stacks = 0;
        let problems = spec.problems();
        assert_eq!(problems.len(), 4, "{problems:?}");
    }

    #[test]
    fn test_overlong_durations_rejected() {
        let spec = EffectSpec::new("curse", "Curse").with_duration(1.0e13);
        assert_eq!(spec.problems().len(), 1);
        assert!(EffectDuration::Timed(MAX_DURATION_SECS).problem().is_none());
        assert!(EffectDuration::Timed(f64::NAN).problem().is_some());
        assert!(EffectDuration::Permanent.problem().is_none());

        let spec = EffectSpec::new("drip", "Drip").with_tick_interval(1.0e13);
        assert_eq!(spec.problems().len(), 1);
    }
}
