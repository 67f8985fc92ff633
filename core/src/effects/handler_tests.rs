//! Tests for the effect handler
//!
//! Drives handlers with a manual clock and scheduler so every timer fires at
//! an exact, reproducible instant.

use std::sync::{Arc, Mutex};

use boons_types::{EffectDuration, EffectSpec, EntityId, Modifier};
use chrono::{DateTime, Utc};
use serde_json::json;

use super::definition::{EffectHooks, HookCtx};
use super::handler::{ApplyOptions, CheckOptions, EffectHandler, RemoveOptions, Services};
use super::record::EffectRecord;
use super::registry::EffectRegistry;
use crate::clock::{Clock, ManualClock, add_secs};
use crate::context::Context;
use crate::error::{EffectError, HookResult};
use crate::events::{PresenceSignal, SignalHandler};
use crate::scheduler::{ManualScheduler, TimerKind};
use crate::storage::{AttributeStore, MemoryStore};

const OWNER: &str = "#1";

#[derive(Clone, Default)]
struct HookLog(Arc<Mutex<Vec<String>>>);

impl HookLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries for `hook`, regardless of record
    fn count(&self, hook: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.split(':').next() == Some(hook))
            .count()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Logs every hook as `hook:record_key`. Fails the hook named in `fail`.
/// `conditional` reads the `enabled` context flag.
struct Recording {
    log: HookLog,
    fail: Option<&'static str>,
}

impl Recording {
    fn record(&self, name: &'static str, hook: &HookCtx<'_>) -> HookResult {
        self.log.push(format!("{name}:{}", hook.record.record_key));
        if self.fail == Some(name) {
            return Err(format!("{name} exploded").into());
        }
        Ok(())
    }
}

impl EffectHooks for Recording {
    fn on_apply(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_apply", hook)
    }

    fn on_remove(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_remove", hook)
    }

    fn on_dispel(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_dispel", hook)
    }

    fn on_expire(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_expire", hook)
    }

    fn on_pre_check(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        let checks = hook.record.side_data.get("checks").and_then(|v| v.as_u64()).unwrap_or(0);
        hook.record.side_data.insert("checks".to_string(), json!(checks + 1));
        self.record("on_pre_check", hook)
    }

    fn on_post_check(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_post_check", hook)
    }

    fn on_trigger(&self, event: &str, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        ctx.insert("last_event", event);
        self.record("on_trigger", hook)
    }

    fn on_tick(&self, is_first: bool, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        if is_first {
            hook.record.side_data.insert("first_tick".to_string(), json!(true));
        }
        self.record("on_tick", hook)
    }

    fn on_pause(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_pause", hook)
    }

    fn on_unpause(&self, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
        self.record("on_unpause", hook)
    }

    fn conditional(&self, _record: &EffectRecord, _owner: &EntityId, ctx: &Context) -> bool {
        ctx.get_bool("enabled").unwrap_or(true)
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
    store: Arc<MemoryStore>,
    services: Services,
    log: HookLog,
}

impl Harness {
    fn new(specs: Vec<EffectSpec>) -> Self {
        Self::failing(specs, None)
    }

    /// Every definition's `fail` hook returns an error
    fn failing(specs: Vec<EffectSpec>, fail: Option<&'static str>) -> Self {
        let log = HookLog::default();
        let mut registry = EffectRegistry::new();
        for spec in specs {
            let hooks = Recording {
                log: log.clone(),
                fail,
            };
            registry.register(spec, Arc::new(hooks)).unwrap();
        }
        let clock = Arc::new(ManualClock::new());
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let store = Arc::new(MemoryStore::new());
        let services = Services::new(Arc::new(registry), store.clone(), scheduler.clone(), clock.clone());
        Self {
            clock,
            scheduler,
            store,
            services,
            log,
        }
    }

    fn handler(&self) -> EffectHandler {
        EffectHandler::new(EntityId::new(OWNER), self.services.clone())
    }

    /// Step the clock to each timer deadline up to `secs` from now, firing
    /// due calls into `handler`
    fn advance(&self, handler: &mut EffectHandler, secs: f64) {
        let target = add_secs(self.clock.now(), secs);
        while let Some(due) = self.scheduler.next_due() {
            if due > target {
                break;
            }
            self.clock.set(due.max(self.clock.now()));
            for call in self.scheduler.drain_due() {
                handler.handle_timer(&call, &mut Context::new()).unwrap();
            }
        }
        self.clock.set(target);
    }

    fn stored(&self) -> Option<serde_json::Value> {
        self.store.load(&EntityId::new(OWNER), "effects").unwrap()
    }
}

fn ctx() -> Context {
    Context::new()
}

fn apply(handler: &mut EffectHandler, key: &str) -> String {
    handler.apply(key, ApplyOptions::new(), &mut ctx()).unwrap()
}

fn check(handler: &mut EffectHandler, value: f64, stat: &str) -> f64 {
    handler
        .check(value, stat, CheckOptions::default(), &mut ctx())
        .unwrap()
}

fn remaining(handler: &mut EffectHandler, clock: &ManualClock, key: &str) -> Option<f64> {
    handler.get(key).unwrap().and_then(|r| r.remaining(clock.now()))
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_timed_ticking_effect_runs_its_course() {
    let h = Harness::new(vec![
        EffectSpec::new("slow", "Slow")
            .with_duration(10.0)
            .with_tick_interval(5.0)
            .with_modifier(Modifier::add("speed", -2.0)),
    ]);
    let mut handler = h.handler();

    apply(&mut handler, "slow");
    assert_eq!(check(&mut handler, 10.0, "speed"), 8.0);
    assert_eq!(h.log.count("on_tick"), 1);

    h.advance(&mut handler, 10.0);

    assert!(handler.get("slow").unwrap().is_none());
    assert_eq!(check(&mut handler, 10.0, "speed"), 10.0);
    assert_eq!(h.log.count("on_tick"), 2, "first tick at apply, second at +5s");
    assert_eq!(h.log.count("on_expire"), 1);
    assert_eq!(h.log.count("on_remove"), 1);
    assert!(h.scheduler.is_empty());
}

#[test]
fn test_first_tick_is_flagged_and_counted() {
    let h = Harness::new(vec![EffectSpec::new("regen", "Regen").with_tick_interval(2.0)]);
    let mut handler = h.handler();

    apply(&mut handler, "regen");
    let record = handler.get("regen").unwrap().unwrap();
    assert_eq!(record.side_value("first_tick"), Some(&json!(true)));
    assert_eq!(record.tick_count, 1);

    h.advance(&mut handler, 7.0);
    let record = handler.get("regen").unwrap().unwrap();
    assert_eq!(record.tick_count, 4);
    assert_eq!(record.last_tick_at, add_secs(record.started_at, 6.0));
}

// ─────────────────────────────────────────────────────────────────────────────
// Stacking & reapplication
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_stack_cap_is_never_exceeded() {
    let h = Harness::new(vec![EffectSpec::new("poison", "Poison").with_stacking(3, 1)]);
    let mut handler = h.handler();

    for _ in 0..5 {
        apply(&mut handler, "poison");
    }
    assert_eq!(handler.get("poison").unwrap().unwrap().stacks, 3);

    handler
        .apply("poison", ApplyOptions::new().with_stacks(10), &mut ctx())
        .unwrap();
    assert_eq!(handler.get("poison").unwrap().unwrap().stacks, 3);
}

#[test]
fn test_single_stack_ignores_requested_stacks() {
    let h = Harness::new(vec![EffectSpec::new("ward", "Ward")]);
    let mut handler = h.handler();

    handler
        .apply("ward", ApplyOptions::new().with_stacks(4), &mut ctx())
        .unwrap();
    apply(&mut handler, "ward");
    assert_eq!(handler.get("ward").unwrap().unwrap().stacks, 1);
}

#[test]
fn test_uncapped_stacks_accumulate() {
    let h = Harness::new(vec![EffectSpec::new("hoard", "Hoard").with_stacking(0, 1)]);
    let mut handler = h.handler();

    handler
        .apply("hoard", ApplyOptions::new().with_stacks(4), &mut ctx())
        .unwrap();
    handler
        .apply("hoard", ApplyOptions::new().with_stacks(4), &mut ctx())
        .unwrap();
    apply(&mut handler, "hoard");
    assert_eq!(handler.get("hoard").unwrap().unwrap().stacks, 9);
}

#[test]
fn test_refresh_resets_remaining_duration() {
    let h = Harness::new(vec![EffectSpec::new("haste", "Haste").with_duration(30.0)]);
    let mut handler = h.handler();

    apply(&mut handler, "haste");
    h.advance(&mut handler, 10.0);
    assert_eq!(remaining(&mut handler, &h.clock, "haste"), Some(20.0));

    apply(&mut handler, "haste");
    assert_eq!(remaining(&mut handler, &h.clock, "haste"), Some(30.0));

    // The old expiry was superseded
    h.advance(&mut handler, 25.0);
    assert!(handler.get("haste").unwrap().is_some());
    h.advance(&mut handler, 5.0);
    assert!(handler.get("haste").unwrap().is_none());
}

#[test]
fn test_no_refresh_keeps_started_at() {
    let h = Harness::new(vec![
        EffectSpec::new("curse", "Curse")
            .with_duration(30.0)
            .refresh_on_reapply(false),
    ]);
    let mut handler = h.handler();

    apply(&mut handler, "curse");
    let started = handler.get("curse").unwrap().unwrap().started_at;
    h.advance(&mut handler, 10.0);

    handler
        .apply("curse", ApplyOptions::new().with_duration(500.0), &mut ctx())
        .unwrap();
    let record = handler.get("curse").unwrap().unwrap();
    assert_eq!(record.started_at, started);
    assert_eq!(remaining(&mut handler, &h.clock, "curse"), Some(20.0));

    h.advance(&mut handler, 20.0);
    assert!(handler.get("curse").unwrap().is_none());
}

#[test]
fn test_duration_override_applies_to_new_record() {
    let h = Harness::new(vec![EffectSpec::new("haste", "Haste").with_duration(30.0)]);
    let mut handler = h.handler();

    handler
        .apply("haste", ApplyOptions::new().with_duration(5.0), &mut ctx())
        .unwrap();
    assert_eq!(remaining(&mut handler, &h.clock, "haste"), Some(5.0));
    h.advance(&mut handler, 5.0);
    assert!(!handler.has("haste").unwrap());
}

#[test]
fn test_record_keys_follow_uniqueness_rules() {
    let h = Harness::new(vec![
        EffectSpec::new("bleed", "Bleed").unique(false),
        EffectSpec::new("scar", "Scar")
            .unique(false)
            .refresh_on_reapply(false),
    ]);
    let mut handler = h.handler();

    let sourced = handler
        .apply("bleed", ApplyOptions::new().with_source("#9"), &mut ctx())
        .unwrap();
    assert_eq!(sourced, "bleed_#9");
    assert_eq!(apply(&mut handler, "bleed"), "bleed");

    let first = apply(&mut handler, "scar");
    let second = apply(&mut handler, "scar");
    assert_ne!(first, second);
    assert!(first.starts_with("scar_"));
    assert_eq!(first.len(), "scar_".len() + 8);

    let explicit = handler
        .apply("scar", ApplyOptions::new().with_record_key("scar_custom"), &mut ctx())
        .unwrap();
    assert_eq!(explicit, "scar_custom");
    assert_eq!(handler.get_by_definition("scar").unwrap().len(), 3);
}

#[test]
fn test_one_record_per_source_for_non_unique() {
    let h = Harness::new(vec![EffectSpec::new("mark", "Mark").unique(false).with_stacking(5, 1)]);
    let mut handler = h.handler();

    for source in ["#2", "#3", "#2"] {
        handler
            .apply("mark", ApplyOptions::new().with_source(source), &mut ctx())
            .unwrap();
    }
    assert_eq!(handler.get_all().unwrap().len(), 2);
    assert_eq!(handler.get("mark_#2").unwrap().unwrap().stacks, 2);
    assert_eq!(
        handler.get_by_source(&EntityId::new("#3")).unwrap()[0].record_key,
        "mark_#3"
    );
}

#[test]
fn test_side_data_merges_on_reapply() {
    let h = Harness::new(vec![EffectSpec::new("tag", "Tag")]);
    let mut handler = h.handler();

    handler
        .apply("tag", ApplyOptions::new().with_side("a", 1).with_side("b", 2), &mut ctx())
        .unwrap();
    handler
        .apply("tag", ApplyOptions::new().with_side("b", 3).with_side("c", 4), &mut ctx())
        .unwrap();

    let record = handler.get("tag").unwrap().unwrap();
    assert_eq!(record.side_value("a"), Some(&json!(1)));
    assert_eq!(record.side_value("b"), Some(&json!(3)));
    assert_eq!(record.side_value("c"), Some(&json!(4)));
}

#[test]
fn test_unknown_definition_creates_nothing() {
    let h = Harness::new(vec![]);
    let mut handler = h.handler();

    let err = handler
        .apply("nope", ApplyOptions::new(), &mut ctx())
        .unwrap_err();
    assert!(matches!(err, EffectError::UnknownDefinition(key) if key == "nope"));
    assert!(handler.get_all().unwrap().is_empty());
    assert!(h.stored().is_none());
}

#[test]
fn test_instant_effect_fires_and_vanishes() {
    let h = Harness::new(vec![
        EffectSpec::new("heal", "Heal")
            .with_duration(0.0)
            .with_tick_interval(1.0),
    ]);
    let mut handler = h.handler();

    let key = apply(&mut handler, "heal");
    assert_eq!(key, "heal");
    assert_eq!(
        h.log.entries(),
        vec!["on_apply:heal", "on_tick:heal", "on_expire:heal", "on_remove:heal"]
    );
    assert!(handler.get_all().unwrap().is_empty());
    assert!(h.stored().is_none(), "instant effects are never persisted");
    assert!(h.scheduler.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_aggregation_order_and_round_trip() {
    let h = Harness::new(vec![
        EffectSpec::new("might", "Might").with_modifier(Modifier::add("power", 10.0)),
        EffectSpec::new("dull", "Dull").with_modifier(Modifier::divide("power", 1.0)),
        EffectSpec::new("fury", "Fury").with_modifier(Modifier::multiply("power", 1.0)),
    ]);
    let mut handler = h.handler();

    assert_eq!(check(&mut handler, 0.0, "power"), 0.0);
    for key in ["might", "dull", "fury"] {
        apply(&mut handler, key);
    }
    assert_eq!(check(&mut handler, 0.0, "power"), 10.0);

    handler
        .clear(RemoveOptions::default(), &mut ctx())
        .unwrap();
    assert_eq!(check(&mut handler, 0.0, "power"), 0.0);
}

#[test]
fn test_per_stack_contribution() {
    let h = Harness::new(vec![
        EffectSpec::new("focus", "Focus")
            .with_stacking(5, 3)
            .with_modifier(Modifier::add("accuracy", 1.0).with_per_stack(0.5)),
    ]);
    let mut handler = h.handler();

    apply(&mut handler, "focus");
    assert_eq!(check(&mut handler, 10.0, "accuracy"), 12.5);
}

#[test]
fn test_strongest_uses_single_best_contribution() {
    let h = Harness::new(vec![
        EffectSpec::new("small", "Small").with_modifier(Modifier::add("armor", 2.0)),
        EffectSpec::new("large", "Large").with_modifier(Modifier::add("armor", 5.0)),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "small");
    apply(&mut handler, "large");

    let strongest = handler
        .check(1.0, "armor", CheckOptions::default().strongest(), &mut ctx())
        .unwrap();
    assert_eq!(strongest, 6.0);
    assert_eq!(check(&mut handler, 1.0, "armor"), 8.0);
}

#[test]
fn test_check_hooks_bracket_the_query() {
    let h = Harness::new(vec![EffectSpec::new("might", "Might").with_modifier(Modifier::add("power", 1.0))]);
    let mut handler = h.handler();
    apply(&mut handler, "might");
    h.log.clear();

    check(&mut handler, 0.0, "power");
    assert_eq!(h.log.entries(), vec!["on_pre_check:might", "on_post_check:might"]);

    h.log.clear();
    handler
        .check(0.0, "power", CheckOptions::quiet(), &mut ctx())
        .unwrap();
    assert_eq!(h.log.entries(), vec!["on_pre_check:might"]);

    h.log.clear();
    let breakdown = handler.view_modifiers("power", &mut ctx()).unwrap();
    assert!(h.log.entries().is_empty(), "view_modifiers runs no check hooks");
    assert_eq!(breakdown.add.total, 1.0);
    assert_eq!(breakdown.records, vec!["might".to_string()]);
}

#[test]
fn test_check_can_fire_stat_as_trigger() {
    let h = Harness::new(vec![
        EffectSpec::new("thorns", "Thorns")
            .with_modifier(Modifier::add("defense", 3.0))
            .with_trigger("defense"),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "thorns");

    let mut context = ctx();
    let value = handler
        .check(1.0, "defense", CheckOptions::default().with_trigger(), &mut context)
        .unwrap();
    assert_eq!(value, 4.0);
    assert_eq!(h.log.count("on_trigger"), 1);
    assert_eq!(context.get_str("last_event"), Some("defense"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Triggers & conditionals
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_trigger_fires_listeners_only() {
    let h = Harness::new(vec![
        EffectSpec::new("retaliate", "Retaliate").with_trigger("hit"),
        EffectSpec::new("dodge", "Dodge").with_trigger("attack"),
        EffectSpec::new("plain", "Plain"),
    ]);
    let mut handler = h.handler();
    for key in ["retaliate", "dodge", "plain"] {
        apply(&mut handler, key);
    }
    h.log.clear();

    assert_eq!(handler.trigger("hit", &mut ctx()).unwrap(), 1);
    assert_eq!(h.log.entries(), vec!["on_trigger:retaliate"]);
    assert_eq!(handler.trigger("nothing", &mut ctx()).unwrap(), 0);
}

#[test]
fn test_conditional_false_isolates_effect() {
    let h = Harness::new(vec![
        EffectSpec::new("rage", "Rage")
            .with_trigger("hit")
            .with_modifier(Modifier::add("damage", 5.0)),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "rage");
    h.log.clear();

    let mut disabled = Context::new().with("enabled", false);
    assert_eq!(handler.trigger("hit", &mut disabled).unwrap(), 0);
    let value = handler
        .check(10.0, "damage", CheckOptions::default(), &mut disabled)
        .unwrap();
    assert_eq!(value, 10.0);
    assert!(h.log.entries().is_empty());

    let mut enabled = Context::new().with("enabled", true);
    assert_eq!(handler.trigger("hit", &mut enabled).unwrap(), 1);
}

#[test]
fn test_paused_records_do_not_contribute() {
    let h = Harness::new(vec![
        EffectSpec::new("rage", "Rage")
            .with_trigger("hit")
            .with_modifier(Modifier::add("damage", 5.0)),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "rage");

    assert!(handler.pause("rage", &mut ctx()).unwrap());
    assert_eq!(check(&mut handler, 10.0, "damage"), 10.0);
    assert_eq!(handler.trigger("hit", &mut ctx()).unwrap(), 0);
}

#[test]
fn test_trigger_hook_error_surfaces_after_all_fire() {
    let h = Harness::failing(
        vec![
            EffectSpec::new("a", "A").with_trigger("ping"),
            EffectSpec::new("b", "B").with_trigger("ping"),
        ],
        Some("on_trigger"),
    );
    let mut handler = h.handler();
    apply(&mut handler, "a");
    apply(&mut handler, "b");

    let err = handler.trigger("ping", &mut ctx()).unwrap_err();
    assert!(matches!(err, EffectError::Hook { hook: "on_trigger", .. }));
    assert_eq!(h.log.count("on_trigger"), 2);
}

#[test]
fn test_redefined_kind_leaves_stat_and_trigger_lookup() {
    let h = Harness::new(vec![
        EffectSpec::new("rage", "Rage")
            .with_trigger("hit")
            .with_modifier(Modifier::add("damage", 5.0)),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "rage");
    assert_eq!(check(&mut handler, 10.0, "damage"), 15.0);

    // Same store, "rage" redefined with a different stat and no trigger
    let mut registry = EffectRegistry::new();
    registry
        .register_spec(EffectSpec::new("rage", "Rage").with_modifier(Modifier::add("armor", 2.0)))
        .unwrap();
    let services = Services::new(Arc::new(registry), h.store.clone(), h.scheduler.clone(), h.clock.clone());
    let mut other = EffectHandler::new(EntityId::new(OWNER), services);

    assert_eq!(check(&mut other, 10.0, "damage"), 10.0);
    assert_eq!(check(&mut other, 10.0, "armor"), 12.0);
    assert_eq!(other.trigger("hit", &mut ctx()).unwrap(), 0);
    assert!(other.view_modifiers("damage", &mut ctx()).unwrap().records.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Removal
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_remove_hook_variants() {
    let h = Harness::new(vec![EffectSpec::new("a", "A"), EffectSpec::new("b", "B"), EffectSpec::new("c", "C")]);
    let mut handler = h.handler();
    for key in ["a", "b", "c"] {
        apply(&mut handler, key);
    }
    h.log.clear();

    assert!(handler.remove("a", RemoveOptions::dispel(), &mut ctx()).unwrap());
    assert!(handler.remove("b", RemoveOptions::quiet(), &mut ctx()).unwrap());
    let both = RemoveOptions {
        dispel: true,
        expire: true,
        ..RemoveOptions::default()
    };
    assert!(handler.remove("c", both, &mut ctx()).unwrap());
    assert_eq!(
        h.log.entries(),
        vec!["on_dispel:a", "on_remove:a", "on_dispel:c", "on_remove:c"]
    );

    // Unknown keys are a benign no-op
    assert!(!handler.remove("a", RemoveOptions::default(), &mut ctx()).unwrap());
    assert!(handler.get_all().unwrap().is_empty());
}

#[test]
fn test_remove_stacks_deletes_at_zero() {
    let h = Harness::new(vec![EffectSpec::new("poison", "Poison").with_stacking(5, 3)]);
    let mut handler = h.handler();
    apply(&mut handler, "poison");
    h.log.clear();

    let left = handler
        .remove_stacks("poison", 1, RemoveOptions::default(), &mut ctx())
        .unwrap();
    assert_eq!(left, Some(2));
    assert!(h.log.entries().is_empty());

    let left = handler
        .remove_stacks("poison", 5, RemoveOptions::default(), &mut ctx())
        .unwrap();
    assert_eq!(left, Some(0));
    assert!(handler.get("poison").unwrap().is_none());
    assert_eq!(h.log.entries(), vec!["on_remove:poison"]);

    let missing = handler
        .remove_stacks("poison", 1, RemoveOptions::default(), &mut ctx())
        .unwrap();
    assert_eq!(missing, None);
}

#[test]
fn test_bulk_removal_filters() {
    let h = Harness::new(vec![
        EffectSpec::new("haste", "Haste").with_modifier(Modifier::add("speed", 1.0)),
        EffectSpec::new("riposte", "Riposte").with_trigger("parry"),
        EffectSpec::new("mark", "Mark").unique(false),
        EffectSpec::new("note", "Note"),
    ]);
    let mut handler = h.handler();
    let opts = RemoveOptions::default();

    apply(&mut handler, "haste");
    apply(&mut handler, "riposte");
    for source in ["#5", "#6"] {
        handler
            .apply("mark", ApplyOptions::new().with_source(source), &mut ctx())
            .unwrap();
    }
    handler
        .apply("note", ApplyOptions::new().with_side("origin", "quest"), &mut ctx())
        .unwrap();

    assert_eq!(handler.remove_by_stat("speed", opts, &mut ctx()).unwrap(), 1);
    assert_eq!(handler.remove_by_trigger("parry", opts, &mut ctx()).unwrap(), 1);
    assert_eq!(
        handler
            .remove_by_source(&EntityId::new("#5"), opts, &mut ctx())
            .unwrap(),
        1
    );
    assert_eq!(
        handler
            .remove_by_side_data("origin", &json!("quest"), opts, &mut ctx())
            .unwrap(),
        1
    );
    assert_eq!(handler.remove_by_definition("mark", opts, &mut ctx()).unwrap(), 1);
    assert!(handler.get_all().unwrap().is_empty());
    assert_eq!(handler.clear(opts, &mut ctx()).unwrap(), 0);
}

#[test]
fn test_removal_cancels_timers() {
    let h = Harness::new(vec![
        EffectSpec::new("burn", "Burn")
            .with_duration(20.0)
            .with_tick_interval(2.0),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "burn");
    assert_eq!(h.scheduler.len(), 2);

    handler
        .remove("burn", RemoveOptions::dispel(), &mut ctx())
        .unwrap();
    assert!(h.scheduler.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Pause / resume
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_pause_resume_preserves_remaining_time() {
    let h = Harness::new(vec![EffectSpec::new("ward", "Ward").with_duration(100.0)]);
    let mut handler = h.handler();
    apply(&mut handler, "ward");

    h.advance(&mut handler, 30.0);
    assert!(handler.pause("ward", &mut ctx()).unwrap());
    assert!(!handler.pause("ward", &mut ctx()).unwrap(), "second pause is a no-op");
    assert!(h.scheduler.is_empty());

    h.advance(&mut handler, 500.0);
    assert_eq!(remaining(&mut handler, &h.clock, "ward"), Some(70.0));

    assert!(handler.unpause("ward", &mut ctx()).unwrap());
    assert_eq!(remaining(&mut handler, &h.clock, "ward"), Some(70.0));

    h.advance(&mut handler, 69.5);
    assert!(handler.get("ward").unwrap().is_some());
    h.advance(&mut handler, 0.5);
    assert!(handler.get("ward").unwrap().is_none());
    assert_eq!(h.log.count("on_pause"), 1);
    assert_eq!(h.log.count("on_unpause"), 1);
}

#[test]
fn test_pause_floors_time_to_next_tick() {
    let h = Harness::new(vec![EffectSpec::new("regen", "Regen").with_tick_interval(5.0)]);
    let mut handler = h.handler();
    apply(&mut handler, "regen");

    h.advance(&mut handler, 4.5);
    handler.pause("regen", &mut ctx()).unwrap();
    let record = handler.get("regen").unwrap().unwrap();
    assert_eq!(record.remaining_to_next_tick, Some(1.0));

    h.advance(&mut handler, 100.0);
    handler.unpause("regen", &mut ctx()).unwrap();
    h.advance(&mut handler, 0.9);
    assert_eq!(h.log.count("on_tick"), 1);
    h.advance(&mut handler, 0.1);
    assert_eq!(h.log.count("on_tick"), 2);
}

#[test]
fn test_reapply_while_paused_stays_paused() {
    let h = Harness::new(vec![EffectSpec::new("ward", "Ward").with_duration(100.0)]);
    let mut handler = h.handler();
    apply(&mut handler, "ward");
    h.advance(&mut handler, 40.0);
    handler.pause("ward", &mut ctx()).unwrap();

    apply(&mut handler, "ward");
    let record = handler.get("ward").unwrap().unwrap();
    assert!(record.paused);
    assert_eq!(record.remaining_duration, Some(100.0));
    assert!(h.scheduler.is_empty());
}

#[test]
fn test_stale_tick_is_discarded() {
    let h = Harness::new(vec![
        EffectSpec::new("burn", "Burn")
            .with_duration(30.0)
            .with_tick_interval(3.0),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "burn");
    let old_tick = h
        .scheduler
        .pending()
        .into_iter()
        .find(|t| t.call.kind == TimerKind::Tick)
        .unwrap()
        .call;

    // Refresh bumps the generation
    apply(&mut handler, "burn");
    h.log.clear();
    handler.handle_timer(&old_tick, &mut ctx()).unwrap();
    assert!(h.log.entries().is_empty());

    // So does pausing, even for a call with the current generation
    let current = h.scheduler.pending()[0].call.clone();
    handler.pause("burn", &mut ctx()).unwrap();
    h.log.clear();
    handler.handle_timer(&current, &mut ctx()).unwrap();
    assert!(h.log.entries().is_empty());
}

#[test]
fn test_presence_pauses_playtime_effects_only() {
    let h = Harness::new(vec![
        EffectSpec::new("rested", "Rested")
            .with_duration(60.0)
            .pauses_when_offline(true),
        EffectSpec::new("curse", "Curse").with_duration(60.0),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "rested");
    apply(&mut handler, "curse");
    h.advance(&mut handler, 20.0);

    let owner = EntityId::new(OWNER);
    let other = PresenceSignal::Offline {
        entity: EntityId::new("#99"),
    };
    handler.handle_signal(&other, &mut ctx()).unwrap();
    assert!(handler.paused().unwrap().is_empty());

    handler
        .handle_signal(&PresenceSignal::Offline { entity: owner.clone() }, &mut ctx())
        .unwrap();
    assert_eq!(handler.paused().unwrap().len(), 1);
    assert_eq!(handler.playtime().unwrap()[0].record_key, "rested");

    h.advance(&mut handler, 3600.0);
    assert!(handler.get("curse").unwrap().is_none());
    assert_eq!(remaining(&mut handler, &h.clock, "rested"), Some(40.0));

    handler
        .handle_signal(&PresenceSignal::Online { entity: owner }, &mut ctx())
        .unwrap();
    h.advance(&mut handler, 40.0);
    assert!(handler.get("rested").unwrap().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Cleanup, views & queries
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_cleanup_is_idempotent() {
    let h = Harness::new(vec![
        EffectSpec::new("flash", "Flash").with_duration(5.0),
        EffectSpec::new("aura", "Aura"),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "flash");
    apply(&mut handler, "aura");

    // Let time pass without delivering the expiry timer
    h.clock.advance(6.0);
    assert_eq!(handler.expired().unwrap().len(), 1);

    assert_eq!(handler.cleanup(&mut ctx()).unwrap(), 1);
    let first = handler.get_all().unwrap().clone();
    let stored = h.stored();

    assert_eq!(handler.cleanup(&mut ctx()).unwrap(), 0);
    assert_eq!(handler.get_all().unwrap(), &first);
    assert_eq!(h.stored(), stored);
    assert_eq!(h.log.count("on_expire"), 1);
}

#[test]
fn test_depleted_records_are_purged() {
    struct Drain;
    impl EffectHooks for Drain {
        fn on_trigger(&self, _event: &str, hook: &mut HookCtx<'_>, _ctx: &mut Context) -> HookResult {
            hook.record.stacks -= 1;
            Ok(())
        }
    }

    let mut registry = EffectRegistry::new();
    registry
        .register(EffectSpec::new("charge", "Charge").with_trigger("use"), Arc::new(Drain))
        .unwrap();
    let clock = Arc::new(ManualClock::new());
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let services = Services::new(Arc::new(registry), Arc::new(MemoryStore::new()), scheduler, clock);
    let mut handler = EffectHandler::new(EntityId::new(OWNER), services);

    apply(&mut handler, "charge");
    assert_eq!(handler.trigger("use", &mut ctx()).unwrap(), 1);
    assert!(!handler.has("charge").unwrap());
    assert_eq!(handler.trigger("use", &mut ctx()).unwrap(), 0);
    assert!(handler.get_all().unwrap().is_empty());
}

#[test]
fn test_view_lists_visible_effects() {
    let h = Harness::new(vec![
        EffectSpec::new("haste", "Haste")
            .with_flavor("You feel quick.")
            .with_duration(30.0)
            .with_modifier(Modifier::add("speed", 1.0)),
        EffectSpec::new("secret", "Secret").hidden(),
        EffectSpec::new("poison", "Poison")
            .with_stacking(5, 2)
            .with_trigger("drink"),
    ]);
    let mut handler = h.handler();
    for key in ["haste", "secret", "poison"] {
        apply(&mut handler, key);
    }
    h.advance(&mut handler, 5.0);

    let view = handler.view(&mut ctx()).unwrap();
    assert_eq!(view.len(), 2);
    assert_eq!(
        view.get("haste"),
        Some(&("Haste".to_string(), "You feel quick.".to_string()))
    );
    assert!(!view.contains_key("secret"));

    let lines: Vec<String> = handler
        .view_detailed(&mut ctx())
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(lines, vec!["Haste (25s) - You feel quick.", "Poison x2 (permanent)"]);

    let filtered = handler
        .view_matching(|r| r.stacks > 1, &mut ctx())
        .unwrap();
    assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["poison"]);

    assert_eq!(handler.traits().unwrap().len(), 1);
    assert_eq!(handler.effects().unwrap()[0].record_key, "poison");
    assert_eq!(handler.visible().unwrap().len(), 2);
    assert_eq!(handler.get_by_stat("speed").unwrap().len(), 1);
    assert_eq!(handler.get_by_trigger("drink").unwrap().len(), 1);
    assert!(handler.has("secret").unwrap());
}

#[test]
fn test_side_data_query() {
    let h = Harness::new(vec![EffectSpec::new("tag", "Tag").unique(false)]);
    let mut handler = h.handler();
    handler
        .apply("tag", ApplyOptions::new().with_source("#2").with_side("team", "red"), &mut ctx())
        .unwrap();
    handler
        .apply("tag", ApplyOptions::new().with_source("#3").with_side("team", "blue"), &mut ctx())
        .unwrap();

    let red = handler.get_by_side_data("team", &json!("red")).unwrap();
    assert_eq!(red.len(), 1);
    assert_eq!(red[0].record_key, "tag_#2");
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_apply_hook_error_propagates_but_record_is_armed() {
    let h = Harness::failing(
        vec![EffectSpec::new("doom", "Doom").with_duration(10.0)],
        Some("on_apply"),
    );
    let mut handler = h.handler();

    let err = handler
        .apply("doom", ApplyOptions::new(), &mut ctx())
        .unwrap_err();
    assert!(matches!(err, EffectError::Hook { hook: "on_apply", ref record, .. } if record == "doom"));
    assert!(handler.get("doom").unwrap().is_some());
    assert!(h.stored().is_some());

    h.advance(&mut handler, 10.0);
    assert!(handler.get("doom").unwrap().is_none());
}

#[test]
fn test_remove_hook_error_keeps_record() {
    let h = Harness::failing(vec![EffectSpec::new("bond", "Bond")], Some("on_remove"));
    let mut handler = h.handler();
    apply(&mut handler, "bond");

    let err = handler
        .remove("bond", RemoveOptions::default(), &mut ctx())
        .unwrap_err();
    assert!(matches!(err, EffectError::Hook { hook: "on_remove", .. }));
    assert!(handler.get("bond").unwrap().is_some());

    assert!(handler.remove("bond", RemoveOptions::quiet(), &mut ctx()).unwrap());
}

#[test]
fn test_check_hook_error_still_saves_hook_edits() {
    let h = Harness::failing(
        vec![EffectSpec::new("focus", "Focus").with_modifier(Modifier::add("power", 1.0))],
        Some("on_pre_check"),
    );
    let mut handler = h.handler();
    apply(&mut handler, "focus");

    let err = handler
        .check(0.0, "power", CheckOptions::default(), &mut ctx())
        .unwrap_err();
    assert!(matches!(err, EffectError::Hook { hook: "on_pre_check", .. }));
    assert_eq!(h.log.count("on_post_check"), 0);

    let mut fresh = h.handler();
    let record = fresh.get("focus").unwrap().unwrap();
    assert_eq!(record.side_data.get("checks"), Some(&json!(1)));
}

#[test]
fn test_duration_override_is_validated() {
    let h = Harness::new(vec![EffectSpec::new("flash", "Flash").with_duration(5.0)]);
    let mut handler = h.handler();

    let err = handler
        .apply("flash", ApplyOptions::new().with_duration(1.0e13), &mut ctx())
        .unwrap_err();
    assert!(matches!(err, EffectError::InvalidDefinition { ref key, .. } if key == "flash"));
    assert!(handler.get("flash").unwrap().is_none());
    assert!(h.scheduler.is_empty());
    assert!(h.log.entries().is_empty());

    // Non-finite overrides mean "no end"
    for secs in [f64::INFINITY, f64::NAN] {
        handler
            .apply("flash", ApplyOptions::new().with_duration(secs), &mut ctx())
            .unwrap();
        assert_eq!(handler.get("flash").unwrap().unwrap().duration, EffectDuration::Permanent);
    }
    h.advance(&mut handler, 1.0e6);
    assert!(handler.get("flash").unwrap().is_some());
    assert_eq!(h.log.count("on_expire"), 0);
}

#[test]
fn test_oversized_stored_duration_parks_its_timer() {
    let spec = EffectSpec::new("vow", "Vow");
    let h = Harness::new(vec![spec.clone()]);
    let mut record = EffectRecord::new("vow", &spec, h.clock.now());
    record.duration = EffectDuration::Timed(1.0e13);
    h.store
        .save(&EntityId::new(OWNER), "effects", &json!({ "vow": record }))
        .unwrap();

    let mut handler = h.handler();
    assert_eq!(handler.rearm().unwrap(), 1);
    assert_eq!(h.scheduler.next_due(), Some(DateTime::<Utc>::MAX_UTC));

    h.advance(&mut handler, 1.0e6);
    assert!(handler.get("vow").unwrap().is_some());
    assert_eq!(h.log.count("on_expire"), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence & restart
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_records_persist_across_handlers() {
    let h = Harness::new(vec![EffectSpec::new("poison", "Poison").with_stacking(5, 2)]);
    let mut handler = h.handler();
    handler
        .apply("poison", ApplyOptions::new().with_source("#4"), &mut ctx())
        .unwrap();

    let mut fresh = h.handler();
    let record = fresh.get("poison").unwrap().unwrap().clone();
    assert_eq!(record.stacks, 2);
    assert_eq!(record.source, Some(EntityId::new("#4")));

    // A reload picks up changes made through another handler
    fresh.remove("poison", RemoveOptions::quiet(), &mut ctx()).unwrap();
    handler.reload();
    assert!(handler.get_all().unwrap().is_empty());
}

#[test]
fn test_rearm_after_restart() {
    let h = Harness::new(vec![
        EffectSpec::new("burn", "Burn")
            .with_duration(10.0)
            .with_tick_interval(4.0),
    ]);
    let mut handler = h.handler();
    apply(&mut handler, "burn");
    h.advance(&mut handler, 3.0);

    // Process restart: pending timers and in-memory state are gone
    h.scheduler.clear();
    drop(handler);
    let mut restarted = h.handler();
    assert_eq!(restarted.rearm().unwrap(), 1);
    assert_eq!(h.scheduler.len(), 2);

    let ticks_before = h.log.count("on_tick");
    h.advance(&mut restarted, 1.0);
    assert_eq!(h.log.count("on_tick"), ticks_before + 1);

    h.advance(&mut restarted, 6.0);
    assert!(restarted.get("burn").unwrap().is_none());
}

#[test]
fn test_rearm_expires_overdue_records_immediately() {
    let h = Harness::new(vec![EffectSpec::new("flash", "Flash").with_duration(5.0)]);
    let mut handler = h.handler();
    apply(&mut handler, "flash");

    h.scheduler.clear();
    h.clock.advance(60.0);
    let mut restarted = h.handler();
    restarted.rearm().unwrap();
    assert_eq!(h.scheduler.next_due(), Some(h.clock.now()));

    h.advance(&mut restarted, 0.0);
    assert!(restarted.get("flash").unwrap().is_none());
    assert_eq!(h.log.count("on_expire"), 1);
}

#[test]
fn test_orphaned_records_are_dropped_without_hooks() {
    let h = Harness::new(vec![EffectSpec::new("ghost", "Ghost")]);
    let mut handler = h.handler();
    apply(&mut handler, "ghost");
    h.log.clear();

    // Same store, registry without the definition
    let services = Services::new(
        Arc::new(EffectRegistry::new()),
        h.store.clone(),
        h.scheduler.clone(),
        h.clock.clone(),
    );
    let mut other = EffectHandler::new(EntityId::new(OWNER), services);
    assert_eq!(other.cleanup(&mut ctx()).unwrap(), 1);
    assert!(other.get_all().unwrap().is_empty());
    assert!(h.log.entries().is_empty());
}
