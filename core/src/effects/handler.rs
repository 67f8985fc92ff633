//! Entity-bound effect manager
//!
//! An `EffectHandler` owns the effect collection of one entity. The collection
//! is read from the attribute store on first use and written back at the end
//! of every public call that changes it. Timer-driven behavior (ticks,
//! expiry, pause/resume, restart) lives in `lifecycle.rs`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use boons_types::formatting::{format_lifetime, format_stacks};
use boons_types::{EffectDuration, EffectSpec, EntityId, StackCap};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::aggregate::ModifierBreakdown;
use super::definition::{EffectDefinition, EffectHooks, HookCtx};
use super::lifecycle::ArmedTimers;
use super::{EffectRecord, EffectRegistry};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{EffectError, HookResult, StoreError};
use crate::scheduler::Scheduler;
use crate::storage::AttributeStore;

/// Shared collaborators for every handler in a process
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<EffectRegistry>,
    pub store: Arc<dyn AttributeStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
}

impl Services {
    pub fn new(
        registry: Arc<EffectRegistry>,
        store: Arc<dyn AttributeStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            scheduler,
            clock,
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("definitions", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Call options
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOptions {
    /// Stacks to grant (0 = the definition's default)
    pub stacks: i32,
    /// Overrides the definition's duration
    pub duration: Option<EffectDuration>,
    pub source: Option<EntityId>,
    /// Merged into the record's side data
    pub side_data: Map<String, Value>,
    /// Use this record key instead of deriving one
    pub record_key: Option<String>,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stacks(mut self, stacks: i32) -> Self {
        self.stacks = stacks;
        self
    }

    pub fn with_duration(mut self, duration: impl Into<EffectDuration>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<EntityId>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_side(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.side_data.insert(key.into(), value.into());
        self
    }

    pub fn with_record_key(mut self, key: impl Into<String>) -> Self {
        self.record_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Run removal hooks
    pub loud: bool,
    /// Forced removal: `on_dispel` before `on_remove`
    pub dispel: bool,
    /// Natural end: `on_expire` before `on_remove` (ignored when `dispel` is set)
    pub expire: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            loud: true,
            dispel: false,
            expire: false,
        }
    }
}

impl RemoveOptions {
    /// Delete without running hooks
    pub fn quiet() -> Self {
        Self {
            loud: false,
            ..Self::default()
        }
    }

    pub fn dispel() -> Self {
        Self {
            dispel: true,
            ..Self::default()
        }
    }

    pub fn expire() -> Self {
        Self {
            expire: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOptions {
    /// Run `on_post_check` after folding
    pub loud: bool,
    /// Also fire the stat name as a trigger event
    pub trigger: bool,
    /// Use the strongest single contribution per operation instead of the sum
    pub strongest: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            loud: true,
            trigger: false,
            strongest: false,
        }
    }
}

impl CheckOptions {
    pub fn quiet() -> Self {
        Self {
            loud: false,
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self) -> Self {
        self.trigger = true;
        self
    }

    pub fn strongest(mut self) -> Self {
        self.strongest = true;
        self
    }
}

/// One row of a detailed effect listing
#[derive(Debug, Clone, PartialEq)]
pub struct EffectLine {
    pub record_key: String,
    pub name: String,
    pub flavor: String,
    pub stacks: i32,
    /// Seconds left, `None` when permanent
    pub remaining: Option<f64>,
    pub paused: bool,
}

impl fmt::Display for EffectLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let stacks = format_stacks(self.stacks);
        if !stacks.is_empty() {
            write!(f, " {stacks}")?;
        }
        write!(f, " ({})", format_lifetime(self.remaining))?;
        if self.paused {
            write!(f, " [paused]")?;
        }
        if !self.flavor.is_empty() {
            write!(f, " - {}", self.flavor)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════

pub struct EffectHandler {
    pub(super) owner: EntityId,
    pub(super) services: Services,
    /// `None` until first access
    pub(super) records: Option<BTreeMap<String, EffectRecord>>,
    /// Live scheduler handles per record, for cancellation
    pub(super) timers: HashMap<String, ArmedTimers>,
    /// Uncapped definitions already warned about
    warned_uncapped: HashSet<String>,
}

impl fmt::Debug for EffectHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectHandler")
            .field("owner", &self.owner)
            .field("loaded", &self.records.as_ref().map(BTreeMap::len))
            .finish_non_exhaustive()
    }
}

impl EffectHandler {
    pub fn new(owner: EntityId, services: Services) -> Self {
        Self {
            owner,
            services,
            records: None,
            timers: HashMap::new(),
            warned_uncapped: HashSet::new(),
        }
    }

    pub fn owner(&self) -> &EntityId {
        &self.owner
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub(super) fn definition(&self, key: &str) -> Option<Arc<EffectDefinition>> {
        self.services.registry.get(key).cloned()
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    pub(super) fn ensure_loaded(&mut self) -> Result<(), EffectError> {
        if self.records.is_some() {
            return Ok(());
        }
        let key = &self.services.config.attribute_key;
        let stored = match self.services.store.load(&self.owner, key) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(owner = %self.owner, error = %e, "Effect load failed, retrying");
                self.services.store.load(&self.owner, key)?
            }
        };
        let records = match stored {
            Some(value) => serde_json::from_value(value).map_err(|source| StoreError::Json {
                owner: self.owner.to_string(),
                source,
            })?,
            None => BTreeMap::new(),
        };
        self.records = Some(records);
        Ok(())
    }

    pub(super) fn records_mut(&mut self) -> Result<&mut BTreeMap<String, EffectRecord>, EffectError> {
        self.ensure_loaded()?;
        Ok(self.records.get_or_insert_with(BTreeMap::new))
    }

    fn records(&mut self) -> Result<&BTreeMap<String, EffectRecord>, EffectError> {
        self.records_mut().map(|records| &*records)
    }

    pub(super) fn record_mut(&mut self, key: &str) -> Option<&mut EffectRecord> {
        self.records.as_mut().and_then(|records| records.get_mut(key))
    }

    pub(super) fn save(&mut self) -> Result<(), EffectError> {
        let Some(records) = &self.records else {
            return Ok(());
        };
        let value = serde_json::to_value(records).map_err(|source| StoreError::Json {
            owner: self.owner.to_string(),
            source,
        })?;
        let key = &self.services.config.attribute_key;
        if let Err(e) = self.services.store.save(&self.owner, key, &value) {
            tracing::warn!(owner = %self.owner, error = %e, "Effect save failed, re-reading store before retry");
            self.services.store.load(&self.owner, key)?;
            self.services.store.save(&self.owner, key, &value)?;
        }
        Ok(())
    }

    /// Drop the cached collection so the next call re-reads the store
    pub fn reload(&mut self) {
        self.records = None;
    }

    // ─── Hooks ──────────────────────────────────────────────────────────────

    /// Run one hook against a loaded record. Missing records are skipped.
    pub(super) fn run_hook<F>(
        &mut self,
        record_key: &str,
        hook_name: &'static str,
        def: &EffectDefinition,
        ctx: &mut Context,
        call: F,
    ) -> Result<(), EffectError>
    where
        F: FnOnce(&dyn EffectHooks, &mut HookCtx<'_>, &mut Context) -> HookResult,
    {
        let now = self.services.clock.now();
        let Some(record) = self.records.as_mut().and_then(|records| records.get_mut(record_key)) else {
            return Ok(());
        };
        let mut hook = HookCtx {
            record,
            owner: &self.owner,
            now,
            spec: &def.spec,
        };
        call(def.hooks.as_ref(), &mut hook, ctx).map_err(|source| EffectError::Hook {
            record: record_key.to_string(),
            hook: hook_name,
            source,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Apply
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply an effect, creating or merging into its record. Returns the record key.
    pub fn apply(&mut self, key: &str, opts: ApplyOptions, ctx: &mut Context) -> Result<String, EffectError> {
        let def = self
            .definition(key)
            .ok_or_else(|| EffectError::UnknownDefinition(key.to_string()))?;
        if let Some(reason) = opts.duration.and_then(|d| d.problem()) {
            return Err(EffectError::InvalidDefinition {
                key: key.to_string(),
                reason: format!("duration override: {reason}"),
            });
        }
        let now = self.now();
        self.ensure_loaded()?;

        let record_key = self.record_key_for(&def.spec, &opts)?;
        let duration = opts.duration.unwrap_or(def.spec.duration);
        let existed;
        let stacks;
        {
            let records = self.records_mut()?;
            existed = records.contains_key(&record_key);
            let record = records
                .entry(record_key.clone())
                .or_insert_with(|| new_record(&record_key, &def.spec, &opts, duration, now));
            if existed {
                reapply(record, &def.spec, opts, duration, now);
            }
            stacks = record.stacks;
        }

        if def.spec.stack_cap() == StackCap::Uncapped && stacks > 1 {
            self.warn_uncapped(&def.spec);
        }

        tracing::debug!(
            owner = %self.owner,
            record = %record_key,
            definition = key,
            stacks,
            reapplied = existed,
            "Applied effect"
        );

        if duration == EffectDuration::Instant {
            let fired = self.fire_instant(&record_key, &def, ctx);
            if fired.is_err() && !existed {
                self.drop_record(&record_key);
            }
            fired?;
            if existed {
                self.save()?;
            }
            return Ok(record_key);
        }

        self.save()?;
        let applied = self.run_hook(&record_key, "on_apply", &def, ctx, |hooks, hook, ctx| {
            hooks.on_apply(hook, ctx)
        });

        let paused = self.record_mut(&record_key).is_some_and(|r| r.paused);
        let armed = if paused {
            Ok(())
        } else {
            self.arm(&record_key, &def, applied.is_ok(), ctx)
        };
        self.save()?;
        applied?;
        armed?;
        Ok(record_key)
    }

    fn fire_instant(&mut self, record_key: &str, def: &EffectDefinition, ctx: &mut Context) -> Result<(), EffectError> {
        self.run_hook(record_key, "on_apply", def, ctx, |hooks, hook, ctx| {
            hooks.on_apply(hook, ctx)
        })?;
        if self.record_mut(record_key).is_some_and(|r| r.is_ticking()) {
            self.fire_tick(record_key, def, true, ctx)?;
        }
        self.remove_loaded(record_key, RemoveOptions::expire(), ctx)?;
        Ok(())
    }

    fn record_key_for(&mut self, spec: &EffectSpec, opts: &ApplyOptions) -> Result<String, EffectError> {
        if let Some(key) = &opts.record_key {
            return Ok(key.clone());
        }
        if spec.unique {
            return Ok(spec.key.clone());
        }
        if let Some(source) = &opts.source {
            return Ok(format!("{}_{}", spec.key, source));
        }
        if spec.refresh_on_reapply {
            return Ok(spec.key.clone());
        }
        let records = self.records()?;
        loop {
            let candidate = format!("{}_{:08x}", spec.key, rand::random::<u32>());
            if !records.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    fn warn_uncapped(&mut self, spec: &EffectSpec) {
        if self.services.config.warn_uncapped_stacks && self.warned_uncapped.insert(spec.key.clone()) {
            tracing::warn!(
                owner = %self.owner,
                definition = %spec.key,
                max_stacks = spec.max_stacks,
                "Effect stacking without a cap (max_stacks < 1)"
            );
        }
    }

    /// Remove a record from the cache without hooks or saving
    fn drop_record(&mut self, record_key: &str) {
        self.cancel_timers(record_key);
        if let Some(records) = self.records.as_mut() {
            records.remove(record_key);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Removal
    // ═══════════════════════════════════════════════════════════════════════

    /// Remove a record. Returns false if no such record exists.
    pub fn remove(&mut self, record_key: &str, opts: RemoveOptions, ctx: &mut Context) -> Result<bool, EffectError> {
        self.ensure_loaded()?;
        let removed = self.remove_loaded(record_key, opts, ctx)?;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Take `count` stacks off a record, removing it (with hooks) once none
    /// remain. Returns the stacks left, or `None` for an unknown record.
    pub fn remove_stacks(
        &mut self,
        record_key: &str,
        count: i32,
        opts: RemoveOptions,
        ctx: &mut Context,
    ) -> Result<Option<i32>, EffectError> {
        self.ensure_loaded()?;
        let Some(record) = self.record_mut(record_key) else {
            return Ok(None);
        };
        record.stacks = record.stacks.saturating_sub(count.max(0));
        let left = record.stacks.max(0);
        if left == 0 {
            self.remove_loaded(record_key, opts, ctx)?;
        }
        self.save()?;
        Ok(Some(left))
    }

    pub(super) fn remove_loaded(
        &mut self,
        record_key: &str,
        opts: RemoveOptions,
        ctx: &mut Context,
    ) -> Result<bool, EffectError> {
        let Some(definition_key) = self
            .records
            .as_ref()
            .and_then(|records| records.get(record_key))
            .map(|r| r.definition_key.clone())
        else {
            return Ok(false);
        };

        if opts.loud {
            match self.definition(&definition_key) {
                Some(def) => {
                    if opts.dispel {
                        self.run_hook(record_key, "on_dispel", &def, ctx, |hooks, hook, ctx| {
                            hooks.on_dispel(hook, ctx)
                        })?;
                    } else if opts.expire {
                        self.run_hook(record_key, "on_expire", &def, ctx, |hooks, hook, ctx| {
                            hooks.on_expire(hook, ctx)
                        })?;
                    }
                    self.run_hook(record_key, "on_remove", &def, ctx, |hooks, hook, ctx| {
                        hooks.on_remove(hook, ctx)
                    })?;
                }
                None => {
                    tracing::warn!(
                        owner = %self.owner,
                        record = record_key,
                        definition = %definition_key,
                        "Removing effect with unknown definition, hooks skipped"
                    );
                }
            }
        }

        self.drop_record(record_key);
        tracing::debug!(
            owner = %self.owner,
            record = record_key,
            dispel = opts.dispel,
            expire = opts.expire,
            "Removed effect"
        );
        Ok(true)
    }

    fn remove_keys(&mut self, keys: Vec<String>, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let mut removed = 0;
        for key in keys {
            match self.remove_loaded(&key, opts, ctx) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    if removed > 0 {
                        self.save()?;
                    }
                    return Err(e);
                }
            }
        }
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn remove_by_definition(&mut self, definition_key: &str, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.matching_keys(|record, _| record.definition_key == definition_key)?;
        self.remove_keys(keys, opts, ctx)
    }

    pub fn remove_by_stat(&mut self, stat: &str, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.matching_keys(|_, spec| spec.is_some_and(|s| s.has_stat(stat)))?;
        self.remove_keys(keys, opts, ctx)
    }

    pub fn remove_by_trigger(&mut self, event: &str, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.matching_keys(|_, spec| spec.is_some_and(|s| s.has_trigger(event)))?;
        self.remove_keys(keys, opts, ctx)
    }

    pub fn remove_by_source(&mut self, source: &EntityId, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.matching_keys(|record, _| record.source.as_ref() == Some(source))?;
        self.remove_keys(keys, opts, ctx)
    }

    pub fn remove_by_side_data(
        &mut self,
        key: &str,
        value: &Value,
        opts: RemoveOptions,
        ctx: &mut Context,
    ) -> Result<usize, EffectError> {
        let keys = self.matching_keys(|record, _| record.side_value(key) == Some(value))?;
        self.remove_keys(keys, opts, ctx)
    }

    /// Remove every record
    pub fn clear(&mut self, opts: RemoveOptions, ctx: &mut Context) -> Result<usize, EffectError> {
        let keys = self.records()?.keys().cloned().collect();
        self.remove_keys(keys, opts, ctx)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get(&mut self, record_key: &str) -> Result<Option<&EffectRecord>, EffectError> {
        Ok(self.records()?.get(record_key))
    }

    pub fn get_all(&mut self) -> Result<&BTreeMap<String, EffectRecord>, EffectError> {
        self.records()
    }

    /// Whether an unspent record of this definition exists
    pub fn has(&mut self, definition_key: &str) -> Result<bool, EffectError> {
        let now = self.now();
        Ok(self
            .records()?
            .values()
            .any(|r| r.definition_key == definition_key && !r.is_spent(now)))
    }

    fn matching_keys<F>(&mut self, pred: F) -> Result<Vec<String>, EffectError>
    where
        F: Fn(&EffectRecord, Option<&EffectSpec>) -> bool,
    {
        Ok(self
            .select(pred)?
            .into_iter()
            .map(|r| r.record_key.clone())
            .collect())
    }

    fn select<F>(&mut self, pred: F) -> Result<Vec<&EffectRecord>, EffectError>
    where
        F: Fn(&EffectRecord, Option<&EffectSpec>) -> bool,
    {
        let registry = self.services.registry.clone();
        Ok(self
            .records()?
            .values()
            .filter(|r| pred(r, registry.get(&r.definition_key).map(|d| &d.spec)))
            .collect())
    }

    pub fn get_by_definition(&mut self, definition_key: &str) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|record, _| record.definition_key == definition_key)
    }

    pub fn get_by_stat(&mut self, stat: &str) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| s.has_stat(stat)))
    }

    pub fn get_by_trigger(&mut self, event: &str) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| s.has_trigger(event)))
    }

    pub fn get_by_source(&mut self, source: &EntityId) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|record, _| record.source.as_ref() == Some(source))
    }

    pub fn get_by_side_data(&mut self, key: &str, value: &Value) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|record, _| record.side_value(key) == Some(value))
    }

    /// Records whose definition modifies stats
    pub fn traits(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| !s.modifiers.is_empty()))
    }

    /// Records whose definition reacts to events
    pub fn effects(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| !s.triggers.is_empty()))
    }

    /// Records that only run while the owner is online
    pub fn playtime(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| s.pauses_when_offline))
    }

    pub fn paused(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|record, _| record.paused)
    }

    /// Records `cleanup` would purge
    pub fn expired(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        let now = self.now();
        self.select(|record, spec| spec.is_none() || record.is_spent(now))
    }

    pub fn visible(&mut self) -> Result<Vec<&EffectRecord>, EffectError> {
        self.select(|_, spec| spec.is_some_and(|s| s.visible))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Modifier aggregation
    // ═══════════════════════════════════════════════════════════════════════

    /// Fold every applicable modifier for `stat` into `value`
    ///
    /// A failing check hook stops the remaining hooks; edits made by the ones
    /// that already ran are saved before the error is returned.
    pub fn check(&mut self, value: f64, stat: &str, opts: CheckOptions, ctx: &mut Context) -> Result<f64, EffectError> {
        self.cleanup(ctx)?;
        let registry = self.services.registry.clone();
        let selected = self.select_active(ctx, registry.keys_with_stat(stat));

        let pre_checked = selected.iter().try_for_each(|(key, def)| {
            self.run_hook(key, "on_pre_check", def, ctx, |hooks, hook, ctx| {
                hooks.on_pre_check(hook, ctx)
            })
        });
        let folded = pre_checked.map(|()| self.breakdown(stat, &selected).fold(value, opts.strongest));
        let checked = match folded {
            Ok(result) if opts.loud => selected
                .iter()
                .try_for_each(|(key, def)| {
                    self.run_hook(key, "on_post_check", def, ctx, |hooks, hook, ctx| {
                        hooks.on_post_check(hook, ctx)
                    })
                })
                .map(|()| result),
            other => other,
        };
        if !selected.is_empty() {
            self.save()?;
        }
        let result = checked?;

        if opts.trigger {
            self.trigger(stat, ctx)?;
        }
        Ok(result)
    }

    /// Raw per-operation aggregates for `stat`. Only `conditional` runs; no
    /// check hooks fire.
    pub fn view_modifiers(&mut self, stat: &str, ctx: &mut Context) -> Result<ModifierBreakdown, EffectError> {
        self.cleanup(ctx)?;
        let registry = self.services.registry.clone();
        let selected = self.select_active(ctx, registry.keys_with_stat(stat));
        Ok(self.breakdown(stat, &selected))
    }

    /// Unpaused records of the `candidates` definitions whose conditional
    /// holds, in record key order
    fn select_active(&self, ctx: &Context, candidates: &[String]) -> Vec<(String, Arc<EffectDefinition>)> {
        let Some(records) = &self.records else {
            return Vec::new();
        };
        if candidates.is_empty() {
            return Vec::new();
        }
        records
            .values()
            .filter(|record| !record.paused && candidates.contains(&record.definition_key))
            .filter_map(|record| {
                let def = self.definition(&record.definition_key)?;
                def.hooks
                    .conditional(record, &self.owner, ctx)
                    .then(|| (record.record_key.clone(), def))
            })
            .collect()
    }

    fn breakdown(&self, stat: &str, selected: &[(String, Arc<EffectDefinition>)]) -> ModifierBreakdown {
        let mut breakdown = ModifierBreakdown::new(stat);
        let Some(records) = &self.records else {
            return breakdown;
        };
        for (key, def) in selected {
            let Some(record) = records.get(key) else {
                continue;
            };
            for modifier in def.spec.modifiers_for(stat) {
                breakdown.push(modifier.operation, modifier.contribution(record.stacks));
            }
            breakdown.records.push(key.clone());
        }
        breakdown
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Triggers
    // ═══════════════════════════════════════════════════════════════════════

    /// Fire `on_trigger` on every active record listening for `event`.
    ///
    /// All selected records fire even if one fails; the first error is
    /// returned after the collection is saved. Returns the number fired.
    pub fn trigger(&mut self, event: &str, ctx: &mut Context) -> Result<usize, EffectError> {
        self.cleanup(ctx)?;
        let registry = self.services.registry.clone();
        let selected = self.select_active(ctx, registry.keys_with_trigger(event));
        if selected.is_empty() {
            return Ok(0);
        }

        let mut first_error = None;
        for (key, def) in &selected {
            let fired = self.run_hook(key, "on_trigger", def, ctx, |hooks, hook, ctx| {
                hooks.on_trigger(event, hook, ctx)
            });
            if let Err(e) = fired {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    tracing::warn!(owner = %self.owner, record = %key, event, error = %e, "Trigger hook failed");
                }
            }
        }
        tracing::debug!(owner = %self.owner, event, fired = selected.len(), "Dispatched trigger");

        self.save()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(selected.len()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Views & cleanup
    // ═══════════════════════════════════════════════════════════════════════

    /// Visible records as `record key -> (name, flavor)`
    pub fn view(&mut self, ctx: &mut Context) -> Result<BTreeMap<String, (String, String)>, EffectError> {
        self.view_matching(|_| true, ctx)
    }

    /// Like `view`, restricted to records passing `filter`
    pub fn view_matching<F>(&mut self, filter: F, ctx: &mut Context) -> Result<BTreeMap<String, (String, String)>, EffectError>
    where
        F: Fn(&EffectRecord) -> bool,
    {
        Ok(self
            .view_detailed(ctx)?
            .into_iter()
            .filter(|line| {
                self.records
                    .as_ref()
                    .and_then(|records| records.get(&line.record_key))
                    .is_some_and(&filter)
            })
            .map(|line| (line.record_key, (line.name, line.flavor)))
            .collect())
    }

    /// Visible records with stacks and remaining time, in record key order
    pub fn view_detailed(&mut self, ctx: &mut Context) -> Result<Vec<EffectLine>, EffectError> {
        self.cleanup(ctx)?;
        let now = self.now();
        let registry = self.services.registry.clone();
        Ok(self
            .records()?
            .values()
            .filter_map(|record| {
                let spec = &registry.get(&record.definition_key)?.spec;
                spec.visible.then(|| EffectLine {
                    record_key: record.record_key.clone(),
                    name: spec.display_name().to_string(),
                    flavor: spec.flavor.clone(),
                    stacks: record.stacks,
                    remaining: record.remaining(now),
                    paused: record.paused,
                })
            })
            .collect())
    }

    /// Purge expired and depleted records, running `on_expire` then
    /// `on_remove` for each. Records whose definition is no longer registered
    /// are dropped without hooks. Returns the number purged; saves only when
    /// something was purged.
    pub fn cleanup(&mut self, ctx: &mut Context) -> Result<usize, EffectError> {
        let now = self.now();
        let registry = self.services.registry.clone();
        let spent: Vec<(String, bool)> = self
            .records()?
            .values()
            .filter_map(|record| {
                let known = registry.contains(&record.definition_key);
                (!known || record.is_spent(now)).then(|| (record.record_key.clone(), known))
            })
            .collect();
        if spent.is_empty() {
            return Ok(0);
        }

        let mut purged = 0;
        for (key, known) in spent {
            if known {
                if let Err(e) = self.remove_loaded(&key, RemoveOptions::expire(), ctx) {
                    if purged > 0 {
                        self.save()?;
                    }
                    return Err(e);
                }
            } else {
                tracing::warn!(owner = %self.owner, record = %key, "Dropping effect with unknown definition");
                self.drop_record(&key);
            }
            purged += 1;
        }
        self.save()?;
        Ok(purged)
    }
}

// ─── Stacking rules ─────────────────────────────────────────────────────────

/// Stacks for a first application
fn initial_stacks(spec: &EffectSpec, requested: i32) -> i32 {
    let base = if requested > 0 { requested } else { spec.default_stacks };
    let capped = match spec.stack_cap() {
        StackCap::Single => 1,
        StackCap::Capped(max) => base.min(max),
        StackCap::Uncapped => base,
    };
    capped.max(1)
}

/// Stacks after reapplying on top of `existing`
fn stacked(spec: &EffectSpec, existing: i32, requested: i32) -> i32 {
    let add = if requested > 0 { requested } else { spec.default_stacks.max(1) };
    match spec.stack_cap() {
        StackCap::Single => existing,
        StackCap::Capped(max) => existing.saturating_add(add).min(max),
        StackCap::Uncapped => existing.saturating_add(add),
    }
}

fn new_record(
    record_key: &str,
    spec: &EffectSpec,
    opts: &ApplyOptions,
    duration: EffectDuration,
    now: DateTime<Utc>,
) -> EffectRecord {
    let mut record = EffectRecord::new(record_key, spec, now);
    record.stacks = initial_stacks(spec, opts.stacks);
    record.duration = duration;
    record.source = opts.source.clone();
    record.side_data = opts.side_data.clone();
    record
}

fn reapply(record: &mut EffectRecord, spec: &EffectSpec, opts: ApplyOptions, duration: EffectDuration, now: DateTime<Utc>) {
    record.stacks = stacked(spec, record.stacks, opts.stacks);
    if spec.refresh_on_reapply {
        record.duration = duration;
        if record.paused {
            record.remaining_duration = duration.secs();
        } else {
            record.started_at = now;
        }
    }
    if let Some(source) = opts.source {
        record.source = Some(source);
    }
    record.side_data.extend(opts.side_data);
}
