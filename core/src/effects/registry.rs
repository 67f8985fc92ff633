//! Definition registry
//!
//! Records only store a definition key; everything else about an effect kind
//! is looked up here on each operation.

use std::collections::HashMap;
use std::sync::Arc;

use boons_types::EffectSpec;

use super::definition::{EffectDefinition, EffectHooks, NoHooks};
use crate::error::EffectError;

/// All known effect kinds with indexes for stat and trigger lookup
#[derive(Debug, Clone, Default)]
pub struct EffectRegistry {
    definitions: HashMap<String, Arc<EffectDefinition>>,

    // ─── Indexes ────────────────────────────────────────────────────────────
    /// Stat -> definition keys carrying a modifier for it
    stat_index: HashMap<String, Vec<String>>,
    /// Event -> definition keys listing it as a trigger
    trigger_index: HashMap<String, Vec<String>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect kind, replacing any previous definition with the same key
    pub fn register(&mut self, spec: EffectSpec, hooks: Arc<dyn EffectHooks>) -> Result<(), EffectError> {
        let problems = spec.problems();
        // default_stacks below 1 is tolerated (floored when applied)
        let fatal: Vec<_> = problems
            .into_iter()
            .filter(|p| !p.starts_with("default_stacks"))
            .collect();
        if !fatal.is_empty() {
            return Err(EffectError::InvalidDefinition {
                key: spec.key.clone(),
                reason: fatal.join("; "),
            });
        }

        if self.definitions.contains_key(&spec.key) {
            self.remove_from_indexes(&spec.key);
        }
        let def = EffectDefinition::new(spec, hooks);
        self.add_to_indexes(&def);
        self.definitions.insert(def.spec.key.clone(), Arc::new(def));
        Ok(())
    }

    /// Register a data-only effect kind
    pub fn register_spec(&mut self, spec: EffectSpec) -> Result<(), EffectError> {
        self.register(spec, Arc::new(NoHooks))
    }

    /// Swap in behavior for a kind that was loaded from data files.
    /// Returns false if the key is unknown.
    pub fn attach_hooks(&mut self, key: &str, hooks: Arc<dyn EffectHooks>) -> bool {
        match self.definitions.get_mut(key) {
            Some(def) => {
                *def = Arc::new(EffectDefinition::new(def.spec.clone(), hooks));
                true
            }
            None => false,
        }
    }

    /// Add data-only definitions. If `overwrite` is true, replaces existing definitions with same key.
    /// Returns keys of duplicates that were encountered (skipped if !overwrite, replaced if overwrite).
    /// Specs that fail validation are skipped with a warning.
    pub fn add_definitions(&mut self, specs: Vec<EffectSpec>, overwrite: bool) -> Vec<String> {
        let mut duplicates = Vec::new();
        for spec in specs {
            if let Some(existing) = self.definitions.get(&spec.key) {
                duplicates.push(spec.key.clone());
                if !overwrite {
                    continue;
                }
                // Keep behavior attached in code when data is overridden
                let hooks = existing.hooks.clone();
                if let Err(e) = self.register(spec, hooks) {
                    tracing::warn!(error = %e, "Skipping invalid effect definition");
                }
                continue;
            }
            if let Err(e) = self.register_spec(spec) {
                tracing::warn!(error = %e, "Skipping invalid effect definition");
            }
        }
        duplicates
    }

    pub fn get(&self, key: &str) -> Option<&Arc<EffectDefinition>> {
        self.definitions.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.definitions.contains_key(key)
    }

    /// Definition keys with a modifier for `stat`
    pub fn keys_with_stat(&self, stat: &str) -> &[String] {
        self.stat_index.get(stat).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Definition keys that react to `event`
    pub fn keys_with_trigger(&self, event: &str) -> &[String] {
        self.trigger_index.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn add_to_indexes(&mut self, def: &EffectDefinition) {
        let key = def.spec.key.clone();
        for modifier in &def.spec.modifiers {
            let keys = self.stat_index.entry(modifier.stat.clone()).or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        }
        for event in &def.spec.triggers {
            self.trigger_index
                .entry(event.clone())
                .or_default()
                .push(key.clone());
        }
    }

    fn remove_from_indexes(&mut self, key: &str) {
        for keys in self.stat_index.values_mut() {
            keys.retain(|k| k != key);
        }
        for keys in self.trigger_index.values_mut() {
            keys.retain(|k| k != key);
        }
        self.stat_index.retain(|_, keys| !keys.is_empty());
        self.trigger_index.retain(|_, keys| !keys.is_empty());
    }
}
