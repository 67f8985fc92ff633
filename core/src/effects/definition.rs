//! Effect behavior: hooks paired with a spec

use std::fmt;
use std::sync::Arc;

use boons_types::{EffectSpec, EntityId};
use chrono::{DateTime, Utc};

use super::EffectRecord;
use crate::context::Context;
use crate::error::HookResult;

/// What a hook is bound to when it runs
pub struct HookCtx<'a> {
    /// The record the hook fires for; hooks may edit stacks and side data
    pub record: &'a mut EffectRecord,
    pub owner: &'a EntityId,
    pub now: DateTime<Utc>,
    pub spec: &'a EffectSpec,
}

impl HookCtx<'_> {
    pub fn stacks(&self) -> i32 {
        self.record.stacks
    }

    pub fn source(&self) -> Option<&EntityId> {
        self.record.source.as_ref()
    }
}

/// Lifecycle callbacks for an effect kind.
///
/// Every method has a no-op default, so an implementation only overrides what
/// it cares about. Hook errors are returned to whoever drove the operation
/// (the caller of `apply`, or the host routing a timer callback).
#[allow(unused_variables)]
pub trait EffectHooks: Send + Sync {
    fn on_apply(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_remove(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    /// Forced removal
    fn on_dispel(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    /// Natural end
    fn on_expire(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_pre_check(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_post_check(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_trigger(&self, event: &str, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    /// `is_first` is set for the tick that runs as part of `apply`
    fn on_tick(&self, is_first: bool, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_pause(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    fn on_unpause(&self, hook: &mut HookCtx<'_>, ctx: &mut Context) -> HookResult {
        Ok(())
    }

    /// Momentary gate for modifiers and triggers. Unlike pausing, this is
    /// evaluated fresh on every query and never persisted.
    fn conditional(&self, record: &EffectRecord, owner: &EntityId, ctx: &Context) -> bool {
        true
    }
}

/// Hooks for data-only effects
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl EffectHooks for NoHooks {}

/// A registered effect kind: spec data plus behavior
#[derive(Clone)]
pub struct EffectDefinition {
    pub spec: EffectSpec,
    pub hooks: Arc<dyn EffectHooks>,
}

impl EffectDefinition {
    pub fn new(spec: EffectSpec, hooks: Arc<dyn EffectHooks>) -> Self {
        Self { spec, hooks }
    }

    /// Definition with no behavior beyond its modifiers
    pub fn data_only(spec: EffectSpec) -> Self {
        Self::new(spec, Arc::new(NoHooks))
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }
}

impl fmt::Debug for EffectDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectDefinition")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}
