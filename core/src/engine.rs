//! Multi-entity host wrapper
//!
//! `EffectEngine` owns one lazily created `EffectHandler` per entity and
//! routes fired timers and presence signals to the right one. Hosts that
//! manage handlers themselves can skip it and call `EffectHandler` directly.

use std::sync::Arc;

use boons_types::EntityId;
use hashbrown::HashMap;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::clock::{Clock, ManualClock};
use crate::config::{ConfigError, EngineConfig, load_registry};
use crate::context::Context;
use crate::effects::{EffectHandler, Services};
use crate::error::EffectError;
use crate::events::{PresenceSignal, SignalHandler};
use crate::scheduler::{ManualScheduler, ScheduledCall, Scheduler};
use crate::storage::{AttributeStore, JsonFileStore, MemoryStore};

pub struct EffectEngine {
    services: Services,
    handlers: HashMap<EntityId, EffectHandler>,
}

impl std::fmt::Debug for EffectEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectEngine")
            .field("services", &self.services)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EffectEngine {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            handlers: HashMap::new(),
        }
    }

    /// Build an engine from config: definitions from the configured
    /// directories, records in a `JsonFileStore` under the store dir (in
    /// memory when no store dir can be resolved).
    pub fn from_config(
        config: EngineConfig,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let registry = load_registry(&config)?;
        let store: Arc<dyn AttributeStore> = match config.store_dir() {
            Some(dir) => {
                tracing::info!(dir = %dir.display(), "Using JSON file effect store");
                Arc::new(JsonFileStore::new(dir))
            }
            None => {
                tracing::warn!("No store directory available, effects will not persist");
                Arc::new(MemoryStore::new())
            }
        };
        let services = Services::new(Arc::new(registry), store, scheduler, clock).with_config(config);
        Ok(Self::new(services))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Handler for `owner`, created on first use
    pub fn handler(&mut self, owner: &EntityId) -> &mut EffectHandler {
        let services = &self.services;
        self.handlers
            .entry(owner.clone())
            .or_insert_with(|| EffectHandler::new(owner.clone(), services.clone()))
    }

    /// Entities with a live handler
    pub fn loaded(&self) -> impl Iterator<Item = &EntityId> {
        self.handlers.keys()
    }

    /// Drop an entity's handler. Its timers stay scheduled; a call that fires
    /// later reloads the entity from the store.
    pub fn unload(&mut self, owner: &EntityId) -> Option<EffectHandler> {
        self.handlers.remove(owner)
    }

    // ─── Timers ─────────────────────────────────────────────────────────────

    /// Route fired calls to their handlers. Every call is processed; the
    /// first error is returned and later ones are logged.
    pub fn dispatch<I>(&mut self, calls: I, ctx: &mut Context) -> Result<usize, EffectError>
    where
        I: IntoIterator<Item = ScheduledCall>,
    {
        let mut handled = 0;
        let mut first_error = None;
        for call in calls {
            handled += 1;
            if let Err(e) = self.handler(&call.owner).handle_timer(&call, ctx) {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    tracing::warn!(owner = %call.owner, record = %call.record_key, error = %e, "Timer callback failed");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// Dispatch everything `scheduler` has due, including calls that become
    /// due while dispatching
    pub fn run_due(&mut self, scheduler: &ManualScheduler, ctx: &mut Context) -> Result<usize, EffectError> {
        let mut handled = 0;
        loop {
            let due = scheduler.drain_due();
            if due.is_empty() {
                return Ok(handled);
            }
            handled += self.dispatch(due, ctx)?;
        }
    }

    /// Move a manual clock forward by `secs`, stopping at each timer deadline
    /// on the way so callbacks observe the time they were scheduled for
    pub fn advance_manual(
        &mut self,
        clock: &ManualClock,
        scheduler: &ManualScheduler,
        secs: f64,
        ctx: &mut Context,
    ) -> Result<usize, EffectError> {
        let target = crate::clock::add_secs(clock.now(), secs);
        let mut handled = self.run_due(scheduler, ctx)?;
        while let Some(due) = scheduler.next_due() {
            if due > target {
                break;
            }
            clock.set(due.max(clock.now()));
            handled += self.run_due(scheduler, ctx)?;
        }
        clock.set(target);
        handled += self.run_due(scheduler, ctx)?;
        Ok(handled)
    }

    /// Feed calls from a `TokioScheduler` channel until it closes. Callback
    /// errors are logged, not returned.
    pub async fn pump(&mut self, rx: &mut UnboundedReceiver<ScheduledCall>) -> usize {
        let mut handled = 0;
        while let Some(call) = rx.recv().await {
            let mut ctx = Context::new();
            if let Err(e) = self.handler(&call.owner).handle_timer(&call, &mut ctx) {
                tracing::warn!(owner = %call.owner, record = %call.record_key, error = %e, "Timer callback failed");
            }
            handled += 1;
        }
        handled
    }

    /// Re-derive timers for the given entities after a restart
    pub fn rearm_all<I>(&mut self, owners: I) -> Result<usize, EffectError>
    where
        I: IntoIterator<Item = EntityId>,
    {
        let mut armed = 0;
        for owner in owners {
            armed += self.handler(&owner).rearm()?;
        }
        tracing::info!(armed, "Re-armed effect timers");
        Ok(armed)
    }

    // ─── Presence ───────────────────────────────────────────────────────────

    pub fn handle_presence(&mut self, signal: &PresenceSignal, ctx: &mut Context) -> Result<usize, EffectError> {
        self.handler(signal.entity()).handle_presence(signal, ctx)
    }
}

impl SignalHandler for EffectEngine {
    fn handle_signal(&mut self, signal: &PresenceSignal, ctx: &mut Context) -> Result<(), EffectError> {
        self.handle_presence(signal, ctx).map(|_| ())
    }
}
