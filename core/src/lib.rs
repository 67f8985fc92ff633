pub mod clock;
pub mod config;
pub mod context;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod storage;

// Re-exports for convenience
pub use boons_types::{
    DefinitionConfig, EffectDuration, EffectSpec, EntityId, Modifier, ModifierOp, StackCap,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use context::Context;
pub use effects::{
    Aggregate, ApplyOptions, CheckOptions, EffectDefinition, EffectHandler, EffectHooks,
    EffectLine, EffectRecord, EffectRegistry, HookCtx, ModifierBreakdown, NoHooks,
    RemoveOptions, Services,
};
pub use engine::EffectEngine;
pub use error::{EffectError, HookError, HookResult, StoreError};
pub use events::{PresenceSignal, SignalHandler};
pub use scheduler::{ManualScheduler, ScheduledCall, Scheduler, TimerKind, TokioScheduler};
pub use storage::{AttributeStore, JsonFileStore, MemoryStore};
