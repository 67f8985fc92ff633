//! Status effect engine
//!
//! This module provides:
//! - **Definitions**: Effect kinds (TOML spec data plus hook behavior) held in a registry
//! - **Records**: Persisted runtime state of each applied effect
//! - **Handler**: Per-entity manager for apply/remove/query/check/trigger/pause
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                EffectRegistry (TOML + hooks in code)             │
//! │     "poison: 30s, ticks every 5s, -1 regen per stack, max 5"     │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                   EffectHandler::apply("poison")
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  EffectRecord (persisted state)                  │
//! │        "#12 has poison x3, started 8s ago, last tick 3s ago"     │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                      ▲
//!   check / trigger / view                Scheduler (tick, expire)
//!            ▼                                      │
//!      game systems                      ScheduledCall -> handle_timer
//! ```

mod aggregate;
mod definition;
mod handler;
mod lifecycle;
mod record;
mod registry;

#[cfg(test)]
mod handler_tests;

pub use aggregate::{Aggregate, ModifierBreakdown};
pub use definition::{EffectDefinition, EffectHooks, HookCtx, NoHooks};
pub use handler::{ApplyOptions, CheckOptions, EffectHandler, EffectLine, RemoveOptions, Services};
pub use record::EffectRecord;
pub use registry::EffectRegistry;
