//! Shared data types for boons.
//!
//! Everything in this crate is plain serde data: effect specs as they appear in
//! TOML definition files, stat modifiers, and entity references. Behavior
//! (hooks, scheduling, persistence) lives in `boons-core`.

pub mod formatting;

mod definition;
mod modifier;

pub use definition::{DefinitionConfig, EffectDuration, EffectSpec, MAX_DURATION_SECS, StackCap};
pub use modifier::{Modifier, ModifierOp};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to a game entity (owner of a handler, or source of an effect).
///
/// The engine never interprets the string; hosts usually store a database id
/// or dbref here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
