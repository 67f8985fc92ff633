use boons_types::EntityId;
use serde::{Deserialize, Serialize};

/// Presence notifications delivered by the host.
/// Handlers use these to pause and resume effects that only count down while
/// the owner is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceSignal {
    /// Entity attached to a live session
    Online { entity: EntityId },
    /// Entity detached from its session
    Offline { entity: EntityId },
}

impl PresenceSignal {
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::Online { entity } | Self::Offline { entity } => entity,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online { .. })
    }
}
