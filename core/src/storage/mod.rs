//! Attribute persistence
//!
//! Each owning entity keeps its effect records under one named attribute
//! (`EngineConfig::attribute_key`, "effects" by default). The store only sees
//! opaque JSON values; record layout is the handler's business.

mod json_file;
mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use boons_types::EntityId;
use serde_json::Value;

use crate::error::StoreError;

pub trait AttributeStore: Send + Sync {
    /// Read an attribute. `Ok(None)` when the entity has never stored it.
    fn load(&self, owner: &EntityId, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write an attribute, replacing any previous value
    fn save(&self, owner: &EntityId, key: &str, value: &Value) -> Result<(), StoreError>;
}
