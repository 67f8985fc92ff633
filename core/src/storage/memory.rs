use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use boons_types::EntityId;
use serde_json::Value;

use super::AttributeStore;
use crate::error::StoreError;

/// In-process store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    attributes: Mutex<HashMap<(EntityId, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored attributes across all entities
    pub fn len(&self) -> usize {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeStore for MemoryStore {
    fn load(&self, owner: &EntityId, key: &str) -> Result<Option<Value>, StoreError> {
        let attributes = self.attributes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(attributes.get(&(owner.clone(), key.to_string())).cloned())
    }

    fn save(&self, owner: &EntityId, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut attributes = self.attributes.lock().unwrap_or_else(PoisonError::into_inner);
        attributes.insert((owner.clone(), key.to_string()), value.clone());
        Ok(())
    }
}
