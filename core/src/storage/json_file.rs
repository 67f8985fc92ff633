use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use boons_types::EntityId;
use serde_json::{Map, Value};

use super::AttributeStore;
use crate::error::StoreError;

/// One JSON file per entity, holding `attribute key -> value`.
///
/// Writes go to a sibling temp file that is then renamed over the original,
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `owner`'s attributes
    pub fn path_for(&self, owner: &EntityId) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(owner.as_str())))
    }

    fn read_all(&self, owner: &EntityId) -> Result<Map<String, Value>, StoreError> {
        let path = self.path_for(owner);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&contents).map_err(|source| StoreError::Json {
            owner: owner.to_string(),
            source,
        })
    }
}

impl AttributeStore for JsonFileStore {
    fn load(&self, owner: &EntityId, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_all(owner)?.remove(key))
    }

    fn save(&self, owner: &EntityId, key: &str, value: &Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut attributes = self.read_all(owner)?;
        attributes.insert(key.to_string(), value.clone());

        let path = self.path_for(owner);
        let contents = serde_json::to_string_pretty(&attributes).map_err(|source| StoreError::Json {
            owner: owner.to_string(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }
}

/// Entity ids may contain characters that aren't safe in file names (`#` in
/// dbrefs is fine, `/` is not)
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '#' | '.' => c,
            _ => '_',
        })
        .collect()
}
