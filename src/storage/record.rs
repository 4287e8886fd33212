//! A named, file-backed key/value record
//!
//! Writes go to a sibling `.tmp` file which is then renamed over the target,
//! so a reader never observes a half-written record. With autosave enabled
//! every mutation is persisted before the call returns.

use crate::error::{EngineError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File extension of persisted records
pub const RECORD_EXTENSION: &str = "json";

const UNSAFE_NAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// A persisted map from attribute name to JSON value
#[derive(Debug, Clone)]
pub struct PersistentRecord {
    name: String,
    path: PathBuf,
    fields: BTreeMap<String, Value>,
    autosave: bool,
}

impl PersistentRecord {
    /// Bind a record to `<dir>/<name>.json`, loading its content if the file
    /// already exists.
    ///
    /// A file that exists but cannot be decoded yields
    /// [`EngineError::LockCorrupt`]; the file is left in place.
    pub fn open(dir: &Path, name: &str, autosave: bool) -> Result<Self> {
        let path = Self::path_for(dir, name);
        let mut record = Self {
            name: name.to_string(),
            path,
            fields: BTreeMap::new(),
            autosave,
        };

        if record.path.exists() {
            record.load()?;
        }

        Ok(record)
    }

    /// File path used for a record named `name` inside `dir`
    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        let safe_name = name.replace(UNSAFE_NAME_CHARS, "_");
        dir.join(format!("{safe_name}.{RECORD_EXTENSION}"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn autosave(&self) -> bool {
        self.autosave
    }

    pub fn set_autosave(&mut self, autosave: bool) {
        self.autosave = autosave;
    }

    /// Whether the backing file currently exists
    pub fn is_persisted(&self) -> bool {
        self.path.exists()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Store `value` under `key` only if the key is not present yet
    pub fn set_if_absent<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        if self.fields.contains_key(key) {
            return Ok(());
        }
        let value = to_stored_value(key, value);
        self.fields.insert(key.to_string(), value);
        self.persist()
    }

    /// Store `value` under `key`, overwriting any existing value.
    ///
    /// A value that cannot be serialized is stored as `null` and a warning is
    /// logged; the write itself still succeeds.
    pub fn replace_or_set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = to_stored_value(key, value);
        self.fields.insert(key.to_string(), value);
        self.persist()
    }

    /// Store an already-encoded JSON value under `key`
    pub fn insert_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.fields.insert(key.to_string(), value);
        self.persist()
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        let removed = self.fields.remove(key);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Write the record to disk atomically
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(&self.fields)?;
        let temp_file = self.path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        fs::write(&temp_file, content)?;
        fs::rename(&temp_file, &self.path)?;

        debug!(record = %self.name, "Saved record to {}", self.path.display());
        Ok(())
    }

    /// Replace the in-memory fields with the content of the backing file
    pub fn load(&mut self) -> Result<()> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::not_found(&self.name));
            }
            Err(e) => return Err(e.into()),
        };

        self.fields = serde_json::from_slice::<BTreeMap<String, Value>>(&bytes)
            .map_err(|e| EngineError::corrupt(&self.path, e))?;
        Ok(())
    }

    /// Clear every field and delete the backing file
    pub fn wipe(&mut self) -> Result<()> {
        self.fields.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(record = %self.name, "Wiped record {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self) -> Result<()> {
        if self.autosave {
            self.save()
        } else {
            Ok(())
        }
    }
}

fn to_stored_value<T: Serialize + ?Sized>(key: &str, value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(key, error = %e, "Value cannot be stored, writing null instead");
        Value::Null
    })
}
