//! Durable key/value overrides for notebook exclusion and colors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use agenda_core::SettingsError;
use parking_lot::Mutex;
use serde_json::Value;

/// Settings key holding the exclusion flag of a notebook.
pub fn exclude_key(notebook_uid: &str) -> String {
    format!("exclude/{notebook_uid}")
}

/// Settings key holding the user color override of a notebook.
pub fn color_key(notebook_uid: &str) -> String {
    format!("colors/{notebook_uid}")
}

/// Key/value store for user overrides.
pub trait SettingsStore: Send + Sync {
    fn value(&self, key: &str) -> Option<Value>;

    fn set_value(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    fn remove(&self, key: &str) -> Result<(), SettingsError>;

    fn bool_value(&self, key: &str, default: bool) -> bool {
        self.value(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn string_value(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Settings kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn value(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Settings persisted as a flat JSON object, rewritten on every change.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonSettings {
    /// Open the settings file. A missing file starts empty; a damaged one is
    /// logged and replaced on the next write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| SettingsError::Read(e.to_string()))?;
            match serde_json::from_str(&contents) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "{}", SettingsError::Malformed(e.to_string()));
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Write(e.to_string()))?;
        }
        let contents =
            serde_json::to_string_pretty(values).map_err(|e| SettingsError::Write(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(|e| SettingsError::Write(e.to_string()))
    }
}

impl SettingsStore for JsonSettings {
    fn value(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
