//! File-backed durable store for the remembered peripheral.
//!
//! Values live in a flat TOML table under the platform data directory, so
//! the remembered peripheral survives restarts of the client.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use blelink_core::{DurableStore, Error};
use tracing::debug;

/// A [`DurableStore`] persisted as `key = "value"` lines in a TOML file.
#[derive(Debug)]
pub struct TomlStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl TomlStore {
    /// Default location of the state file.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blelink")
            .join("state.toml")
    }

    /// Open the store at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, Error> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Store(format!("{}: {}", self.path.display(), e)))
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string(values).map_err(|e| Error::Store(e.to_string()))?;

        let staging = self.path.with_extension("toml.tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), entries = values.len(), "State written");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableStore for TomlStore {
    fn get(&self, key: &str) -> blelink_core::Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> blelink_core::Result<()> {
        let _guard = self.lock();
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn remove(&self, key: &str) -> blelink_core::Result<()> {
        let _guard = self.lock();
        let mut values = self.read_all()?;
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.write_all(&values)
    }
}
