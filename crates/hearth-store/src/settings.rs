use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Settings key overriding the manifest's update policy.
pub const UPDATE_POLICY_KEY: &str = "update/policy";

const SETTINGS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    format_version: u32,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

/// File-backed hierarchical key/value store.
///
/// Keys are `/`-separated paths such as `proxy/host`. Mutations stay in
/// memory until [`flush`](Self::flush) writes the whole file atomically.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
    dirty: bool,
}

impl SettingsStore {
    /// Load settings from `path`. A missing file yields an empty store; an
    /// unreadable one is logged and replaced on the next flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<SettingsFile>(&content) {
                Ok(file) if file.format_version == SETTINGS_FORMAT_VERSION => file.values,
                Ok(file) => {
                    return Err(StoreError::VersionMismatch {
                        expected: SETTINGS_FORMAT_VERSION,
                        found: file.format_version,
                    })
                }
                Err(e) => {
                    warn!("ignoring corrupt settings file {}: {e}", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        validate_key(key)?;
        self.values.insert(key.to_owned(), value.into());
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let old = self.values.remove(key);
        if old.is_some() {
            self.dirty = true;
        }
        old
    }

    /// Remove `prefix` and every key below it. Returns the number of keys removed.
    pub fn remove_node(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self.node(prefix).keys().map(str::to_owned).collect();
        for key in &keys {
            self.values.remove(key);
        }
        if !keys.is_empty() {
            self.dirty = true;
        }
        keys.len()
    }

    /// Drop every stored value.
    pub fn reset(&mut self) {
        if !self.values.is_empty() {
            self.values.clear();
            self.dirty = true;
        }
        debug!("settings reset");
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// A read-only view of the subtree rooted at `prefix`.
    pub fn node<'a>(&'a self, prefix: &str) -> SettingsNode<'a> {
        SettingsNode {
            store: self,
            prefix: prefix.trim_matches('/').to_owned(),
        }
    }

    /// Persist pending changes. A no-op when nothing changed.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let file = SettingsFile {
            format_version: SETTINGS_FORMAT_VERSION,
            values: self.values.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        let dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        self.dirty = false;
        debug!("settings flushed to {}", self.path.display());
        Ok(())
    }
}

/// Subtree of a [`SettingsStore`].
pub struct SettingsNode<'a> {
    store: &'a SettingsStore,
    prefix: String,
}

impl<'a> SettingsNode<'a> {
    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.store.get(&self.full_key(key))
    }

    /// Full keys at or below this node.
    pub fn keys(&self) -> impl Iterator<Item = &'a str> + '_ {
        let prefix = self.prefix.clone();
        self.store.keys().filter(move |k| {
            prefix.is_empty()
                || *k == prefix
                || (k.starts_with(prefix.as_str()) && k[prefix.len()..].starts_with('/'))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.keys().next().is_none()
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.split('/').any(str::is_empty) {
        return Err(StoreError::InvalidKey(key.to_owned()));
    }
    if key.chars().any(char::is_control) {
        return Err(StoreError::InvalidKey(key.to_owned()));
    }
    Ok(())
}
