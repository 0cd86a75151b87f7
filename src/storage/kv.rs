use std::collections::BTreeMap;
use std::path::PathBuf;

use super::write_atomic;
use crate::error::{DevframeError, Result};

/// String key/value area backing `localStorage` or `sessionStorage`.
///
/// A durable store mirrors its map to a flat JSON object on every
/// [`persist`](Self::persist); an ephemeral one lives only in memory.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse {}, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read {}, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            entries,
        }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }

    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(path, &content).map_err(|e| {
            DevframeError::PersistenceFailure(format!("{}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_clear() {
        let mut store = KeyValueStore::ephemeral();
        store.set("a", "1");
        store.set("b", "2");
        store.set("a", "3");

        assert_eq!(store.get("a"), Some("3"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.remove("b"), Some("2".to_string()));
        assert_eq!(store.remove("b"), None);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn ephemeral_persist_is_noop() {
        let store = KeyValueStore::ephemeral();
        assert!(store.persist().is_ok());
    }

    #[test]
    fn durable_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_storage.json");

        let mut store = KeyValueStore::durable(&path);
        store.set("theme", "dark");
        store.set("token", "x=y; z");
        store.persist().unwrap();

        let reloaded = KeyValueStore::durable(&path);
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[test]
    fn snapshot_file_is_flat_json_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_storage.json");

        let mut store = KeyValueStore::durable(&path);
        store.set("k", "v");
        store.persist().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "k": "v" }));
    }
}
