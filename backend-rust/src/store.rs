//! store.rs — Key/value persistence for runs, configs and preferences
//!
//! Keys are slash-separated (`runs/<id>`, `config/active`,
//! `config/calibration`, `prefs`); values are JSON documents. The file store
//! maps each key to `<dir>/<key>.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

pub const KEY_ACTIVE_CONFIG: &str = "config/active";
pub const KEY_CALIBRATION: &str = "config/calibration";
pub const KEY_PREFS: &str = "prefs";
pub const RUNS_PREFIX: &str = "runs/";

pub fn run_key(id: &str) -> String {
    format!("{RUNS_PREFIX}{id}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// A store shared between owners, e.g. a test holding the same instance as the controller.
#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).keys(prefix).await
    }
}

/// Typed load. A document that no longer deserializes is logged and treated as absent.
pub async fn load<T, S>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            warn!("Stored '{key}' is unreadable ({e}), ignoring it");
            Ok(None)
        }
    }
}

pub async fn save<T, S>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize + Sync,
    S: KeyValueStore + ?Sized,
{
    store.put(key, serde_json::to_value(value)?).await
}

fn check_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        || key.contains('\\');
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ── JSON files ────────────────────────────────────────────────────────────────

pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        check_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Failed to parse {}: {e}, treating as missing", path.display());
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves half a document behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&value)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let Some(rel) = rel.to_str() else { continue };
                let Some(key) = rel.strip_suffix(".json") else {
                    continue;
                };
                let key = key.replace(std::path::MAIN_SEPARATOR, "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ── In memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        check_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        check_key(key)?;
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        Ok(self.entries().remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codless_types::RobotConfig;
    use serde_json::json;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("codless-store-{tag}-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn keys_are_checked() {
        assert!(check_key("runs/abc").is_ok());
        assert!(check_key("prefs").is_ok());
        for bad in ["", "/abs", "runs/", "runs//x", "../escape", "runs/../x", "a\\b"] {
            assert!(check_key(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_prefix_listing() {
        let store = MemoryStore::new();
        store.put("runs/b", json!({"n": 2})).await.unwrap();
        store.put("runs/a", json!({"n": 1})).await.unwrap();
        store.put("prefs", json!({})).await.unwrap();

        assert_eq!(store.keys(RUNS_PREFIX).await.unwrap(), vec!["runs/a", "runs/b"]);
        assert_eq!(store.get("runs/a").await.unwrap(), Some(json!({"n": 1})));
        assert!(store.delete("runs/a").await.unwrap());
        assert!(!store.delete("runs/a").await.unwrap());
        assert_eq!(store.get("runs/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_persists_nested_keys() {
        let root = temp_root("nested");
        let store = JsonFileStore::new(&root);

        let mut cfg = RobotConfig::default();
        cfg.axle_track = 120.0;
        save(&store, KEY_ACTIVE_CONFIG, &cfg).await.unwrap();
        save(&store, &run_key("r1"), &json!({"name": "r1"})).await.unwrap();

        let loaded: RobotConfig = load(&store, KEY_ACTIVE_CONFIG).await.unwrap().unwrap();
        assert_eq!(loaded.axle_track, 120.0);
        assert_eq!(store.keys("runs/").await.unwrap(), vec!["runs/r1"]);
        assert_eq!(store.keys("").await.unwrap().len(), 2);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn corrupt_documents_read_as_missing() {
        let root = temp_root("corrupt");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("prefs.json"), "{ not json").unwrap();

        let store = JsonFileStore::new(&root);
        assert_eq!(store.get(KEY_PREFS).await.unwrap(), None);
        assert_eq!(store.get("missing").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn mistyped_documents_load_as_none() {
        let store = MemoryStore::new();
        store.put(KEY_ACTIVE_CONFIG, json!("not a config")).await.unwrap();
        let loaded: Option<RobotConfig> = load(&store, KEY_ACTIVE_CONFIG).await.unwrap();
        assert!(loaded.is_none());
    }
}
