//! File-backed namespaced key/value persistence.
//!
//! Each collection is one JSON file under `<root>/store/`. Writes replace
//! the whole file through a temp-file rename so individual entries are
//! atomic. Readers tolerate absent or truncated files by treating the
//! collection as empty. Writers serialize per collection; cross-process
//! concurrency is undefined.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// A single loaded collection.
#[derive(Debug)]
struct Collection {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl Collection {
    fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, Value>>(&bytes)
                .unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable collection file, starting empty");
                    BTreeMap::new()
                }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Namespaced, file-backed key/value store.
///
/// Collections are independent files; there are no cross-collection
/// transactions.
pub struct KvStore {
    dir: PathBuf,
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
}

impl KvStore {
    /// Open a store rooted at `root` (collections live in `<root>/store/`).
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("store");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// Open the store in the user-local data directory.
    pub fn user_local() -> Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| Error::persistence("no user data directory available"))?;
        Self::open(base.join("forge"))
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn collection(&self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        if let Some(c) = self
            .collections
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?
            .get(name)
        {
            return Ok(c.clone());
        }

        let mut map = self
            .collections
            .write()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        let entry = map.entry(name.to_string()).or_insert_with(|| {
            Arc::new(RwLock::new(Collection::load(self.collection_path(name))))
        });
        Ok(entry.clone())
    }

    /// Get a value by collection and key.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let coll = self.collection(collection)?;
        let guard = coll
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        Ok(guard.entries.get(key).cloned())
    }

    /// Set a value, persisting the collection.
    pub fn set(&self, collection: &str, key: impl Into<String>, value: Value) -> Result<()> {
        let coll = self.collection(collection)?;
        let mut guard = coll
            .write()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        guard.entries.insert(key.into(), value);
        guard.flush()
    }

    /// Delete a key, returning whether it existed.
    pub fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let coll = self.collection(collection)?;
        let mut guard = coll
            .write()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        let existed = guard.entries.remove(key).is_some();
        if existed {
            guard.flush()?;
        }
        Ok(existed)
    }

    /// All keys in a collection.
    pub fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let coll = self.collection(collection)?;
        let guard = coll
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        Ok(guard.entries.keys().cloned().collect())
    }

    /// All entries in a collection.
    pub fn all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let coll = self.collection(collection)?;
        let guard = coll
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        Ok(guard
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Entries matching a filter predicate.
    pub fn query<F>(&self, collection: &str, filter: F) -> Result<Vec<(String, Value)>>
    where
        F: Fn(&Value) -> bool,
    {
        let coll = self.collection(collection)?;
        let guard = coll
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        Ok(guard
            .entries
            .iter()
            .filter(|(_, v)| filter(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Number of entries in a collection.
    pub fn len(&self, collection: &str) -> Result<usize> {
        let coll = self.collection(collection)?;
        let guard = coll
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        Ok(guard.entries.len())
    }

    /// Names of all collections, on disk and in memory.
    pub fn collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        if let Ok(dir) = fs::read_dir(&self.dir) {
            for entry in dir.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        let loaded = self
            .collections
            .read()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        for name in loaded.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drop a collection, removing its file. Returns whether it existed.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut map = self
            .collections
            .write()
            .map_err(|_| Error::Internal("collection lock poisoned".into()))?;
        let loaded = map.remove(name).is_some();
        let path = self.collection_path(name);
        let on_disk = path.exists();
        if on_disk {
            fs::remove_file(&path)?;
        }
        Ok(loaded || on_disk)
    }

    /// Directory holding the collection files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let (_dir, store) = store();
        store
            .set("runs", "abc", json!({"prompt": "track my sleep"}))
            .unwrap();

        assert_eq!(
            store.get("runs", "abc").unwrap(),
            Some(json!({"prompt": "track my sleep"}))
        );
        assert_eq!(store.get("runs", "missing").unwrap(), None);
    }

    #[test]
    fn test_delete_reports_existence() {
        let (_dir, store) = store();
        store.set("runs", "abc", json!(1)).unwrap();

        assert!(store.delete("runs", "abc").unwrap());
        assert!(!store.delete("runs", "abc").unwrap());
        assert_eq!(store.get("runs", "abc").unwrap(), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path()).unwrap();
            store.set("spells", "s1", json!({"prompt": "a timer"})).unwrap();
        }
        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("spells", "s1").unwrap(),
            Some(json!({"prompt": "a timer"}))
        );
    }

    #[test]
    fn test_truncated_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        fs::create_dir_all(&store_dir).unwrap();
        fs::write(store_dir.join("broken.json"), b"{\"half\": ").unwrap();

        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(store.keys("broken").unwrap(), Vec::<String>::new());

        // The collection is usable again after the next write.
        store.set("broken", "k", json!(1)).unwrap();
        assert_eq!(store.get("broken", "k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_collections_are_independent_files() {
        let (dir, store) = store();
        store.set("history", "h1", json!(1)).unwrap();
        store.set("artifacts", "h1", json!("<html></html>")).unwrap();

        assert!(dir.path().join("store/history.json").exists());
        assert!(dir.path().join("store/artifacts.json").exists());

        let mut names = store.collections().unwrap();
        names.sort();
        assert_eq!(names, vec!["artifacts", "history"]);
    }

    #[test]
    fn test_query_filters_values() {
        let (_dir, store) = store();
        store.set("runs", "a", json!({"grade": "S"})).unwrap();
        store.set("runs", "b", json!({"grade": "D"})).unwrap();

        let hits = store
            .query("runs", |v| v["grade"] == json!("S"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn test_drop_collection_removes_file() {
        let (dir, store) = store();
        store.set("scratch", "k", json!(1)).unwrap();
        assert!(dir.path().join("store/scratch.json").exists());

        assert!(store.drop_collection("scratch").unwrap());
        assert!(!dir.path().join("store/scratch.json").exists());
        assert!(!store.drop_collection("scratch").unwrap());
    }

    #[test]
    fn test_no_stray_temp_files_after_write() {
        let (dir, store) = store();
        store.set("runs", "a", json!(1)).unwrap();
        store.set("runs", "b", json!(2)).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("store"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
