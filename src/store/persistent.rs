// =============================================================================
// Persistent Store — minimal ordered key/value capability
// =============================================================================
//
// The chunk cache only needs single-key atomic get/put/delete plus an ordered
// prefix scan. No multi-key transactions are assumed, which is why derived
// data (metadata) is always rebuilt from a scan instead of being maintained
// incrementally.
//
// Two implementations ship with the crate:
//   - `MemoryStore`: a BTreeMap, for tests and throwaway sessions.
//   - `FileStore`: one file per key in a flat directory, written with the
//     tmp + rename pattern so a crash never leaves half a record behind.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{FeedError, Result};

/// Ordered key/value store with single-key atomicity.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ascending by key.
    async fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.entries.read();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Separator substituted for `/` in file names.
const PATH_SEP_SUBSTITUTE: char = '~';
const TMP_SUFFIX: &str = ".tmp";

/// Flat-directory store: the key `chunk/BTCUSDT/1m/000001704067200` lives in
/// the file `chunk~BTCUSDT~1m~000001704067200`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key.chars().all(|c| {
                c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-')
            })
            && !key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
        if !valid {
            return Err(FeedError::Store(format!("invalid key '{key}'")));
        }
        Ok(self
            .root
            .join(key.replace('/', &PATH_SEP_SUBSTITUTE.to_string())))
    }

    fn key_for(file_name: &str) -> Option<String> {
        if file_name.ends_with(TMP_SUFFIX) {
            return None;
        }
        Some(file_name.replace(PATH_SEP_SUBSTITUTE, "/"))
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = Self::key_for(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // A concurrent delete between listing and reading is fine.
            if let Some(value) = self.get(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn PersistentStore) {
        store.put("chunk/BTC/1m/2", b"two".to_vec()).await.unwrap();
        store.put("chunk/BTC/1m/1", b"one".to_vec()).await.unwrap();
        store.put("chunk/ETH/1m/1", b"eth".to_vec()).await.unwrap();
        store.put("meta/BTC", b"meta".to_vec()).await.unwrap();

        assert_eq!(store.get("chunk/BTC/1m/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("chunk/BTC/1m/9").await.unwrap(), None);

        let scanned = store.scan_by_prefix("chunk/BTC/").await.unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["chunk/BTC/1m/1", "chunk/BTC/1m/2"]);

        store.put("chunk/BTC/1m/1", b"uno".to_vec()).await.unwrap();
        assert_eq!(store.get("chunk/BTC/1m/1").await.unwrap(), Some(b"uno".to_vec()));

        store.delete("chunk/BTC/1m/1").await.unwrap();
        store.delete("chunk/BTC/1m/1").await.unwrap();
        assert_eq!(store.scan_by_prefix("chunk/BTC/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryStore::new();
        exercise(&store).await;
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("cache")).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn file_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.put("../escape", vec![1]).await.is_err());
        assert!(store.put("a//b", vec![1]).await.is_err());
        assert!(store.get("a~b").await.is_err());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put("meta/SOL", b"x".to_vec()).await.unwrap();
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("meta/SOL").await.unwrap(), Some(b"x".to_vec()));
    }
}
