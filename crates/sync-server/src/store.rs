//! Authoritative per-user note storage.
//!
//! Each user coordinator owns exactly one store, so stores take `&mut self`
//! and need no internal locking.
//!
//! Implementations:
//! - `MemoryStore` - Volatile, for tests and ephemeral servers
//! - `FileStore` - One JSON file per user, rewritten atomically on each mutation

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sync_core::NoteState;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage for one user's authoritative notes.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<NoteState>>;

    /// Every stored note.
    async fn list(&self) -> Result<Vec<NoteState>>;

    /// Insert or replace a note.
    async fn put(&mut self, note: NoteState) -> Result<()>;

    /// Remove every note.
    async fn clear(&mut self) -> Result<()>;
}

/// Volatile in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    notes: BTreeMap<String, NoteState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NoteStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<NoteState>> {
        Ok(self.notes.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<NoteState>> {
        Ok(self.notes.values().cloned().collect())
    }

    async fn put(&mut self, note: NoteState) -> Result<()> {
        self.notes.insert(note.id.clone(), note);
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.notes.clear();
        Ok(())
    }
}

/// JSON file store: the whole collection lives in memory and is written out
/// to `<dir>/<user>.json` after every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    notes: BTreeMap<String, NoteState>,
}

impl FileStore {
    /// Open (or start) the store at `path`.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let notes = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<NoteState> =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                list.into_iter().map(|n| (n.id.clone(), n)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened store {:?} ({} notes)", path, notes.len());
        Ok(Self { path, notes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the collection to a temp file next to the target, then rename.
    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let list: Vec<&NoteState> = self.notes.values().collect();
        let contents =
            serde_json::to_vec(&list).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl NoteStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<NoteState>> {
        Ok(self.notes.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<NoteState>> {
        Ok(self.notes.values().cloned().collect())
    }

    async fn put(&mut self, note: NoteState) -> Result<()> {
        let previous = self.notes.insert(note.id.clone(), note.clone());
        if let Err(e) = self.persist().await {
            // Keep memory and disk in agreement
            match previous {
                Some(previous) => self.notes.insert(note.id.clone(), previous),
                None => self.notes.remove(&note.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        let previous = std::mem::take(&mut self.notes);
        if let Err(e) = self.persist().await {
            self.notes = previous;
            return Err(e);
        }
        Ok(())
    }
}

/// Where coordinators keep their stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Files(PathBuf),
}

impl StoreBackend {
    /// Open the store for one user.
    pub async fn open(&self, user_id: &str) -> Result<Box<dyn NoteStore>> {
        match self {
            StoreBackend::Memory => Ok(Box::new(MemoryStore::new())),
            StoreBackend::Files(dir) => {
                let path = dir.join(format!("{}.json", file_stem(user_id)));
                Ok(Box::new(FileStore::open(path).await?))
            }
        }
    }
}

/// File-name-safe, collision-free encoding of a user id.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `%XX`.
fn file_stem(user_id: &str) -> String {
    let mut stem = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::VectorClock;
    use tempfile::TempDir;

    fn note(id: &str, count: u64) -> NoteState {
        NoteState {
            id: id.into(),
            vector_clock: VectorClock::new().with("d1", count),
            daily_at: None,
            content: vec![count as u8],
            state_vector: vec![],
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let mut store = MemoryStore::new();
        store.put(note("a", 1)).await.unwrap();
        store.put(note("a", 2)).await.unwrap();
        store.put(note("b", 1)).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().content, vec![2]);
        assert_eq!(store.list().await.unwrap().len(), 2);

        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users").join("u1.json");

        let mut store = FileStore::open(path.clone()).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        store.put(note("a", 1)).await.unwrap();
        store.put(note("b", 3)).await.unwrap();
        drop(store);

        let mut reopened = FileStore::open(path.clone()).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 2);
        assert_eq!(
            reopened.get("b").await.unwrap().unwrap().vector_clock.get("d1"),
            3
        );

        reopened.clear().await.unwrap();
        let again = FileStore::open(path).await.unwrap();
        assert!(again.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("u1.json");
        let mut store = FileStore::open(path).await.unwrap();
        store.put(note("a", 1)).await.unwrap();
        store.put(note("a", 2)).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["u1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("u1.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            FileStore::open(path).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_isolates_users() {
        let dir = TempDir::new().unwrap();
        let backend = StoreBackend::Files(dir.path().to_path_buf());

        let mut alice = backend.open("alice@example.com").await.unwrap();
        alice.put(note("a", 1)).await.unwrap();

        let bob = backend.open("bob").await.unwrap();
        assert!(bob.list().await.unwrap().is_empty());
        assert!(dir.path().join("alice%40example.com.json").exists());
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("user_1-x"), "user_1-x");
        assert_eq!(file_stem("../etc"), "%2E%2E%2Fetc");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
    }
}
