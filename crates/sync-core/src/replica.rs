//! LocalReplica trait: the client-side note store.
//!
//! Implementations:
//! - `InMemoryReplica` - For testing and ephemeral clients
//! - Application stores (IndexedDB, SQLite, ...) live outside this crate

use crate::note::{NoteMetadata, NoteRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Client-local persistent note store, keyed by note id.
#[async_trait]
pub trait LocalReplica: Send + Sync {
    /// Fetch a note, failing with `NotFound` if absent.
    async fn get(&self, id: &str) -> Result<NoteRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| ReplicaError::NotFound(id.to_string()))
    }

    /// Fetch a note if present.
    async fn find(&self, id: &str) -> Result<Option<NoteRecord>>;

    /// Insert or replace a note.
    async fn upsert(&self, record: NoteRecord) -> Result<()>;

    /// Id and clock of every stored note.
    async fn list_metadata(&self) -> Result<Vec<NoteMetadata>>;

    /// Remove every note.
    async fn clear(&self) -> Result<()>;
}

/// In-memory replica
#[derive(Default)]
pub struct InMemoryReplica {
    notes: RwLock<BTreeMap<String, NoteRecord>>,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LocalReplica for InMemoryReplica {
    async fn find(&self, id: &str) -> Result<Option<NoteRecord>> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        Ok(notes.get(id).cloned())
    }

    async fn upsert(&self, record: NoteRecord) -> Result<()> {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        notes.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<NoteMetadata>> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        Ok(notes.values().map(NoteRecord::metadata).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.notes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_clock::VectorClock;

    fn record(id: &str, count: u64) -> NoteRecord {
        NoteRecord {
            id: id.into(),
            title: "t".into(),
            content: vec![1],
            state_vector: vec![],
            vector_clock: VectorClock::new().with("d1", count),
            daily_at: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let replica = InMemoryReplica::new();
        assert!(replica.find("n1").await.unwrap().is_none());
        assert!(matches!(
            replica.get("n1").await,
            Err(ReplicaError::NotFound(id)) if id == "n1"
        ));

        replica.upsert(record("n1", 1)).await.unwrap();
        replica.upsert(record("n1", 2)).await.unwrap();

        assert_eq!(replica.len(), 1);
        assert_eq!(replica.get("n1").await.unwrap().vector_clock.get("d1"), 2);
    }

    #[tokio::test]
    async fn test_list_metadata_and_clear() {
        let replica = InMemoryReplica::new();
        replica.upsert(record("b", 1)).await.unwrap();
        replica.upsert(record("a", 3)).await.unwrap();

        let metadata = replica.list_metadata().await.unwrap();
        let ids: Vec<_> = metadata.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(metadata[0].vector_clock.get("d1"), 3);

        replica.clear().await.unwrap();
        assert!(replica.is_empty());
    }
}
