//! Keyed registry of user coordinators.
//!
//! At most one coordinator runs per user. The first request for a user opens
//! the user's store and spawns the coordinator; later requests reuse its
//! handle. A coordinator whose task has stopped is replaced on next use.

use crate::actor::{CoordinatorHandle, UserCoordinator};
use crate::store::{StoreBackend, StoreError};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct CoordinatorRegistry {
    backend: StoreBackend,
    // tokio Mutex: opening a file store awaits while holding the map
    coordinators: Mutex<HashMap<String, CoordinatorHandle>>,
}

impl CoordinatorRegistry {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// Handle to the user's coordinator, spawning it if needed.
    pub async fn coordinator_for(&self, user_id: &str) -> Result<CoordinatorHandle, StoreError> {
        let mut coordinators = self.coordinators.lock().await;

        if let Some(handle) = coordinators.get(user_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            warn!("Coordinator for user {} stopped, restarting", user_id);
        }

        let store = self.backend.open(user_id).await?;
        let handle = UserCoordinator::spawn(user_id, store);
        coordinators.insert(user_id.to_string(), handle.clone());
        info!("{} coordinator(s) running", coordinators.len());
        Ok(handle)
    }

    /// Number of registered coordinators.
    pub async fn len(&self) -> usize {
        self.coordinators.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{NoteUpload, VectorClock};

    fn upload(id: &str) -> NoteUpload {
        NoteUpload {
            id: id.into(),
            content: vec![1],
            state_vector: vec![],
            daily_at: None,
            old_vector_clock: VectorClock::new(),
            new_vector_clock: VectorClock::new().with("d1", 1),
        }
    }

    #[tokio::test]
    async fn test_one_coordinator_per_user() {
        let registry = CoordinatorRegistry::new(StoreBackend::Memory);

        let first = registry.coordinator_for("alice").await.unwrap();
        first.save(vec![upload("n1")], "d1").await.unwrap();

        // Same user: same coordinator, same data
        let again = registry.coordinator_for("alice").await.unwrap();
        let plan = again.get_sync_plan(vec![]).await.unwrap();
        assert_eq!(plan.notes_to_download.len(), 1);

        // Different user: isolated
        let bob = registry.coordinator_for("bob").await.unwrap();
        assert!(bob.get_sync_plan(vec![]).await.unwrap().notes_to_download.is_empty());

        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_file_backend_reloads_user_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = StoreBackend::Files(dir.path().to_path_buf());

        let registry = CoordinatorRegistry::new(backend.clone());
        let handle = registry.coordinator_for("alice").await.unwrap();
        handle.save(vec![upload("n1")], "d1").await.unwrap();
        drop(handle);
        drop(registry);

        let restarted = CoordinatorRegistry::new(backend);
        let handle = restarted.coordinator_for("alice").await.unwrap();
        let plan = handle.get_sync_plan(vec![]).await.unwrap();
        assert_eq!(plan.notes_to_download[0].id, "n1");
    }
}
