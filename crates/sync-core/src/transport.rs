//! Client-side views of the remote sync service.
//!
//! - `SyncService`: request/response batch calls (plan, save, purge)
//! - `LiveTransport`: fire-and-forget live updates over the open socket
//!
//! Both are implemented by the client's socket connection. Tests use stubs.

use crate::note::{NoteMetadata, NoteUpload, SaveReport, SyncPlan};
use crate::protocol::LiveUpdate;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Connection failed: {0}")]
    Connectivity(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Batch synchronization calls against the user's coordinator.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Which notes to download (server copies) and which ids to upload.
    async fn get_sync_plan(&self, local_metadata: Vec<NoteMetadata>) -> Result<SyncPlan>;

    /// Submit notes for optimistic-concurrency validation and storage.
    async fn save(&self, notes: Vec<NoteUpload>, client_id: &str) -> Result<SaveReport>;

    /// Delete every authoritative note of the user.
    async fn purge(&self) -> Result<()>;
}

/// Live path: push the latest state of one note.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Whether a send right now would reach the server.
    fn is_open(&self) -> bool;

    /// Send a live update. Not retried; the next edit or batch sync catches up.
    async fn send_update(&self, update: &LiveUpdate) -> Result<()>;
}
