//! Remote sync service: stateless front for batch RPCs.
//!
//! Resolves the calling user's coordinator through the registry and forwards
//! the call. Holds no note state of its own.

use crate::actor::{ActorError, CoordinatorHandle};
use crate::registry::CoordinatorRegistry;
use crate::store::StoreBackend;
use async_trait::async_trait;
use std::sync::Arc;
use sync_core::protocol::{RpcCall, RpcResult};
use sync_core::transport::{self, ServiceError, SyncService};
use sync_core::{NoteMetadata, NoteUpload, SaveReport, SyncPlan};
use tracing::debug;

impl From<ActorError> for ServiceError {
    fn from(e: ActorError) -> Self {
        ServiceError::Remote(e.to_string())
    }
}

pub struct RemoteSyncService {
    registry: CoordinatorRegistry,
}

impl RemoteSyncService {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            registry: CoordinatorRegistry::new(backend),
        }
    }

    /// The user's coordinator, started on first use.
    pub async fn coordinator(&self, user_id: &str) -> transport::Result<CoordinatorHandle> {
        self.registry
            .coordinator_for(user_id)
            .await
            .map_err(|e| ServiceError::Remote(e.to_string()))
    }

    /// Execute one batch call on behalf of `user_id`.
    pub async fn handle_call(&self, user_id: &str, call: RpcCall) -> transport::Result<RpcResult> {
        debug!("RPC {} for user {}", call.name(), user_id);
        let coordinator = self.coordinator(user_id).await?;

        let result = match call {
            RpcCall::GetSyncPlan { local_metadata } => {
                RpcResult::SyncPlan(coordinator.get_sync_plan(local_metadata).await?)
            }
            RpcCall::Save { notes, client_id } => {
                RpcResult::Saved(coordinator.save(notes, &client_id).await?)
            }
            RpcCall::Purge => {
                coordinator.purge().await?;
                RpcResult::Purged
            }
        };
        Ok(result)
    }

    /// A `SyncService` view bound to one user, for in-process callers.
    pub fn session(self: &Arc<Self>, user_id: &str) -> UserSession {
        UserSession {
            service: Arc::clone(self),
            user_id: user_id.to_string(),
        }
    }
}

/// Batch calls for one user without a socket in between.
pub struct UserSession {
    service: Arc<RemoteSyncService>,
    user_id: String,
}

#[async_trait]
impl SyncService for UserSession {
    async fn get_sync_plan(&self, local_metadata: Vec<NoteMetadata>) -> transport::Result<SyncPlan> {
        match self
            .service
            .handle_call(&self.user_id, RpcCall::GetSyncPlan { local_metadata })
            .await?
        {
            RpcResult::SyncPlan(plan) => Ok(plan),
            other => Err(unexpected(other)),
        }
    }

    async fn save(&self, notes: Vec<NoteUpload>, client_id: &str) -> transport::Result<SaveReport> {
        let call = RpcCall::Save {
            notes,
            client_id: client_id.to_string(),
        };
        match self.service.handle_call(&self.user_id, call).await? {
            RpcResult::Saved(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    async fn purge(&self) -> transport::Result<()> {
        match self.service.handle_call(&self.user_id, RpcCall::Purge).await? {
            RpcResult::Purged => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(result: RpcResult) -> ServiceError {
    ServiceError::Remote(format!("unexpected result: {:?}", result))
}
