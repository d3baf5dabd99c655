//! User coordinator: the single writer of one user's authoritative notes.
//!
//! Every request for the user (batch RPCs, live messages, connection
//! attach/detach) goes through one unbounded queue and is handled to
//! completion before the next. Different users run in separate tasks.
//!
//! Write validation is the same for batch `save` and live updates: a write
//! is accepted if there is no authoritative record yet, if the authoritative
//! clock equals the writer's base clock, or if the writer's clock differs
//! from the authoritative one only by a larger counter for the writer's own
//! device. Anything else means another device wrote in between; the caller
//! gets the authoritative record back and must merge first.

use crate::store::{NoteStore, StoreError};
use std::collections::BTreeMap;
use sync_core::protocol::{self, ControlFrame, LiveUpdate};
use sync_core::{NoteMetadata, NoteState, NoteUpload, SaveReport, SyncPlan, VectorClock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Coordinator for user {0} is gone")]
    Gone(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ActorError>;

/// Server-assigned id of one socket connection.
pub type ConnectionId = u64;

/// Text frames queued for a connection's writer.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Whether a write based on `base`, producing `candidate`, may replace the
/// record currently stored with clock `authoritative`.
pub fn write_allowed(
    authoritative: Option<&VectorClock>,
    base: &VectorClock,
    candidate: &VectorClock,
    client_id: &str,
) -> bool {
    match authoritative {
        None => true,
        Some(current) => current == base || current.only_advanced_by(candidate, client_id),
    }
}

enum Command {
    SyncPlan {
        local_metadata: Vec<NoteMetadata>,
        reply: oneshot::Sender<Result<SyncPlan>>,
    },
    Save {
        notes: Vec<NoteUpload>,
        client_id: String,
        reply: oneshot::Sender<Result<SaveReport>>,
    },
    Purge {
        reply: oneshot::Sender<Result<()>>,
    },
    Attach {
        conn_id: ConnectionId,
        outbound: Outbound,
    },
    Detach {
        conn_id: ConnectionId,
    },
    Live {
        conn_id: ConnectionId,
        update: LiveUpdate,
    },
    /// Reply once every earlier command is handled.
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running user coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    user_id: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// True once the coordinator task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ActorError::Gone(self.user_id.clone()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| ActorError::Gone(self.user_id.clone()))?
    }

    pub async fn get_sync_plan(&self, local_metadata: Vec<NoteMetadata>) -> Result<SyncPlan> {
        self.request(|reply| Command::SyncPlan {
            local_metadata,
            reply,
        })
        .await
    }

    pub async fn save(&self, notes: Vec<NoteUpload>, client_id: &str) -> Result<SaveReport> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::Save {
            notes,
            client_id,
            reply,
        })
        .await
    }

    pub async fn purge(&self) -> Result<()> {
        self.request(|reply| Command::Purge { reply }).await
    }

    /// Register a connection for live fan-out.
    ///
    /// The coordinator greets it with the server handshake, so nothing it
    /// broadcasts can reach the connection before that.
    pub fn attach(&self, conn_id: ConnectionId, outbound: Outbound) -> Result<()> {
        self.send(Command::Attach { conn_id, outbound })
    }

    pub fn detach(&self, conn_id: ConnectionId) -> Result<()> {
        self.send(Command::Detach { conn_id })
    }

    /// Queue a validated live update received on `conn_id`.
    pub fn live_update(&self, conn_id: ConnectionId, update: LiveUpdate) -> Result<()> {
        self.send(Command::Live { conn_id, update })
    }

    /// Wait until everything queued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush { reply })?;
        rx.await.map_err(|_| ActorError::Gone(self.user_id.clone()))
    }
}

/// The coordinator task state for one user.
pub struct UserCoordinator {
    user_id: String,
    store: Box<dyn NoteStore>,
    connections: BTreeMap<ConnectionId, Outbound>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl UserCoordinator {
    /// Spawn a coordinator for `user_id` over `store`.
    pub fn spawn(user_id: &str, store: Box<dyn NoteStore>) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            user_id: user_id.to_string(),
            store,
            connections: BTreeMap::new(),
            rx,
        };
        tokio::spawn(coordinator.run());
        info!("Started coordinator for user {}", user_id);

        CoordinatorHandle {
            user_id: user_id.to_string(),
            tx,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
        debug!("Coordinator for user {} stopped", self.user_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SyncPlan {
                local_metadata,
                reply,
            } => {
                let _ = reply.send(self.sync_plan(local_metadata).await);
            }
            Command::Save {
                notes,
                client_id,
                reply,
            } => {
                let _ = reply.send(self.save(notes, &client_id).await);
            }
            Command::Purge { reply } => {
                let result = self.store.clear().await.map_err(ActorError::from);
                if result.is_ok() {
                    info!("Purged all notes of user {}", self.user_id);
                }
                let _ = reply.send(result);
            }
            Command::Attach { conn_id, outbound } => {
                // The handshake reply is the first frame a connection sees
                let _ = outbound.send(ControlFrame::server_handshake().to_json());
                self.connections.insert(conn_id, outbound);
                debug!(
                    "Attached conn-{} to user {} ({} open)",
                    conn_id,
                    self.user_id,
                    self.connections.len()
                );
            }
            Command::Detach { conn_id } => {
                self.connections.remove(&conn_id);
                debug!(
                    "Detached conn-{} from user {} ({} open)",
                    conn_id,
                    self.user_id,
                    self.connections.len()
                );
            }
            Command::Live { conn_id, update } => {
                if let Err(e) = self.on_live_update(conn_id, update).await {
                    warn!("Live update for user {} failed: {}", self.user_id, e);
                }
            }
            Command::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Authoritative notes the caller is behind on, and caller notes we are behind on.
    async fn sync_plan(&self, local_metadata: Vec<NoteMetadata>) -> Result<SyncPlan> {
        let server_notes = self.store.list().await?;
        let local: BTreeMap<&str, &VectorClock> = local_metadata
            .iter()
            .map(|m| (m.id.as_str(), &m.vector_clock))
            .collect();

        let mut plan = SyncPlan::default();
        let mut server_clocks = BTreeMap::new();
        for note in &server_notes {
            server_clocks.insert(note.id.as_str(), &note.vector_clock);
        }

        for note in &server_notes {
            let behind = match local.get(note.id.as_str()) {
                None => true,
                Some(clock) => clock.is_behind(&note.vector_clock),
            };
            if behind {
                plan.notes_to_download.push(note.clone());
            }
        }

        for meta in &local_metadata {
            let behind = match server_clocks.get(meta.id.as_str()) {
                None => true,
                Some(clock) => clock.is_behind(&meta.vector_clock),
            };
            if behind {
                plan.notes_to_upload.push(meta.id.clone());
            }
        }

        debug!(
            "Sync plan for user {}: {} down, {} up",
            self.user_id,
            plan.notes_to_download.len(),
            plan.notes_to_upload.len()
        );
        Ok(plan)
    }

    async fn save(&mut self, notes: Vec<NoteUpload>, client_id: &str) -> Result<SaveReport> {
        let mut report = SaveReport::default();

        for note in notes {
            let current = self.store.get(&note.id).await?;
            let allowed = write_allowed(
                current.as_ref().map(|c| &c.vector_clock),
                &note.old_vector_clock,
                &note.new_vector_clock,
                client_id,
            );

            match current {
                Some(current) if !allowed => {
                    warn!(
                        "Rejected save of {} from {}: server {} vs base {}",
                        note.id, client_id, current.vector_clock, note.old_vector_clock
                    );
                    report.rejected.push(current);
                }
                _ => {
                    let id = note.id.clone();
                    self.store.put(note.into_state()).await?;
                    debug!("Saved {} from {}", id, client_id);
                    report.accepted.push(id);
                }
            }
        }

        Ok(report)
    }

    async fn on_live_update(&mut self, conn_id: ConnectionId, update: LiveUpdate) -> Result<()> {
        let LiveUpdate { client_id, note } = update;
        let current = self.store.get(&note.id).await?;

        // A live update carries one clock: its base and its result coincide
        let allowed = write_allowed(
            current.as_ref().map(|c| &c.vector_clock),
            &note.vector_clock,
            &note.vector_clock,
            &client_id,
        );

        if let Some(current) = current.filter(|_| !allowed) {
            warn!(
                "Rejected live update of {} from {}: server {} vs {}",
                note.id, client_id, current.vector_clock, note.vector_clock
            );
            self.send_to(conn_id, &protocol::encode_downstream(&current));
            return Ok(());
        }

        self.store.put(note.clone()).await?;
        let frame = protocol::encode_downstream(&note);
        let mut sent = 0;
        for (&other, outbound) in &self.connections {
            if other != conn_id && outbound.send(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        debug!(
            "Accepted live update of {} from {} (clock {}), broadcast to {} connection(s)",
            note.id, client_id, note.vector_clock, sent
        );
        Ok(())
    }

    fn send_to(&self, conn_id: ConnectionId, frame: &str) {
        match self.connections.get(&conn_id) {
            Some(outbound) => {
                if outbound.send(frame.to_string()).is_err() {
                    debug!("conn-{} closed before reply", conn_id);
                }
            }
            None => debug!("conn-{} not attached, dropping reply", conn_id),
        }
    }
}
