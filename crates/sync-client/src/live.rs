//! LiveSyncChannel: keeps one open document in step with the server.
//!
//! Local edits schedule a debounced push of the whole document state. The
//! push persists the note to the local replica first, then sends it if the
//! connection is open, so an offline edit is never lost: the next batch sync
//! uploads it.
//!
//! Remote updates are merged into the document under the `is_syncing` guard
//! so the resulting change hook does not echo them upstream. If the merge
//! shows local changes the server lacks, a push is scheduled.
//!
//! Pushes and remote applies for one document run one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::document::{ChangeOrigin, DocumentChange, DocumentError, NoteDocument};
use sync_core::events::{EventBus, Subscription, SyncEvent};
use sync_core::replica::{LocalReplica, ReplicaError};
use sync_core::transport::{LiveTransport, ServiceError};
use sync_core::{DeviceId, LiveUpdate, NoteRecord, NoteState, VectorClock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Transport error: {0}")]
    Transport(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Collaborators shared by every channel of one client.
#[derive(Clone)]
pub struct ChannelContext {
    pub replica: Arc<dyn LocalReplica>,
    pub transport: Arc<dyn LiveTransport>,
    pub device: DeviceId,
    pub debounce: Duration,
    pub events: Option<Arc<EventBus<SyncEvent>>>,
}

impl ChannelContext {
    pub(crate) fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Sets a flag for its lifetime.
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ChannelInner {
    note_id: String,
    doc: Arc<NoteDocument>,
    context: ChannelContext,
    runtime: Handle,
    /// Set while a remote update is being applied.
    is_syncing: AtomicBool,
    destroyed: AtomicBool,
    /// Clock the server is believed to hold for this note.
    server_known: Mutex<VectorClock>,
    /// Debounce timer; holds only tasks that have not started pushing.
    pending_push: Mutex<Option<JoinHandle<()>>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ChannelInner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Restart the debounce timer.
    fn schedule_push(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        let inner = Arc::clone(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(inner.context.debounce).await;
            // From here on, new edits start a fresh timer instead of cancelling this push
            lock(&inner.pending_push).take();
            if let Err(e) = inner.push().await {
                warn!("Live push of {} failed: {}", inner.note_id, e);
            }
        });

        if let Some(previous) = lock(&self.pending_push).replace(task) {
            previous.abort();
        }
    }

    async fn push(&self) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        if self.is_destroyed() {
            return Ok(false);
        }

        let replica = &self.context.replica;
        let device = self.context.device.as_str();
        let server_known = lock(&self.server_known).clone();

        let stored = replica.find(&self.note_id).await?;
        let has_new_ops = match &stored {
            Some(record) => {
                // Pick up anything a batch sync wrote since the last reload
                let _guard = SyncingGuard::engage(&self.is_syncing);
                self.doc.apply_update(&record.content, ChangeOrigin::Remote)?;
                !self.doc.same_state_as(&NoteDocument::decode(&record.content)?)
            }
            None => true,
        };
        let (local_clock, daily_at) = stored
            .map(|record| (record.vector_clock, record.daily_at))
            .unwrap_or_default();

        // Every version with new operations gets a fresh counter for this
        // device, even if an earlier version never reached the server.
        let mut candidate = local_clock.merged(&server_known);
        if has_new_ops {
            candidate.increment(device);
        }

        let record =
            NoteRecord::from_document(&self.note_id, &self.doc, candidate.clone(), daily_at)?;
        let note = record.to_state();
        replica.upsert(record).await?;

        if !self.context.transport.is_open() {
            debug!(
                "Offline: kept {} locally at {}",
                self.note_id, candidate
            );
            return Ok(false);
        }

        let update = LiveUpdate {
            client_id: device.to_string(),
            note,
        };
        self.context.transport.send_update(&update).await?;
        debug!("Pushed {} at {}", self.note_id, candidate);
        *lock(&self.server_known) = candidate;

        self.context.emit(SyncEvent::UpdatePushed {
            note_id: self.note_id.clone(),
        });
        Ok(true)
    }

    async fn apply_remote(self: &Arc<Self>, remote: &NoteState) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.is_destroyed() {
            return Ok(());
        }

        let local_ahead = {
            let _guard = SyncingGuard::engage(&self.is_syncing);
            self.doc.apply_update(&remote.content, ChangeOrigin::Remote)?;

            let remote_doc = NoteDocument::decode(&remote.content)?;
            let equal_to_remote = self.doc.same_state_as(&remote_doc);

            let replica = &self.context.replica;
            let (local_clock, local_daily_at) = replica
                .find(&self.note_id)
                .await?
                .map(|record| (record.vector_clock, record.daily_at))
                .unwrap_or_default();
            let vector_clock = if equal_to_remote {
                local_clock.merged(&remote.vector_clock)
            } else {
                local_clock.advanced_past(&remote.vector_clock, self.context.device.as_str())
            };

            let record = NoteRecord::from_document(
                &self.note_id,
                &self.doc,
                vector_clock,
                remote.daily_at.clone().or(local_daily_at),
            )?;
            replica.upsert(record).await?;
            *lock(&self.server_known) = remote.vector_clock.clone();
            !equal_to_remote
        };

        debug!(
            "Applied remote {} at {} (local ahead: {})",
            self.note_id, remote.vector_clock, local_ahead
        );
        self.context.emit(SyncEvent::RemoteApplied {
            note_id: self.note_id.clone(),
        });

        if local_ahead {
            self.schedule_push();
        }
        Ok(())
    }

    async fn reload(self: &Arc<Self>) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        if self.is_destroyed() {
            return Ok(false);
        }
        let Some(record) = self.context.replica.find(&self.note_id).await? else {
            return Ok(false);
        };

        let (changed, local_ahead) = {
            let _guard = SyncingGuard::engage(&self.is_syncing);
            let changed = self.doc.apply_update(&record.content, ChangeOrigin::Remote)?;
            let stored = NoteDocument::decode(&record.content)?;
            (changed, !self.doc.same_state_as(&stored))
        };
        // A batch sync just reconciled this record with the server. If the
        // server did not take it, the next push is rejected and corrected.
        *lock(&self.server_known) = record.vector_clock;

        if changed {
            self.context.emit(SyncEvent::RemoteApplied {
                note_id: self.note_id.clone(),
            });
        }
        if local_ahead {
            self.schedule_push();
        }
        Ok(changed)
    }
}

/// Live sync for one open document.
pub struct LiveSyncChannel {
    inner: Arc<ChannelInner>,
    hook: Mutex<Option<Subscription<DocumentChange>>>,
}

impl LiveSyncChannel {
    /// Attach to `doc`, the editor's live copy of `note_id`.
    ///
    /// The server-known clock starts at the locally stored clock.
    pub async fn open(note_id: &str, doc: Arc<NoteDocument>, context: ChannelContext) -> Result<Self> {
        let server_known = context
            .replica
            .find(note_id)
            .await?
            .map(|record| record.vector_clock)
            .unwrap_or_default();

        let inner = Arc::new(ChannelInner {
            note_id: note_id.to_string(),
            doc: Arc::clone(&doc),
            context,
            runtime: Handle::current(),
            is_syncing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            server_known: Mutex::new(server_known),
            pending_push: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        let hook = doc.on_change(move |change| {
            if change.origin != ChangeOrigin::Local {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.is_syncing.load(Ordering::Acquire) {
                inner.schedule_push();
            }
        });

        debug!("Opened live channel for {}", note_id);
        Ok(Self {
            inner,
            hook: Mutex::new(Some(hook)),
        })
    }

    pub fn note_id(&self) -> &str {
        &self.inner.note_id
    }

    pub fn document(&self) -> &Arc<NoteDocument> {
        &self.inner.doc
    }

    pub fn server_known(&self) -> VectorClock {
        lock(&self.inner.server_known).clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// True while a debounced push is waiting.
    pub fn has_pending_push(&self) -> bool {
        lock(&self.inner.pending_push).is_some()
    }

    /// Persist the document and send it upstream if connected.
    ///
    /// Returns whether an update was sent. Being offline is not an error.
    pub async fn push_update(&self) -> Result<bool> {
        self.inner.push().await
    }

    /// Merge a downstream note into the document.
    pub async fn apply_remote_update(&self, remote: &NoteState) -> Result<()> {
        self.inner.apply_remote(remote).await
    }

    /// Merge the replica's copy into the document after a batch sync changed it.
    pub async fn reload_from_replica(&self) -> Result<bool> {
        self.inner.reload().await
    }

    /// Push now if a debounced push is waiting.
    pub async fn flush(&self) -> Result<bool> {
        let pending = lock(&self.inner.pending_push).take();
        match pending {
            Some(task) => {
                task.abort();
                self.inner.push().await
            }
            None => Ok(false),
        }
    }

    /// Flush pending edits, then destroy.
    pub async fn close(&self) {
        if let Err(e) = self.flush().await {
            warn!("Final push of {} failed: {}", self.note_id(), e);
        }
        self.destroy();
    }

    /// Release the change hook and cancel any waiting push. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.hook).take();
        if let Some(task) = lock(&self.inner.pending_push).take() {
            task.abort();
        }
        debug!("Closed live channel for {}", self.inner.note_id);
    }
}

impl Drop for LiveSyncChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
