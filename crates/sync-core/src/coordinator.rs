//! SyncCoordinator: batch reconciliation of the local replica with the server.
//!
//! A batch sync works as follows:
//!
//! 1. Collect `{id, vectorClock}` for every local note
//! 2. Ask the server for a plan: server copies we are behind on, and ids the
//!    server is behind on
//! 3. Download: create missing notes, merge existing ones
//! 4. Upload: submit each planned note with the clock we believe the server
//!    holds (`old`) and our clock (`new`)
//! 5. Rejected uploads are merged with the returned server copy and
//!    resubmitted, for a bounded number of rounds
//!
//! Per-note failures are logged, reported, and skipped. Only failures that
//! make the whole batch meaningless (listing the replica, fetching the plan,
//! a failed `save` round trip) abort it.

use crate::device_id::DeviceId;
use crate::document::{self, DocumentError, NoteDocument};
use crate::events::{EventBus, SyncEvent, emit_to};
use crate::note::{NoteRecord, NoteState, NoteUpload, UNTITLED};
use crate::replica::{LocalReplica, ReplicaError};
use crate::transport::{ServiceError, SyncService};
use crate::vector_clock::VectorClock;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::SystemTime;

/// Rounds of save after the first rejection before giving up on a note.
const MAX_SAVE_ROUNDS: usize = 3;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// What happened to one downloaded note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The note did not exist locally and was created from the server copy.
    Created,
    /// The server copy was merged into the local note.
    Merged { equal_to_remote: bool },
}

/// A note that was skipped during a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFailure {
    pub note_id: String,
    pub error: String,
}

/// Summary of one batch sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub merged: Vec<String>,
    pub uploaded: Vec<String>,
    /// Ids the server rejected at least once (conflicts), in rejection order.
    pub rejected: Vec<String>,
    pub failed: Vec<NoteFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Bring the local replica in line with one server copy of a note.
///
/// Missing locally: created from the server copy with the server's clock.
/// Present locally: CRDT merge. If the merge kept local-only changes, the
/// local clock moves strictly past the server's at `device` so the result
/// is recognized as newer; otherwise the clocks are just merged.
///
/// Shared by batch download and by live updates for notes with no open
/// channel.
pub async fn reconcile_note<R: LocalReplica + ?Sized>(
    replica: &R,
    device: &DeviceId,
    remote: &NoteState,
) -> Result<Reconciled> {
    match replica.find(&remote.id).await? {
        None => {
            let doc = NoteDocument::decode(&remote.content)?;
            let record = NoteRecord {
                id: remote.id.clone(),
                title: doc.extract_title().unwrap_or_else(|| UNTITLED.to_string()),
                content: remote.content.clone(),
                state_vector: doc.encode_state_vector(),
                vector_clock: remote.vector_clock.clone(),
                daily_at: remote.daily_at.clone(),
            };
            replica.upsert(record).await?;
            debug!("Created note {} from server copy", remote.id);
            Ok(Reconciled::Created)
        }
        Some(local) => {
            let outcome = document::merge(&local.content, &remote.content)?;
            let merged = NoteDocument::decode(&outcome.merged)?;

            let vector_clock = if outcome.equal_to_remote {
                local.vector_clock.merged(&remote.vector_clock)
            } else {
                local
                    .vector_clock
                    .advanced_past(&remote.vector_clock, device.as_str())
            };

            let record = NoteRecord::from_document(
                &remote.id,
                &merged,
                vector_clock,
                remote.daily_at.clone().or(local.daily_at),
            )?;
            debug!(
                "Merged note {} (clock {}, equal_to_remote={})",
                remote.id, record.vector_clock, outcome.equal_to_remote
            );
            replica.upsert(record).await?;
            Ok(Reconciled::Merged {
                equal_to_remote: outcome.equal_to_remote,
            })
        }
    }
}

/// Client-side batch sync driver.
pub struct SyncCoordinator<R: ?Sized, S: ?Sized> {
    replica: Arc<R>,
    service: Arc<S>,
    device: DeviceId,
    events: Option<Arc<EventBus<SyncEvent>>>,
    last_sync: Mutex<Option<SystemTime>>,
}

impl<R, S> SyncCoordinator<R, S>
where
    R: LocalReplica + ?Sized,
    S: SyncService + ?Sized,
{
    pub fn new(replica: Arc<R>, service: Arc<S>, device: DeviceId) -> Self {
        Self {
            replica,
            service,
            device,
            events: None,
            last_sync: Mutex::new(None),
        }
    }

    /// Emit `SyncEvent`s on `events` while syncing.
    pub fn with_events(mut self, events: Arc<EventBus<SyncEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Time of the last batch sync that completed, if any.
    pub fn last_sync(&self) -> Option<SystemTime> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_last_sync(&self, value: Option<SystemTime>) {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    fn emit(&self, event: SyncEvent) {
        emit_to(self.events.as_ref(), event);
    }

    fn fail(&self, report: &mut SyncReport, note_id: &str, error: impl ToString) {
        let error = error.to_string();
        warn!("Skipping note {}: {}", note_id, error);
        self.emit(SyncEvent::NoteFailed {
            note_id: note_id.to_string(),
            error: error.clone(),
        });
        report.failed.push(NoteFailure {
            note_id: note_id.to_string(),
            error,
        });
    }

    /// Run one full batch reconciliation.
    pub async fn run_batch_sync(&self) -> Result<SyncReport> {
        let local_metadata = self.replica.list_metadata().await?;
        debug!("Batch sync: {} local notes", local_metadata.len());

        let plan = self.service.get_sync_plan(local_metadata).await?;
        info!(
            "Sync plan: {} to download, {} to upload",
            plan.notes_to_download.len(),
            plan.notes_to_upload.len()
        );

        let mut report = SyncReport::default();
        // Clock the server holds for each note we learned about
        let mut server_clocks: BTreeMap<String, VectorClock> = BTreeMap::new();
        let mut to_upload: Vec<String> = Vec::new();
        let mut queued: HashSet<String> = HashSet::new();

        for remote in &plan.notes_to_download {
            server_clocks.insert(remote.id.clone(), remote.vector_clock.clone());
            match reconcile_note(self.replica.as_ref(), &self.device, remote).await {
                Ok(Reconciled::Created) => {
                    report.created.push(remote.id.clone());
                    self.emit(SyncEvent::NoteCreated {
                        note_id: remote.id.clone(),
                    });
                }
                Ok(Reconciled::Merged { equal_to_remote }) => {
                    report.merged.push(remote.id.clone());
                    self.emit(SyncEvent::NoteMerged {
                        note_id: remote.id.clone(),
                        equal_to_remote,
                    });
                    if !equal_to_remote && queued.insert(remote.id.clone()) {
                        to_upload.push(remote.id.clone());
                    }
                }
                Err(e) => self.fail(&mut report, &remote.id, e),
            }
        }

        let failed: HashSet<String> = report.failed.iter().map(|f| f.note_id.clone()).collect();
        for id in &plan.notes_to_upload {
            if !failed.contains(id) && queued.insert(id.clone()) {
                to_upload.push(id.clone());
            }
        }

        let mut round = 0;
        while !to_upload.is_empty() {
            if round > MAX_SAVE_ROUNDS {
                for id in std::mem::take(&mut to_upload) {
                    self.fail(&mut report, &id, "conflict retries exhausted");
                }
                break;
            }
            round += 1;
            to_upload = self
                .upload_round(&to_upload, &mut server_clocks, &mut report)
                .await?;
        }

        self.set_last_sync(Some(SystemTime::now()));
        info!(
            "Batch sync finished: {} created, {} merged, {} uploaded, {} failed",
            report.created.len(),
            report.merged.len(),
            report.uploaded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Submit one round of uploads. Returns the ids to resubmit.
    async fn upload_round(
        &self,
        ids: &[String],
        server_clocks: &mut BTreeMap<String, VectorClock>,
        report: &mut SyncReport,
    ) -> Result<Vec<String>> {
        let mut uploads = Vec::with_capacity(ids.len());
        for id in ids {
            match self.build_upload(id, server_clocks.get(id)).await {
                Ok(upload) => uploads.push(upload),
                Err(e) => self.fail(report, id, e),
            }
        }
        if uploads.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Saving {} notes", uploads.len());
        let saved = self.service.save(uploads, self.device.as_str()).await?;

        for id in saved.accepted {
            self.emit(SyncEvent::NoteUploaded {
                note_id: id.clone(),
            });
            report.uploaded.push(id);
        }

        let mut retry = Vec::new();
        for authoritative in saved.rejected {
            let id = authoritative.id.clone();
            warn!(
                "Upload of {} rejected, server holds {}",
                id, authoritative.vector_clock
            );
            self.emit(SyncEvent::UploadRejected {
                note_id: id.clone(),
            });
            if !report.rejected.contains(&id) {
                report.rejected.push(id.clone());
            }
            server_clocks.insert(id.clone(), authoritative.vector_clock.clone());

            match reconcile_note(self.replica.as_ref(), &self.device, &authoritative).await {
                Ok(Reconciled::Merged {
                    equal_to_remote: false,
                }) => retry.push(id),
                // Nothing local left to send: the server copy covers it
                Ok(_) => {}
                Err(e) => self.fail(report, &id, e),
            }
        }
        Ok(retry)
    }

    async fn build_upload(&self, id: &str, server_clock: Option<&VectorClock>) -> Result<NoteUpload> {
        let record = self.replica.get(id).await?;
        let doc = NoteDocument::decode(&record.content)?;
        Ok(NoteUpload {
            id: record.id,
            content: record.content,
            state_vector: doc.encode_state_vector(),
            daily_at: record.daily_at,
            old_vector_clock: server_clock
                .cloned()
                .unwrap_or_else(|| record.vector_clock.clone()),
            new_vector_clock: record.vector_clock,
        })
    }

    /// Delete every note of the user on the server.
    ///
    /// The local replica is left alone. The last-sync time is cleared so the
    /// next batch starts from scratch.
    pub async fn purge_remote(&self) -> Result<()> {
        self.service.purge().await?;
        self.set_last_sync(None);
        info!("Purged remote notes");
        Ok(())
    }
}
