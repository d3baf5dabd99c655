//! SyncClient: wires the connection, the batch coordinator and the channel
//! router for one user on one device.
//!
//! - Every time the connection opens, a batch sync runs first
//! - Downstream notes are dispatched to open channels or the replica
//! - With `batch_interval` set, a batch sync also runs periodically
//!
//! Batch syncs never overlap. Notes they change are reloaded into any open
//! document.

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, LiveConnection};
use crate::live::{ChannelContext, ChannelError, LiveSyncChannel};
use crate::router::ChannelRouter;
use std::sync::Arc;
use std::time::Duration;
use sync_core::coordinator::{self, CoordinatorError};
use sync_core::document::DocumentError;
use sync_core::replica::{LocalReplica, ReplicaError};
use sync_core::transport::LiveTransport;
use sync_core::{
    DeviceId, EventBus, NoteDocument, NoteRecord, SyncCoordinator, SyncEvent, SyncReport,
    VectorClock,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use web_time::SystemTime;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Sync error: {0}")]
    Sync(#[from] CoordinatorError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

type Coordinator = SyncCoordinator<dyn LocalReplica, LiveConnection>;

/// Serialized batch sync followed by a refresh of open documents.
struct BatchRunner {
    coordinator: Coordinator,
    router: Arc<ChannelRouter>,
    running: tokio::sync::Mutex<()>,
}

impl BatchRunner {
    async fn run(&self) -> coordinator::Result<SyncReport> {
        let _running = self.running.lock().await;
        let report = self.coordinator.run_batch_sync().await?;

        // Uploaded notes are included so open channels learn the clock the
        // server now holds
        let touched: Vec<String> = report
            .created
            .iter()
            .chain(&report.merged)
            .chain(&report.rejected)
            .chain(&report.uploaded)
            .cloned()
            .collect();
        self.router.refresh(&touched).await;
        Ok(report)
    }

    async fn run_logged(&self, reason: &str) {
        match self.run().await {
            Ok(report) if report.is_clean() => debug!("Batch sync ({}) clean", reason),
            Ok(report) => info!(
                "Batch sync ({}) skipped {} notes",
                reason,
                report.failed.len()
            ),
            Err(e) => error!("Batch sync ({}) failed: {}", reason, e),
        }
    }
}

pub struct SyncClient {
    config: ClientConfig,
    replica: Arc<dyn LocalReplica>,
    connection: Arc<LiveConnection>,
    batch: Arc<BatchRunner>,
    router: Arc<ChannelRouter>,
    events: Arc<EventBus<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    /// Start syncing `replica`. Must be called inside a tokio runtime.
    pub fn start(config: ClientConfig, replica: Arc<dyn LocalReplica>) -> Self {
        let events = Arc::new(EventBus::new());
        let (connection, connection_events) =
            LiveConnection::start(config.clone(), Some(Arc::clone(&events)));

        let transport: Arc<dyn LiveTransport> = connection.clone();
        let router = Arc::new(ChannelRouter::new(ChannelContext {
            replica: Arc::clone(&replica),
            transport,
            device: config.device_id.clone(),
            debounce: config.debounce,
            events: Some(Arc::clone(&events)),
        }));

        let coordinator = SyncCoordinator::new(
            Arc::clone(&replica),
            Arc::clone(&connection),
            config.device_id.clone(),
        )
        .with_events(Arc::clone(&events));
        let batch = Arc::new(BatchRunner {
            coordinator,
            router: Arc::clone(&router),
            running: tokio::sync::Mutex::new(()),
        });

        let mut tasks = vec![tokio::spawn(drive(
            connection_events,
            Arc::clone(&batch),
            Arc::clone(&router),
        ))];
        if let Some(period) = config.batch_interval {
            tasks.push(tokio::spawn(periodic_sync(
                period,
                Arc::clone(&connection),
                Arc::clone(&batch),
            )));
        }

        info!(
            "Sync client started for user {} on device {}",
            config.user_id, config.device_id
        );
        Self {
            config,
            replica,
            connection,
            batch,
            router,
            events,
            tasks,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn events(&self) -> &Arc<EventBus<SyncEvent>> {
        &self.events
    }

    pub fn connection(&self) -> &Arc<LiveConnection> {
        &self.connection
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    pub fn replica(&self) -> &Arc<dyn LocalReplica> {
        &self.replica
    }

    pub fn last_sync(&self) -> Option<SystemTime> {
        self.batch.coordinator.last_sync()
    }

    /// Run a batch sync now.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        Ok(self.batch.run().await?)
    }

    /// Delete every note of this user on the server.
    pub async fn purge_remote(&self) -> Result<()> {
        Ok(self.batch.coordinator.purge_remote().await?)
    }

    /// Delete every note of this user on the server and on this device.
    ///
    /// Open channels are closed first so a pending push cannot bring a note
    /// back.
    pub async fn purge_all(&self) -> Result<()> {
        self.router.close_all().await;
        self.purge_remote().await?;
        self.replica.clear().await?;
        info!("Purged all notes of user {}", self.config.user_id);
        Ok(())
    }

    /// Create a note locally. Its clock starts at zero for this device; the
    /// next batch sync uploads it.
    pub async fn create_note(&self, note_id: &str, body: &str) -> Result<NoteRecord> {
        let doc = NoteDocument::from_text(body)?;
        let clock = VectorClock::new().with(self.config.device_id.as_str(), 0);
        let record = NoteRecord::from_document(note_id, &doc, clock, None)?;
        self.replica.upsert(record.clone()).await?;
        debug!("Created local note {}", note_id);
        Ok(record)
    }

    /// Open the stored note for editing with live sync.
    ///
    /// A note that is not stored yet starts empty.
    pub async fn open_note(&self, note_id: &str) -> Result<Arc<LiveSyncChannel>> {
        let doc = match self.replica.find(note_id).await? {
            Some(record) => NoteDocument::decode(&record.content)?,
            None => NoteDocument::new(),
        };
        self.open_document(note_id, Arc::new(doc)).await
    }

    /// Attach live sync to an editor's document.
    pub async fn open_document(
        &self,
        note_id: &str,
        doc: Arc<NoteDocument>,
    ) -> Result<Arc<LiveSyncChannel>> {
        Ok(self.router.open(note_id, doc).await?)
    }

    /// Flush and close the live channel of `channel`'s document.
    pub async fn close_note(&self, channel: &LiveSyncChannel) -> bool {
        self.router
            .close(channel.note_id(), channel.document())
            .await
    }

    /// Flush open documents and disconnect.
    pub async fn shutdown(self) {
        self.router.close_all().await;
        // Drop aborts the tasks and closes the connection
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.connection.close();
    }
}

/// React to connection events until the connection task ends.
async fn drive(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    batch: Arc<BatchRunner>,
    router: Arc<ChannelRouter>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Opened => batch.run_logged("connect").await,
            ConnectionEvent::Downstream(note) => router.dispatch(&note).await,
            ConnectionEvent::Closed => {
                debug!("Connection closed, edits stay local until reconnect")
            }
        }
    }
}

async fn periodic_sync(period: Duration, connection: Arc<LiveConnection>, batch: Arc<BatchRunner>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; on-connect sync covers it
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if connection.is_open() {
            batch.run_logged("interval").await;
        }
    }
}
