//! ChannelRouter: the registry of open live channels.
//!
//! At most one channel per note. Downstream notes go to the note's channel
//! if one is open; otherwise they are reconciled straight into the local
//! replica with the batch download rules.

use crate::live::{self, ChannelContext, LiveSyncChannel, lock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sync_core::events::SyncEvent;
use sync_core::{NoteDocument, NoteState, Reconciled, reconcile_note};
use tracing::{debug, warn};

pub struct ChannelRouter {
    context: ChannelContext,
    channels: Mutex<HashMap<String, Arc<LiveSyncChannel>>>,
}

impl ChannelRouter {
    pub fn new(context: ChannelContext) -> Self {
        Self {
            context,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Open a channel for `note_id` bound to `doc`.
    ///
    /// A channel already open for the note is flushed and destroyed first.
    pub async fn open(
        &self,
        note_id: &str,
        doc: Arc<NoteDocument>,
    ) -> live::Result<Arc<LiveSyncChannel>> {
        let previous = lock(&self.channels).remove(note_id);
        if let Some(previous) = previous {
            debug!("Replacing live channel for {}", note_id);
            previous.close().await;
        }

        let channel = Arc::new(LiveSyncChannel::open(note_id, doc, self.context.clone()).await?);
        if let Some(raced) = lock(&self.channels).insert(note_id.to_string(), Arc::clone(&channel))
        {
            raced.destroy();
        }
        Ok(channel)
    }

    /// Close the channel for `note_id` if it is bound to `doc`.
    ///
    /// A stale close from an editor that was already replaced leaves the
    /// current channel alone. Returns whether a channel was closed.
    pub async fn close(&self, note_id: &str, doc: &Arc<NoteDocument>) -> bool {
        let removed = {
            let mut channels = lock(&self.channels);
            match channels.get(note_id) {
                Some(channel) if Arc::ptr_eq(channel.document(), doc) => channels.remove(note_id),
                _ => None,
            }
        };

        match removed {
            Some(channel) => {
                channel.close().await;
                true
            }
            None => {
                debug!("Ignoring close of {}: not the open document", note_id);
                false
            }
        }
    }

    /// Close every channel.
    pub async fn close_all(&self) {
        let channels: Vec<_> = lock(&self.channels).drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close().await;
        }
    }

    pub fn get(&self, note_id: &str) -> Option<Arc<LiveSyncChannel>> {
        lock(&self.channels).get(note_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one downstream note.
    pub async fn dispatch(&self, remote: &NoteState) {
        if let Some(channel) = self.get(&remote.id) {
            if let Err(e) = channel.apply_remote_update(remote).await {
                warn!("Failed to apply live update for {}: {}", remote.id, e);
            }
            return;
        }

        let replica = self.context.replica.as_ref();
        match reconcile_note(replica, &self.context.device, remote).await {
            Ok(Reconciled::Created) => {
                debug!("Created {} from live update", remote.id);
                self.context.emit(SyncEvent::NoteCreated {
                    note_id: remote.id.clone(),
                });
            }
            Ok(Reconciled::Merged { equal_to_remote }) => {
                debug!("Merged live update into closed note {}", remote.id);
                self.context.emit(SyncEvent::NoteMerged {
                    note_id: remote.id.clone(),
                    equal_to_remote,
                });
            }
            Err(e) => {
                warn!("Skipping live update for {}: {}", remote.id, e);
                self.context.emit(SyncEvent::NoteFailed {
                    note_id: remote.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Pull replica changes from a batch sync into open documents.
    pub async fn refresh(&self, note_ids: &[String]) {
        for note_id in note_ids {
            if let Some(channel) = self.get(note_id) {
                if let Err(e) = channel.reload_from_replica().await {
                    warn!("Failed to refresh open note {}: {}", note_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use sync_core::transport::{self, LiveTransport};
    use sync_core::{EventBus, InMemoryReplica, LiveUpdate, LocalReplica, VectorClock};

    struct Offline;

    #[async_trait]
    impl LiveTransport for Offline {
        fn is_open(&self) -> bool {
            false
        }

        async fn send_update(&self, _update: &LiveUpdate) -> transport::Result<()> {
            Ok(())
        }
    }

    fn router() -> (ChannelRouter, Arc<InMemoryReplica>, Arc<EventBus<SyncEvent>>) {
        let replica = Arc::new(InMemoryReplica::new());
        let events = Arc::new(EventBus::new());
        let context = ChannelContext {
            replica: replica.clone(),
            transport: Arc::new(Offline),
            device: "d100000000000001".parse().unwrap(),
            debounce: Duration::from_secs(1),
            events: Some(Arc::clone(&events)),
        };
        (ChannelRouter::new(context), replica, events)
    }

    fn remote_state(id: &str, text: &str) -> NoteState {
        let doc = NoteDocument::from_text(text).unwrap();
        NoteState {
            id: id.into(),
            vector_clock: VectorClock::new().with("d2", 1),
            daily_at: None,
            content: doc.encode_full().unwrap(),
            state_vector: doc.encode_state_vector(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_replaces_previous_channel() {
        let (router, _, _) = router();
        let first_doc = Arc::new(NoteDocument::new());
        let second_doc = Arc::new(NoteDocument::new());

        let first = router.open("n1", Arc::clone(&first_doc)).await.unwrap();
        let second = router.open("n1", Arc::clone(&second_doc)).await.unwrap();

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert_eq!(router.len(), 1);
        assert!(Arc::ptr_eq(router.get("n1").unwrap().document(), &second_doc));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_close_is_ignored() {
        let (router, _, _) = router();
        let old_doc = Arc::new(NoteDocument::new());
        let new_doc = Arc::new(NoteDocument::new());
        router.open("n1", Arc::clone(&old_doc)).await.unwrap();
        let current = router.open("n1", Arc::clone(&new_doc)).await.unwrap();

        assert!(!router.close("n1", &old_doc).await);
        assert!(!current.is_destroyed());

        assert!(router.close("n1", &new_doc).await);
        assert!(current.is_destroyed());
        assert!(router.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_without_channel_reconciles_into_replica() {
        let (router, replica, events) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event: &SyncEvent| {
            lock(&seen_clone).push(event.clone());
        });

        router.dispatch(&remote_state("n1", "# Closed note")).await;

        let stored = replica.get("n1").await.unwrap();
        assert_eq!(stored.title, "Closed note");
        assert_eq!(stored.vector_clock, VectorClock::new().with("d2", 1));
        assert_eq!(
            lock(&seen).clone(),
            vec![SyncEvent::NoteCreated {
                note_id: "n1".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_goes_to_open_channel() {
        let (router, _, _) = router();
        let doc = Arc::new(NoteDocument::new());
        router.open("n1", Arc::clone(&doc)).await.unwrap();

        router.dispatch(&remote_state("n1", "live text")).await;

        assert_eq!(doc.text(), "live text");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_reloads_open_channels_only() {
        let (router, replica, _) = router();
        let doc = Arc::new(NoteDocument::new());
        let channel = router.open("n1", Arc::clone(&doc)).await.unwrap();

        // A batch sync stored new server copies of an open and a closed note
        for id in ["n1", "n2"] {
            let remote = remote_state(id, "# Batch");
            let stored = NoteDocument::decode(&remote.content).unwrap();
            replica
                .upsert(
                    sync_core::NoteRecord::from_document(id, &stored, remote.vector_clock, None)
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        router.refresh(&["n1".to_string(), "n2".to_string()]).await;

        assert_eq!(doc.text(), "# Batch");
        assert_eq!(channel.server_known(), VectorClock::new().with("d2", 1));
        assert!(router.get("n2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_reports_undecodable_note() {
        let (router, replica, events) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event: &SyncEvent| {
            lock(&seen_clone).push(event.clone());
        });

        let mut broken = remote_state("n1", "x");
        broken.content = vec![0xde, 0xad];
        router.dispatch(&broken).await;

        assert!(replica.is_empty());
        assert!(matches!(
            lock(&seen).first(),
            Some(SyncEvent::NoteFailed { .. })
        ));
    }
}
