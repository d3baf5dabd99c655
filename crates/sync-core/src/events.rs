//! Event infrastructure for sync-core.
//!
//! Provides `SyncEvent` for UI refresh and monitoring, and a generic
//! `EventBus` used both for sync events and for document change hooks.
//! Subscriptions follow the disposer pattern: dropping the handle unsubscribes.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Sync events emitted while reconciling notes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A note that did not exist locally was created from the server copy.
    NoteCreated {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// A server copy was merged into an existing local note.
    NoteMerged {
        #[serde(rename = "noteId")]
        note_id: String,
        /// False if the merge kept local-only changes the server lacks.
        #[serde(rename = "equalToRemote")]
        equal_to_remote: bool,
    },
    /// The server accepted an uploaded note.
    NoteUploaded {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// The server rejected an upload because of intervening writes.
    UploadRejected {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// A note could not be decoded or merged and was skipped.
    NoteFailed {
        #[serde(rename = "noteId")]
        note_id: String,
        error: String,
    },
    /// A live remote update was applied to an open document. Editors re-render on this.
    RemoteApplied {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// A live update was sent upstream.
    UpdatePushed {
        #[serde(rename = "noteId")]
        note_id: String,
    },
    /// The live connection opened or closed.
    ConnectionChanged { open: bool },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it to unsubscribe.
pub struct Subscription<E> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Publish/subscribe bus. Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit releases the lock before running callbacks, so this cannot
        // deadlock even when a callback drops a subscription
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}

/// Emit on an optional bus.
pub(crate) fn emit_to(bus: Option<&Arc<EventBus<SyncEvent>>>, event: SyncEvent) {
    if let Some(bus) = bus {
        bus.emit(event);
    }
}
