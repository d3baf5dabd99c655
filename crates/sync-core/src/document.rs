//! NoteDocument: Loro document wrapper for a single note.
//!
//! The content is an opaque CRDT state as far as sync is concerned. The only
//! structure read here is the `body` text container, to derive a display title
//! from its first heading. Everything else (rich-text semantics) belongs to the
//! editor.
//!
//! Change hooks fire after every mutation with a `ChangeOrigin`, so live sync
//! can tell local edits from applied remote state.

use crate::events::{EventBus, Subscription};
use loro::{ExportMode, LoroDoc, LoroText, LoroValue, UpdateOptions};
use std::sync::Arc;
use thiserror::Error;

/// Root text container holding the note body.
const BODY: &str = "body";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Edit error: {0}")]
    Edit(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Where a document mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Typed by the user on this device.
    Local,
    /// Imported from another replica (live push or sync).
    Remote,
}

/// Payload delivered to change hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
}

/// A single note as a Loro document.
pub struct NoteDocument {
    doc: LoroDoc,
    hooks: Arc<EventBus<DocumentChange>>,
}

impl Default for NoteDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            hooks: Arc::new(EventBus::new()),
        }
    }

    /// Create a document whose body starts as `body`.
    pub fn from_text(body: &str) -> Result<Self> {
        let document = Self::new();
        document
            .body()
            .insert(0, body)
            .map_err(|e| DocumentError::Edit(e.to_string()))?;
        document.doc.commit();
        Ok(document)
    }

    /// Build a document from encoded state.
    ///
    /// Fails with `DocumentError::Decode` on empty or malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DocumentError::Decode("empty document state".into()));
        }
        let doc = LoroDoc::new();
        doc.import(bytes)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(Self {
            doc,
            hooks: Arc::new(EventBus::new()),
        })
    }

    /// Export the full document state.
    pub fn encode_full(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Encode(e.to_string()))
    }

    /// Export the state vector: a summary of which operations this document contains.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    fn body(&self) -> LoroText {
        self.doc.get_text(BODY)
    }

    /// Current body text.
    pub fn text(&self) -> String {
        self.body().to_string()
    }

    /// Text of the first heading line in the body, if any.
    ///
    /// Display cache only. Never used for identity or merge decisions.
    pub fn extract_title(&self) -> Option<String> {
        first_heading(&self.text())
    }

    /// Replace the body with `new_body` as a local edit.
    ///
    /// Applies a line diff so concurrent edits elsewhere in the text survive a
    /// merge. Returns false (and fires no hook) if nothing changed.
    pub fn edit_body(&self, new_body: &str) -> Result<bool> {
        let body = self.body();
        if body.to_string() == new_body {
            return Ok(false);
        }

        body.update_by_line(new_body, UpdateOptions::default())
            .map_err(|e| DocumentError::Edit(format!("{:?}", e)))?;
        self.doc.commit();

        self.hooks.emit(DocumentChange {
            origin: ChangeOrigin::Local,
        });
        Ok(true)
    }

    /// Import encoded state from another replica.
    ///
    /// Importing the same update twice is a no-op. Returns whether the
    /// document gained operations; hooks only fire when it did.
    pub fn apply_update(&self, bytes: &[u8], origin: ChangeOrigin) -> Result<bool> {
        if bytes.is_empty() {
            return Err(DocumentError::Decode("empty document state".into()));
        }
        let before = self.doc.oplog_vv();
        self.doc
            .import(bytes)
            .map_err(|e| DocumentError::Decode(e.to_string()))?;
        let changed = self.doc.oplog_vv() != before;

        if changed {
            self.hooks.emit(DocumentChange { origin });
        }
        Ok(changed)
    }

    /// True if both documents contain exactly the same operations.
    pub fn same_state_as(&self, other: &NoteDocument) -> bool {
        self.doc.oplog_vv() == other.doc.oplog_vv()
    }

    /// The full logical value of the document, for equivalence checks.
    pub fn logical_value(&self) -> LoroValue {
        self.doc.get_deep_value()
    }

    /// Register a change hook. Dropping the returned handle removes it.
    pub fn on_change(
        &self,
        hook: impl Fn(&DocumentChange) + Send + Sync + 'static,
    ) -> Subscription<DocumentChange> {
        self.hooks.subscribe(hook)
    }
}

/// Result of merging two encoded document states.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Encoded state containing both inputs.
    pub merged: Vec<u8>,
    /// True if the merge result is exactly the remote state, i.e. the local
    /// side contributed nothing the remote lacked.
    pub equal_to_remote: bool,
}

/// Merge local and remote encoded states into one document.
pub fn merge(local: &[u8], remote: &[u8]) -> Result<MergeOutcome> {
    let merged = NoteDocument::decode(local)?;
    merged.apply_update(remote, ChangeOrigin::Remote)?;

    let remote_only = NoteDocument::decode(remote)?;
    let equal_to_remote = merged.same_state_as(&remote_only);

    Ok(MergeOutcome {
        merged: merged.encode_full()?,
        equal_to_remote,
    })
}

/// First ATX heading (`# Title` .. `###### Title`) in markdown-ish text.
fn first_heading(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let line = line.trim_start();
        let level = line.chars().take_while(|&c| c == '#').count();
        if level == 0 || level > 6 {
            return None;
        }
        let rest = &line[level..];
        if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
            return None;
        }
        let title = rest.trim().trim_end_matches('#').trim_end();
        (!title.is_empty()).then(|| title.to_string())
    })
}
