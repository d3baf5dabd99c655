//! Note records exchanged between replicas.
//!
//! - `NoteRecord`: the client-local copy, including the derived title cache.
//! - `NoteState`: the authoritative/server copy. Also the downstream live
//!   message and the `notesToDownload` entries of a sync plan.
//! - `NoteMetadata`: id + clock, all that sync planning needs.
//! - `NoteUpload`: one entry of a batch `save`.

use crate::document::{self, NoteDocument};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};

/// Display title used when a note has no heading.
pub const UNTITLED: &str = "Untitled";

/// Client-local note record, as stored by the local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: String,
    pub title: String,
    pub content: Vec<u8>,
    #[serde(rename = "sv")]
    pub state_vector: Vec<u8>,
    pub vector_clock: VectorClock,
    pub daily_at: Option<String>,
}

impl NoteRecord {
    /// Build a record from a live document, deriving title and state vector.
    pub fn from_document(
        id: &str,
        doc: &NoteDocument,
        vector_clock: VectorClock,
        daily_at: Option<String>,
    ) -> document::Result<Self> {
        Ok(Self {
            id: id.to_string(),
            title: doc.extract_title().unwrap_or_else(|| UNTITLED.to_string()),
            content: doc.encode_full()?,
            state_vector: doc.encode_state_vector(),
            vector_clock,
            daily_at,
        })
    }

    pub fn metadata(&self) -> NoteMetadata {
        NoteMetadata {
            id: self.id.clone(),
            vector_clock: self.vector_clock.clone(),
        }
    }

    /// The record as the server would store it (title is client-only).
    pub fn to_state(&self) -> NoteState {
        NoteState {
            id: self.id.clone(),
            vector_clock: self.vector_clock.clone(),
            daily_at: self.daily_at.clone(),
            content: self.content.clone(),
            state_vector: self.state_vector.clone(),
        }
    }
}

/// Full note state as held by the coordinator.
///
/// Wire shape: `{ id, vectorClock, dailyAt, content: int[], sv: int[] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteState {
    pub id: String,
    pub vector_clock: VectorClock,
    pub daily_at: Option<String>,
    pub content: Vec<u8>,
    #[serde(rename = "sv")]
    pub state_vector: Vec<u8>,
}

/// Id and clock of a locally known note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMetadata {
    pub id: String,
    pub vector_clock: VectorClock,
}

/// One note submitted to `save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteUpload {
    pub id: String,
    pub content: Vec<u8>,
    #[serde(rename = "sv")]
    pub state_vector: Vec<u8>,
    pub daily_at: Option<String>,
    /// Clock the client believes the server currently holds.
    pub old_vector_clock: VectorClock,
    /// Clock of the version being uploaded.
    pub new_vector_clock: VectorClock,
}

impl NoteUpload {
    /// The state the server stores if it accepts this upload.
    pub fn into_state(self) -> NoteState {
        NoteState {
            id: self.id,
            vector_clock: self.new_vector_clock,
            daily_at: self.daily_at,
            content: self.content,
            state_vector: self.state_vector,
        }
    }
}

/// Result of batch planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub notes_to_download: Vec<NoteState>,
    pub notes_to_upload: Vec<String>,
}

/// Outcome of a batch `save`.
///
/// Rejected entries carry the authoritative record so the caller can merge
/// and resubmit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub accepted: Vec<String>,
    pub rejected: Vec<NoteState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_state_wire_shape() {
        let state = NoteState {
            id: "n1".into(),
            vector_clock: VectorClock::new().with("d1", 2),
            daily_at: None,
            content: vec![1, 2, 255],
            state_vector: vec![7],
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "n1",
                "vectorClock": {"d1": 2},
                "dailyAt": null,
                "content": [1, 2, 255],
                "sv": [7]
            })
        );
    }

    #[test]
    fn test_record_from_document() {
        let doc = NoteDocument::from_text("# Title here\nbody").unwrap();
        let record = NoteRecord::from_document(
            "n1",
            &doc,
            VectorClock::new().with("d1", 0),
            Some("2024-10-02".into()),
        )
        .unwrap();

        assert_eq!(record.title, "Title here");
        assert_eq!(record.state_vector, doc.encode_state_vector());
        assert_eq!(record.to_state().daily_at.as_deref(), Some("2024-10-02"));

        let untitled = NoteRecord::from_document(
            "n2",
            &NoteDocument::from_text("no heading").unwrap(),
            VectorClock::new(),
            None,
        )
        .unwrap();
        assert_eq!(untitled.title, UNTITLED);
    }

    #[test]
    fn test_upload_into_state_uses_new_clock() {
        let upload = NoteUpload {
            id: "n1".into(),
            content: vec![1],
            state_vector: vec![2],
            daily_at: None,
            old_vector_clock: VectorClock::new().with("d1", 1),
            new_vector_clock: VectorClock::new().with("d1", 2),
        };
        assert_eq!(
            upload.into_state().vector_clock,
            VectorClock::new().with("d1", 2)
        );
    }
}
