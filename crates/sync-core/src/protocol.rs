//! Wire protocol for the sync socket.
//!
//! Every frame is UTF-8 JSON. Control frames carry a `type` field
//! (handshake, batch RPC request/response). Frames without `type` are live
//! note updates: `LiveUpdate` upstream, bare `NoteState` downstream.
//!
//! Incoming frames are schema-validated here. Anything that fails is a
//! `SchemaError`; callers log and drop it.

use crate::note::{NoteMetadata, NoteState, NoteUpload, SaveReport, SyncPlan};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum frame size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid JSON: {0}")]
    Json(String),

    #[error("Invalid message shape: {0}")]
    Shape(String),

    #[error("Missing required field: {0}")]
    Empty(&'static str),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Which side of the connection sent a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Client,
    Server,
}

/// A batch RPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RpcCall {
    #[serde(rename_all = "camelCase")]
    GetSyncPlan { local_metadata: Vec<NoteMetadata> },
    #[serde(rename_all = "camelCase")]
    Save {
        notes: Vec<NoteUpload>,
        client_id: String,
    },
    Purge,
}

impl RpcCall {
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::GetSyncPlan { .. } => "getSyncPlan",
            RpcCall::Save { .. } => "save",
            RpcCall::Purge => "purge",
        }
    }
}

/// A successful batch RPC result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RpcResult {
    SyncPlan(SyncPlan),
    Saved(SaveReport),
    Purged,
}

/// Control frames (everything with a `type` field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlFrame {
    /// First frame in each direction.
    #[serde(rename_all = "camelCase")]
    Handshake {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Rpc { request_id: u64, call: RpcCall },
    #[serde(rename_all = "camelCase")]
    RpcResult { request_id: u64, result: RpcResult },
    #[serde(rename_all = "camelCase")]
    RpcError { request_id: u64, message: String },
}

impl ControlFrame {
    pub fn client_handshake(user_id: &str, client_id: &str) -> Self {
        ControlFrame::Handshake {
            role: Role::Client,
            user_id: Some(user_id.to_string()),
            client_id: Some(client_id.to_string()),
        }
    }

    pub fn server_handshake() -> Self {
        ControlFrame::Handshake {
            role: Role::Server,
            user_id: None,
            client_id: None,
        }
    }

    pub fn to_json(&self) -> String {
        encode(self)
    }
}

/// Upstream live message: a client's latest state for one note.
///
/// Wire shape: `{ clientId, note: { id, vectorClock, dailyAt, content, sv } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    pub client_id: String,
    pub note: NoteState,
}

impl LiveUpdate {
    /// Parse and validate an upstream live message.
    pub fn parse(text: &str) -> Result<Self> {
        let update: LiveUpdate = serde_json::from_str(text)
            .map_err(|e| SchemaError::Shape(e.to_string()))?;
        if update.client_id.is_empty() {
            return Err(SchemaError::Empty("clientId"));
        }
        validate_note(&update.note)?;
        Ok(update)
    }

    pub fn to_json(&self) -> String {
        encode(self)
    }
}

/// Parse and validate a downstream live message.
pub fn parse_downstream(text: &str) -> Result<NoteState> {
    let note: NoteState =
        serde_json::from_str(text).map_err(|e| SchemaError::Shape(e.to_string()))?;
    validate_note(&note)?;
    Ok(note)
}

/// Serialize a downstream live message.
pub fn encode_downstream(note: &NoteState) -> String {
    encode(note)
}

fn validate_note(note: &NoteState) -> Result<()> {
    if note.id.is_empty() {
        return Err(SchemaError::Empty("note.id"));
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> String {
    // Plain derive(Serialize) structs with string map keys cannot fail
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!("Failed to encode frame: {}", e);
        String::from("{}")
    })
}

/// A frame classified by shape, not yet validated as a live message.
#[derive(Debug)]
pub enum Incoming {
    Control(ControlFrame),
    /// Frame without a `type` field. Raw text is kept so the owner of the
    /// live path validates it.
    Live(String),
}

/// Classify an incoming frame.
///
/// Control frames are fully parsed here; live frames are passed through.
pub fn classify(text: &str) -> Result<Incoming> {
    let value: Value = serde_json::from_str(text).map_err(|e| SchemaError::Json(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(SchemaError::Shape("expected a JSON object".into()));
    };

    if map.contains_key("type") {
        let frame: ControlFrame =
            serde_json::from_value(value).map_err(|e| SchemaError::Shape(e.to_string()))?;
        Ok(Incoming::Control(frame))
    } else {
        Ok(Incoming::Live(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_clock::VectorClock;

    fn note() -> NoteState {
        NoteState {
            id: "n1".into(),
            vector_clock: VectorClock::new().with("d1", 3),
            daily_at: Some("2025-04-05".into()),
            content: vec![1, 2, 3],
            state_vector: vec![4],
        }
    }

    #[test]
    fn test_upstream_wire_shape() {
        let update = LiveUpdate {
            client_id: "d1".into(),
            note: note(),
        };
        let value: Value = serde_json::from_str(&update.to_json()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "clientId": "d1",
                "note": {
                    "id": "n1",
                    "vectorClock": {"d1": 3},
                    "dailyAt": "2025-04-05",
                    "content": [1, 2, 3],
                    "sv": [4]
                }
            })
        );
        assert_eq!(LiveUpdate::parse(&update.to_json()).unwrap(), update);
    }

    #[test]
    fn test_upstream_rejects_malformed() {
        // Not JSON
        assert!(LiveUpdate::parse("not json").is_err());
        // Empty client id
        let empty_client = r#"{"clientId":"","note":{"id":"n1","vectorClock":{},"dailyAt":null,"content":[],"sv":[]}}"#;
        assert!(matches!(
            LiveUpdate::parse(empty_client),
            Err(SchemaError::Empty("clientId"))
        ));
        // Byte out of range
        let bad_byte = r#"{"clientId":"d1","note":{"id":"n1","vectorClock":{},"dailyAt":null,"content":[256],"sv":[]}}"#;
        assert!(LiveUpdate::parse(bad_byte).is_err());
        // Missing note
        assert!(LiveUpdate::parse(r#"{"clientId":"d1"}"#).is_err());
        // Empty note id
        let empty_id = r#"{"clientId":"d1","note":{"id":"","vectorClock":{},"dailyAt":null,"content":[],"sv":[]}}"#;
        assert!(LiveUpdate::parse(empty_id).is_err());
    }

    #[test]
    fn test_downstream_roundtrip() {
        let text = encode_downstream(&note());
        assert!(!text.contains("clientId"));
        assert_eq!(parse_downstream(&text).unwrap(), note());
        assert!(parse_downstream(r#"{"id":"n1"}"#).is_err());
    }

    #[test]
    fn test_classify() {
        let hs = ControlFrame::client_handshake("user-1", "d1").to_json();
        assert!(hs.contains(r#""type":"handshake""#));
        assert!(hs.contains(r#""userId":"user-1""#));
        match classify(&hs).unwrap() {
            Incoming::Control(ControlFrame::Handshake { role, user_id, .. }) => {
                assert_eq!(role, Role::Client);
                assert_eq!(user_id.as_deref(), Some("user-1"));
            }
            other => panic!("Expected handshake, got {:?}", other),
        }

        let live = encode_downstream(&note());
        assert!(matches!(classify(&live).unwrap(), Incoming::Live(_)));

        assert!(classify("[1,2,3]").is_err());
        assert!(classify(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn test_rpc_frames() {
        let request = ControlFrame::Rpc {
            request_id: 7,
            call: RpcCall::GetSyncPlan {
                local_metadata: vec![NoteMetadata {
                    id: "n1".into(),
                    vector_clock: VectorClock::new().with("d1", 1),
                }],
            },
        };
        let json = request.to_json();
        assert!(json.contains(r#""method":"getSyncPlan""#));
        assert!(json.contains(r#""localMetadata""#));
        assert!(json.contains(r#""requestId":7"#));

        let response = ControlFrame::RpcResult {
            request_id: 7,
            result: RpcResult::Saved(SaveReport {
                accepted: vec!["n1".into()],
                rejected: vec![],
            }),
        };
        let json = response.to_json();
        assert!(json.contains(r#""kind":"saved""#));
        match classify(&json).unwrap() {
            Incoming::Control(frame) => assert_eq!(frame, response),
            other => panic!("Expected control frame, got {:?}", other),
        }

        let purge = ControlFrame::Rpc {
            request_id: 8,
            call: RpcCall::Purge,
        };
        assert!(purge.to_json().contains(r#""call":{"method":"purge"}"#));
    }
}
