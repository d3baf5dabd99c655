//! sync-core: Shared Rust library for multi-device note replication using Loro CRDTs.
//!
//! This crate provides the core functionality for:
//! - Vector clock causality tracking per device
//! - Managing Loro documents for notes (encode/decode/merge, title extraction)
//! - The note data model and the JSON wire protocol
//! - Batch reconciliation of a local replica against the remote coordinator
//! - LocalReplica and SyncService trait abstractions

pub mod coordinator;
pub mod device_id;
pub mod document;
pub mod events;
pub mod note;
pub mod protocol;
pub mod replica;
pub mod transport;
pub mod vector_clock;

pub use coordinator::{Reconciled, SyncCoordinator, SyncReport, reconcile_note};
pub use device_id::{DeviceId, DeviceIdError};
pub use document::{ChangeOrigin, NoteDocument};
pub use events::{EventBus, Subscription, SyncEvent};
pub use note::{NoteMetadata, NoteRecord, NoteState, NoteUpload, SaveReport, SyncPlan};
pub use protocol::{ControlFrame, LiveUpdate, RpcCall, RpcResult};
pub use replica::{InMemoryReplica, LocalReplica};
pub use transport::{LiveTransport, ServiceError, SyncService};
pub use vector_clock::VectorClock;
