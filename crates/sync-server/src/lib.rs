//! sync-server library: Exposes the server components for the binary and tests.
//!
//! One coordinator task per user owns that user's notes. Connections and
//! batch RPCs reach it through the registry.

pub mod actor;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;

// Re-export key types for convenience
pub use actor::{CoordinatorHandle, UserCoordinator, write_allowed};
pub use config::ServerConfig;
pub use connection::{ClientConnection, ConnectionState};
pub use registry::CoordinatorRegistry;
pub use server::SyncServer;
pub use service::{RemoteSyncService, UserSession};
pub use store::{FileStore, MemoryStore, NoteStore, StoreBackend};
