//! sync-client: batch and live note sync against a sync-server.
//!
//! `SyncClient` is the entry point. It owns one reconnecting socket
//! (`LiveConnection`) shared by the batch coordinator and by the live
//! channels of open documents (`ChannelRouter`, `LiveSyncChannel`).

pub mod client;
pub mod config;
pub mod connection;
pub mod identity;
pub mod live;
pub mod router;

pub use client::{ClientError, SyncClient};
pub use config::{ClientConfig, ReconnectConfig};
pub use connection::{ConnectionEvent, ConnectionState, LiveConnection};
pub use identity::load_or_create_device_id;
pub use live::{ChannelContext, LiveSyncChannel};
pub use router::ChannelRouter;
