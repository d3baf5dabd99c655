//! WebSocket server accepting client connections.
//!
//! Each accepted socket gets a connection id and its own task. Everything
//! user-specific happens behind the remote sync service.

use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::service::RemoteSyncService;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

pub struct SyncServer {
    config: ServerConfig,
    service: Arc<RemoteSyncService>,
    next_conn_id: AtomicU64,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let service = Arc::new(RemoteSyncService::new(config.store_backend()));
        Self {
            config,
            service,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<RemoteSyncService> {
        &self.service
    }

    /// Upgrade a TCP connection and serve it on its own task.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let connection =
            ClientConnection::new(conn_id, Arc::clone(&self.service), self.config.handshake_timeout);

        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks (like `nc -z`) connect and immediately close without
                    // completing the WebSocket handshake. Log these as debug, not error.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            info!("New connection from {} (conn-{})", addr, conn_id);
            connection.serve(ws).await;
        });
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            self.accept_connection(stream, addr);
        }
    }
}
