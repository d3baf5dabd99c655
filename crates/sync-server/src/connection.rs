//! One client socket, from handshake to close.
//!
//! Lifecycle: `Connecting` until the client's handshake names its user,
//! `Open` while attached to that user's coordinator, `Closed` once the socket
//! ends. A connection that does not complete the handshake in time is closed
//! without ever being attached.
//!
//! Outgoing frames (RPC replies, live broadcasts, rejections) all go through
//! one queue drained by a writer task, so coordinator fan-out never waits on
//! a slow socket.

use crate::actor::{ConnectionId, CoordinatorHandle, Outbound};
use crate::service::RemoteSyncService;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use sync_core::protocol::{self, ControlFrame, Incoming, LiveUpdate, MAX_MESSAGE_SIZE, Role};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Identity a client announces in its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    pub client_id: Option<String>,
}

impl ClientIdentity {
    /// Whether this connection may write under `client_id`.
    ///
    /// A connection that named its device in the handshake only writes as
    /// that device.
    pub fn may_write_as(&self, client_id: &str) -> bool {
        self.client_id.as_deref().is_none_or(|own| own == client_id)
    }
}

pub struct ClientConnection {
    conn_id: ConnectionId,
    service: Arc<RemoteSyncService>,
    handshake_timeout: Duration,
    state: ConnectionState,
}

impl ClientConnection {
    pub fn new(
        conn_id: ConnectionId,
        service: Arc<RemoteSyncService>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            conn_id,
            service,
            handshake_timeout,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("conn-{}: {:?} -> {:?}", self.conn_id, self.state, state);
        self.state = state;
    }

    /// Drive the connection until the socket closes.
    pub async fn serve(mut self, ws: WebSocketStream<TcpStream>) {
        let conn_id = self.conn_id;
        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        // Ends once every sender (ours, the coordinator's, in-flight RPCs) is gone
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("conn-{}: write failed: {}", conn_id, e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let identity = match timeout(self.handshake_timeout, read_handshake(conn_id, &mut read)).await
        {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.set_state(ConnectionState::Closed);
                return;
            }
            Err(_) => {
                warn!(
                    "conn-{}: no handshake within {:?}, closing",
                    conn_id, self.handshake_timeout
                );
                self.set_state(ConnectionState::Closed);
                return;
            }
        };

        let coordinator = match self.service.coordinator(&identity.user_id).await {
            Ok(coordinator) => coordinator,
            Err(e) => {
                error!(
                    "conn-{}: cannot start coordinator for user {}: {}",
                    conn_id, identity.user_id, e
                );
                self.set_state(ConnectionState::Closed);
                return;
            }
        };

        // The coordinator answers with our handshake once attached
        if coordinator.attach(conn_id, outbound.clone()).is_err() {
            error!("conn-{}: coordinator stopped during attach", conn_id);
            self.set_state(ConnectionState::Closed);
            return;
        }
        self.set_state(ConnectionState::Open);
        info!(
            "conn-{}: user {} connected (client {:?})",
            conn_id, identity.user_id, identity.client_id
        );

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.on_text(&identity, &coordinator, &outbound, text);
                }
                Ok(Message::Binary(data)) => {
                    warn!("conn-{}: dropping {} byte binary frame", conn_id, data.len());
                }
                Ok(Message::Close(_)) => {
                    debug!("conn-{}: received close frame", conn_id);
                    break;
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    debug!("conn-{}: closed", conn_id);
                    break;
                }
                Err(e) => {
                    error!("conn-{}: WebSocket error: {}", conn_id, e);
                    break;
                }
            }
        }

        let _ = coordinator.detach(conn_id);
        drop(outbound);
        self.set_state(ConnectionState::Closed);
        info!("conn-{}: user {} disconnected", conn_id, identity.user_id);

        if let Err(e) = writer.await {
            debug!("conn-{}: writer task ended abnormally: {}", conn_id, e);
        }
    }

    fn on_text(
        &self,
        identity: &ClientIdentity,
        coordinator: &CoordinatorHandle,
        outbound: &Outbound,
        text: String,
    ) {
        let conn_id = self.conn_id;
        if text.len() > MAX_MESSAGE_SIZE {
            warn!(
                "conn-{}: message exceeds max size ({} > {}), dropping",
                conn_id,
                text.len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }

        match protocol::classify(&text) {
            Ok(Incoming::Control(ControlFrame::Rpc { request_id, call })) => {
                let service = Arc::clone(&self.service);
                let outbound = outbound.clone();
                let user_id = identity.user_id.clone();
                tokio::spawn(async move {
                    let frame = match service.handle_call(&user_id, call).await {
                        Ok(result) => ControlFrame::RpcResult { request_id, result },
                        Err(e) => {
                            warn!("conn-{}: RPC {} failed: {}", conn_id, request_id, e);
                            ControlFrame::RpcError {
                                request_id,
                                message: e.to_string(),
                            }
                        }
                    };
                    let _ = outbound.send(frame.to_json());
                });
            }
            Ok(Incoming::Control(other)) => {
                warn!("conn-{}: unexpected control frame {:?}, dropping", conn_id, other);
            }
            Ok(Incoming::Live(raw)) => match LiveUpdate::parse(&raw) {
                Ok(update) if !identity.may_write_as(&update.client_id) => {
                    warn!(
                        "conn-{}: live update for {} claims client {}, dropping",
                        conn_id, update.note.id, update.client_id
                    );
                }
                Ok(update) => {
                    debug!(
                        "conn-{}: live update for {} from {}",
                        conn_id, update.note.id, update.client_id
                    );
                    if coordinator.live_update(conn_id, update).is_err() {
                        error!("conn-{}: coordinator gone, dropping live update", conn_id);
                    }
                }
                Err(e) => warn!("conn-{}: invalid live message, dropping: {}", conn_id, e),
            },
            Err(e) => warn!("conn-{}: invalid frame, dropping: {}", conn_id, e),
        }
    }
}

/// Wait for the client's handshake. Any other first frame ends the connection.
async fn read_handshake(
    conn_id: ConnectionId,
    read: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<ClientIdentity> {
    loop {
        let text = match read.next().await? {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(other) => {
                debug!("conn-{}: {:?} before handshake, closing", conn_id, other);
                return None;
            }
            Err(e) => {
                debug!("conn-{}: error before handshake: {}", conn_id, e);
                return None;
            }
        };

        return match protocol::classify(&text) {
            Ok(Incoming::Control(ControlFrame::Handshake {
                role: Role::Client,
                user_id: Some(user_id),
                client_id,
            })) if !user_id.is_empty() => {
                debug!("conn-{}: handshake from user {}", conn_id, user_id);
                Some(ClientIdentity { user_id, client_id })
            }
            Ok(_) => {
                warn!("conn-{}: expected client handshake, closing", conn_id);
                None
            }
            Err(e) => {
                warn!("conn-{}: invalid handshake, closing: {}", conn_id, e);
                None
            }
        };
    }
}
