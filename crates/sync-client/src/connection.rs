//! Client socket to the sync server.
//!
//! `LiveConnection` is an explicitly constructed handle. `start` spawns a
//! task that connects, exchanges handshakes, and reconnects with backoff
//! until the handle is closed or dropped. While open, the one socket carries
//! both batch RPCs (correlated by request id) and live note updates.
//!
//! Downstream notes and open/close transitions are delivered on the
//! `ConnectionEvent` receiver returned by `start`.

use crate::config::{ClientConfig, ReconnectState};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use sync_core::events::{EventBus, SyncEvent};
use sync_core::protocol::{
    self, ControlFrame, Incoming, LiveUpdate, MAX_MESSAGE_SIZE, Role, RpcCall, RpcResult,
};
use sync_core::transport::{self, LiveTransport, ServiceError, SyncService};
use sync_core::{NoteMetadata, NoteState, NoteUpload, SaveReport, SyncPlan};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReplies = HashMap<u64, oneshot::Sender<transport::Result<RpcResult>>>;

/// State of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connecting and handshaking
    Connecting,
    /// Handshake done, frames flowing
    Open,
    /// Disconnected, waiting to reconnect
    Reconnecting,
    /// Permanently closed (no reconnect)
    Closed,
}

/// Events from the connection task.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened,
    /// A note pushed by the server: another device's live update, or the
    /// authoritative copy after one of ours was rejected.
    Downstream(NoteState),
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the handle and the connection task.
struct Shared {
    config: ClientConfig,
    /// Feeds the socket writer. `Some` only while open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<PendingReplies>,
    next_request_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: Option<Arc<EventBus<SyncEvent>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }
        debug!("Connection to {}: {:?} -> {:?}", self.config.url, previous, state);

        if previous == ConnectionState::Open || state == ConnectionState::Open {
            if let Some(events) = &self.events {
                events.emit(SyncEvent::ConnectionChanged {
                    open: state == ConnectionState::Open,
                });
            }
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        lock(&self.outbound).clone()
    }

    /// Stop accepting frames and fail every in-flight RPC.
    fn disconnect(&self) {
        lock(&self.outbound).take();
        for (_, reply) in lock(&self.pending).drain() {
            let _ = reply.send(Err(ServiceError::Connectivity(
                "connection closed before reply".into(),
            )));
        }
    }

    fn resolve(&self, request_id: u64, result: transport::Result<RpcResult>) {
        match lock(&self.pending).remove(&request_id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!("Reply for unknown or expired request {}", request_id),
        }
    }

    /// Run one open session until the socket closes.
    async fn serve(&self, ws: WsStream, events: &mpsc::UnboundedSender<ConnectionEvent>) {
        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        // Ends once `disconnect` drops the only sender
        let url = self.config.url.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("Write to {} failed: {}", url, e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        *lock(&self.outbound) = Some(outbound);
        self.set_state(ConnectionState::Open);
        info!(
            "Connected to {} as {} (user {})",
            self.config.url, self.config.device_id, self.config.user_id
        );
        let _ = events.send(ConnectionEvent::Opened);

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => self.on_text(text, events),
                Ok(Message::Close(_)) => {
                    debug!("Received close frame from {}", self.config.url);
                    break;
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    debug!("Connection {} closed", self.config.url);
                    break;
                }
                Err(e) => {
                    error!("WebSocket error on {}: {}", self.config.url, e);
                    break;
                }
            }
        }

        self.disconnect();
        let _ = events.send(ConnectionEvent::Closed);
    }

    fn on_text(&self, text: String, events: &mpsc::UnboundedSender<ConnectionEvent>) {
        if text.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds max size ({} > {}), dropping",
                self.config.url,
                text.len(),
                MAX_MESSAGE_SIZE
            );
            return;
        }

        match protocol::classify(&text) {
            Ok(Incoming::Control(ControlFrame::RpcResult { request_id, result })) => {
                self.resolve(request_id, Ok(result));
            }
            Ok(Incoming::Control(ControlFrame::RpcError {
                request_id,
                message,
            })) => {
                self.resolve(request_id, Err(ServiceError::Remote(message)));
            }
            Ok(Incoming::Control(other)) => {
                warn!("Unexpected control frame {:?}, dropping", other);
            }
            Ok(Incoming::Live(raw)) => match protocol::parse_downstream(&raw) {
                Ok(note) => {
                    debug!("Downstream update for {} at {}", note.id, note.vector_clock);
                    let _ = events.send(ConnectionEvent::Downstream(note));
                }
                Err(e) => warn!("Invalid downstream message, dropping: {}", e),
            },
            Err(e) => warn!("Invalid frame from {}, dropping: {}", self.config.url, e),
        }
    }
}

/// Reconnecting socket handle. Implements both `SyncService` and
/// `LiveTransport`.
pub struct LiveConnection {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveConnection {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn start(
        config: ClientConfig,
        events: Option<Arc<EventBus<SyncEvent>>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            config,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            state,
            events,
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Arc::clone(&shared), event_tx));

        let connection = Arc::new(Self {
            shared,
            task: Mutex::new(Some(task)),
        });
        (connection, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Wait until the connection reaches `wanted`.
    pub async fn wait_for(&self, wanted: ConnectionState) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|current| *current == wanted).await;
    }

    /// Close the socket and stop reconnecting. Idempotent.
    pub fn close(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.shared.disconnect();
        self.shared.set_state(ConnectionState::Closed);
    }

    async fn call(&self, call: RpcCall) -> transport::Result<RpcResult> {
        let method = call.name();
        let outbound = self
            .shared
            .sender()
            .ok_or_else(|| ServiceError::Connectivity("not connected".into()))?;

        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, reply_tx);

        if outbound
            .send(ControlFrame::Rpc { request_id, call }.to_json())
            .is_err()
        {
            lock(&self.shared.pending).remove(&request_id);
            return Err(ServiceError::Connectivity("connection closed".into()));
        }
        debug!("Sent {} (request {})", method, request_id);

        let rpc_timeout = self.shared.config.rpc_timeout;
        match timeout(rpc_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServiceError::Connectivity(
                "connection closed before reply".into(),
            )),
            Err(_) => {
                lock(&self.shared.pending).remove(&request_id);
                warn!("{} (request {}) timed out", method, request_id);
                Err(ServiceError::Timeout(rpc_timeout))
            }
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected_reply(method: &str, result: &RpcResult) -> ServiceError {
    let kind = match result {
        RpcResult::SyncPlan(_) => "syncPlan",
        RpcResult::Saved(_) => "saved",
        RpcResult::Purged => "purged",
    };
    ServiceError::Remote(format!("unexpected {} reply to {}", kind, method))
}

#[async_trait]
impl SyncService for LiveConnection {
    async fn get_sync_plan(&self, local_metadata: Vec<NoteMetadata>) -> transport::Result<SyncPlan> {
        match self.call(RpcCall::GetSyncPlan { local_metadata }).await? {
            RpcResult::SyncPlan(plan) => Ok(plan),
            other => Err(unexpected_reply("getSyncPlan", &other)),
        }
    }

    async fn save(&self, notes: Vec<NoteUpload>, client_id: &str) -> transport::Result<SaveReport> {
        let call = RpcCall::Save {
            notes,
            client_id: client_id.to_string(),
        };
        match self.call(call).await? {
            RpcResult::Saved(report) => Ok(report),
            other => Err(unexpected_reply("save", &other)),
        }
    }

    async fn purge(&self) -> transport::Result<()> {
        match self.call(RpcCall::Purge).await? {
            RpcResult::Purged => Ok(()),
            other => Err(unexpected_reply("purge", &other)),
        }
    }
}

#[async_trait]
impl LiveTransport for LiveConnection {
    fn is_open(&self) -> bool {
        lock(&self.shared.outbound).is_some()
    }

    async fn send_update(&self, update: &LiveUpdate) -> transport::Result<()> {
        let outbound = self
            .shared
            .sender()
            .ok_or_else(|| ServiceError::Connectivity("not connected".into()))?;
        outbound
            .send(update.to_json())
            .map_err(|_| ServiceError::Connectivity("connection closed".into()))
    }
}

/// Connect-serve-reconnect loop.
async fn run(shared: Arc<Shared>, events: mpsc::UnboundedSender<ConnectionEvent>) {
    let url = shared.config.url.clone();
    let mut reconnect = ReconnectState::new();

    loop {
        reconnect.record_attempt(Instant::now());
        shared.set_state(ConnectionState::Connecting);

        match connect(&shared.config).await {
            Ok(ws) => {
                reconnect.reset();
                shared.serve(ws, &events).await;
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }
        shared.disconnect();

        if reconnect.exceeded_max_attempts(&shared.config.reconnect) {
            error!(
                "Giving up on {} after {} reconnect attempts",
                url, reconnect.attempts
            );
            shared.set_state(ConnectionState::Closed);
            return;
        }

        let delay = reconnect.schedule_reconnect(Instant::now(), &shared.config.reconnect);
        shared.set_state(ConnectionState::Reconnecting);
        info!(
            "Scheduled reconnect to {} in {:?} (attempt {})",
            url, delay, reconnect.attempts
        );
        sleep(delay).await;
    }
}

/// Open the socket and complete the handshake exchange.
async fn connect(config: &ClientConfig) -> transport::Result<WsStream> {
    let connecting = connect_async(config.url.as_str());
    let (mut ws, _) = timeout(config.rpc_timeout, connecting)
        .await
        .map_err(|_| ServiceError::Timeout(config.rpc_timeout))?
        .map_err(|e| ServiceError::Connectivity(e.to_string()))?;

    let hello = ControlFrame::client_handshake(&config.user_id, config.device_id.as_str());
    ws.send(Message::Text(hello.to_json()))
        .await
        .map_err(|e| ServiceError::Connectivity(e.to_string()))?;

    timeout(config.rpc_timeout, read_server_handshake(&mut ws))
        .await
        .map_err(|_| ServiceError::Timeout(config.rpc_timeout))??;
    Ok(ws)
}

async fn read_server_handshake(ws: &mut WsStream) -> transport::Result<()> {
    while let Some(frame) = ws.next().await {
        let text = match frame.map_err(|e| ServiceError::Connectivity(e.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        return match protocol::classify(&text) {
            Ok(Incoming::Control(ControlFrame::Handshake {
                role: Role::Server, ..
            })) => Ok(()),
            Ok(other) => Err(ServiceError::Connectivity(format!(
                "expected server handshake, got {:?}",
                other
            ))),
            Err(e) => Err(ServiceError::Connectivity(e.to_string())),
        };
    }
    Err(ServiceError::Connectivity(
        "connection closed during handshake".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use std::time::Duration;
    use sync_core::DeviceId;

    /// A ws:// URL nothing listens on.
    fn unreachable_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    fn config(max_attempts: Option<u32>) -> ClientConfig {
        let mut config = ClientConfig::new(unreachable_url(), "alice", DeviceId::generate());
        config.rpc_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            min_spacing: Duration::ZERO,
            max_attempts,
        };
        config
    }

    #[tokio::test]
    async fn test_calls_fail_fast_while_disconnected() {
        let (connection, _events) = LiveConnection::start(config(None), None);

        let err = connection.get_sync_plan(vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connectivity(_)));
        assert!(!connection.is_open());

        connection.close();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (connection, _events) = LiveConnection::start(config(Some(2)), None);

        timeout(
            Duration::from_secs(5),
            connection.wait_for(ConnectionState::Closed),
        )
        .await
        .expect("connection should give up");
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_emits_nothing_when_never_open() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event: &SyncEvent| {
            lock(&seen_clone).push(event.clone());
        });

        let (connection, _rx) = LiveConnection::start(config(None), Some(Arc::clone(&events)));
        connection.close();
        connection.close();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(lock(&seen).is_empty());
    }

    #[tokio::test]
    async fn test_send_update_fails_while_disconnected() {
        let (connection, _events) = LiveConnection::start(config(None), None);
        let update = LiveUpdate {
            client_id: "d1".into(),
            note: NoteState {
                id: "n1".into(),
                vector_clock: Default::default(),
                daily_at: None,
                content: vec![1],
                state_vector: vec![],
            },
        };

        let err = connection.send_update(&update).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connectivity(_)));
    }
}
