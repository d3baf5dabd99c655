//! Client against a real sync-server on a random port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sync_client::{ClientConfig, ConnectionState, ReconnectConfig, SyncClient};
use sync_core::{DeviceId, InMemoryReplica, LocalReplica};
use sync_server::{ServerConfig, SyncServer};
use tokio::time::{sleep, timeout};

async fn start_server_on(addr: &str) -> SocketAddr {
    let listener = SyncServer::bind(addr).await.expect("Failed to bind");
    let local = listener.local_addr().expect("Failed to get local addr");
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    local
}

async fn start_server() -> SocketAddr {
    start_server_on("127.0.0.1:0").await
}

/// An address nothing listens on yet.
fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn config(addr: SocketAddr, user: &str) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://{}", addr), user, DeviceId::generate());
    config.debounce = Duration::from_millis(50);
    config.rpc_timeout = Duration::from_secs(5);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        backoff_factor: 2.0,
        min_spacing: Duration::ZERO,
        max_attempts: None,
    };
    config
}

async fn connected_client(addr: SocketAddr, user: &str) -> (SyncClient, Arc<InMemoryReplica>) {
    let replica = Arc::new(InMemoryReplica::new());
    let client = SyncClient::start(config(addr, user), replica.clone());
    wait_synced(&client).await;
    (client, replica)
}

/// Wait for the connection and for the on-connect batch sync to finish.
async fn wait_synced(client: &SyncClient) {
    wait_open(client).await;
    eventually(|| {
        let done = client.last_sync().is_some();
        async move { done }
    })
    .await;
}

async fn stored_text(replica: &InMemoryReplica, note_id: &str) -> Option<String> {
    let record = replica.find(note_id).await.ok()??;
    sync_core::NoteDocument::decode(&record.content)
        .ok()
        .map(|doc| doc.text())
}

async fn wait_open(client: &SyncClient) {
    timeout(
        Duration::from_secs(5),
        client.connection().wait_for(ConnectionState::Open),
    )
    .await
    .expect("Client did not connect");
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("Condition not met in time");
}

#[tokio::test]
async fn test_batch_sync_moves_notes_between_devices() {
    let addr = start_server().await;
    let (a, _) = connected_client(addr, "alice").await;
    let (b, replica_b) = connected_client(addr, "alice").await;

    a.create_note("n1", "# Hello\n").await.unwrap();
    let report = a.sync_now().await.unwrap();
    assert_eq!(report.uploaded, vec!["n1".to_string()]);
    assert!(a.last_sync().is_some());

    b.sync_now().await.unwrap();
    let stored = replica_b.get("n1").await.unwrap();
    assert_eq!(stored.title, "Hello");
    assert_eq!(stored.vector_clock.get(a.device().as_str()), 0);
}

#[tokio::test]
async fn test_live_edit_reaches_other_device() {
    let addr = start_server().await;
    let (a, _) = connected_client(addr, "alice").await;
    let (b, replica_b) = connected_client(addr, "alice").await;

    a.create_note("n1", "# Shared\n").await.unwrap();
    a.sync_now().await.unwrap();
    b.sync_now().await.unwrap();

    let channel_a = a.open_note("n1").await.unwrap();
    let channel_b = b.open_note("n1").await.unwrap();

    channel_a
        .document()
        .edit_body("# Shared\nfrom a\n")
        .unwrap();

    let doc_b = Arc::clone(channel_b.document());
    eventually(|| {
        let doc_b = Arc::clone(&doc_b);
        async move { doc_b.text() == "# Shared\nfrom a\n" }
    })
    .await;

    let device_a = a.device().as_str().to_string();
    eventually(|| {
        let replica_b = Arc::clone(&replica_b);
        let device_a = device_a.clone();
        async move {
            replica_b
                .get("n1")
                .await
                .map(|record| record.vector_clock.get(&device_a) == 1)
                .unwrap_or(false)
        }
    })
    .await;
}

#[tokio::test]
async fn test_live_note_without_open_channel_lands_in_replica() {
    let addr = start_server().await;
    let (a, _) = connected_client(addr, "alice").await;
    let (_b, replica_b) = connected_client(addr, "alice").await;

    let channel = a.open_note("fresh").await.unwrap();
    channel.document().edit_body("# Pushed live").unwrap();

    eventually(|| {
        let replica_b = Arc::clone(&replica_b);
        async move {
            matches!(replica_b.find("fresh").await, Ok(Some(record)) if record.title == "Pushed live")
        }
    })
    .await;
}

#[tokio::test]
async fn test_other_users_do_not_receive_updates() {
    let addr = start_server().await;
    let (a, _) = connected_client(addr, "alice").await;
    let (_bob, bob_replica) = connected_client(addr, "bob").await;

    let channel = a.open_note("n1").await.unwrap();
    channel.document().edit_body("private").unwrap();
    channel.flush().await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(bob_replica.is_empty());
}

#[tokio::test]
async fn test_reconnects_when_server_comes_up() {
    let addr = free_addr();
    let replica = Arc::new(InMemoryReplica::new());
    let client = SyncClient::start(config(addr, "alice"), replica.clone());

    sleep(Duration::from_millis(200)).await;
    assert_ne!(client.connection().state(), ConnectionState::Open);

    start_server_on(&addr.to_string()).await;
    wait_open(&client).await;
}

#[tokio::test]
async fn test_offline_edits_are_uploaded_after_connect() {
    let addr = free_addr();
    let replica = Arc::new(InMemoryReplica::new());
    let offline = SyncClient::start(config(addr, "alice"), replica.clone());

    offline.create_note("n1", "# Draft\n").await.unwrap();
    let channel = offline.open_note("n1").await.unwrap();
    channel
        .document()
        .edit_body("# Draft\nwritten offline\n")
        .unwrap();
    channel.flush().await.unwrap();
    assert_eq!(
        replica.get("n1").await.unwrap().vector_clock.get(offline.device().as_str()),
        1
    );

    // The on-connect batch sync uploads the note
    start_server_on(&addr.to_string()).await;
    wait_open(&offline).await;

    let (other, other_replica) = connected_client(addr, "alice").await;
    eventually(|| {
        let other_replica = Arc::clone(&other_replica);
        let other = &other;
        async move {
            if other.sync_now().await.is_err() {
                return false;
            }
            match other_replica.find("n1").await {
                Ok(Some(record)) => {
                    sync_core::NoteDocument::decode(&record.content)
                        .map(|doc| doc.text() == "# Draft\nwritten offline\n")
                        .unwrap_or(false)
                }
                _ => false,
            }
        }
    })
    .await;
}

#[tokio::test]
async fn test_purge_clears_server_copy() {
    let addr = start_server().await;
    let (a, _) = connected_client(addr, "alice").await;

    a.create_note("n1", "# Gone soon").await.unwrap();
    a.sync_now().await.unwrap();
    a.purge_remote().await.unwrap();
    assert!(a.last_sync().is_none());

    let (b, replica_b) = connected_client(addr, "alice").await;
    let report = b.sync_now().await.unwrap();
    assert!(report.created.is_empty());
    assert!(replica_b.is_empty());
}

#[tokio::test]
async fn test_live_edit_after_batch_upload_reaches_returning_device() {
    let addr = free_addr();
    let replica_a = Arc::new(InMemoryReplica::new());
    let a = SyncClient::start(config(addr, "alice"), replica_a.clone());

    // Offline edit, kept locally
    a.create_note("n1", "# Draft\n").await.unwrap();
    let channel = a.open_note("n1").await.unwrap();
    channel.document().edit_body("# Draft\nv1\n").unwrap();
    channel.flush().await.unwrap();
    let offline_clock = replica_a.get("n1").await.unwrap().vector_clock;

    // The on-connect batch sync uploads it
    start_server_on(&addr.to_string()).await;
    wait_synced(&a).await;

    // Device C picks up v1, then goes away
    let config_c = config(addr, "alice");
    let replica_c = Arc::new(InMemoryReplica::new());
    let c = SyncClient::start(config_c.clone(), replica_c.clone());
    wait_synced(&c).await;
    eventually(|| {
        let c = &c;
        let replica_c = Arc::clone(&replica_c);
        async move {
            let _ = c.sync_now().await;
            stored_text(&replica_c, "n1").await.as_deref() == Some("# Draft\nv1\n")
        }
    })
    .await;
    assert_eq!(replica_c.get("n1").await.unwrap().vector_clock, offline_clock);
    c.shutdown().await;

    // A keeps typing online
    channel.document().edit_body("# Draft\nv1\nv2\n").unwrap();
    assert!(channel.flush().await.unwrap());
    let pushed = channel.server_known();
    assert!(offline_clock.only_advanced_by(&pushed, a.device().as_str()));

    // C comes back and catches up through batch sync alone
    let c = SyncClient::start(config_c, replica_c.clone());
    wait_synced(&c).await;
    eventually(|| {
        let c = &c;
        let replica_c = Arc::clone(&replica_c);
        async move {
            let _ = c.sync_now().await;
            stored_text(&replica_c, "n1").await.as_deref() == Some("# Draft\nv1\nv2\n")
        }
    })
    .await;
}

#[tokio::test]
async fn test_purge_all_clears_both_sides() {
    let addr = start_server().await;
    let (a, replica_a) = connected_client(addr, "alice").await;

    a.create_note("n1", "# Everything goes").await.unwrap();
    a.sync_now().await.unwrap();
    let channel = a.open_note("n1").await.unwrap();

    a.purge_all().await.unwrap();
    assert!(replica_a.is_empty());
    assert!(a.router().is_empty());
    assert!(channel.is_destroyed());

    let (b, replica_b) = connected_client(addr, "alice").await;
    b.sync_now().await.unwrap();
    assert!(replica_b.is_empty());
}
