//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use quire_sync::auth::{AccessRule, HmacTokenVerifier, Role, StaticAccessOracle, UserId};
use quire_sync::client::{ConnectionState, SyncClient, SyncEvent};
use quire_sync::crdt::VersionVector;
use quire_sync::error::ErrorKind;
use quire_sync::protocol::{ClientMessage, ServerMessage};
use quire_sync::server::{HealthStatus, ServerError, SyncServer};
use quire_sync::storage::{MemoryStore, StateStore, StoreError, StoredDocument};
use quire_sync::{DocumentId, ServerConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const SECRET: &str = "integration-secret";

struct TestServer {
    server: Arc<SyncServer>,
    port: u16,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        token_secret: SECRET.into(),
        // Tests drive flush cycles by hand.
        flush_interval_secs: 3600,
        save_attempts: 1,
        save_backoff_ms: 1,
        ..ServerConfig::default()
    }
}

/// alice owns `doc`, bob edits it, vic only reads it.
fn oracle(doc: DocumentId) -> StaticAccessOracle {
    StaticAccessOracle::new([AccessRule {
        document: doc,
        owner: UserId::new("alice"),
        collaborators: HashMap::from([
            (UserId::new("bob"), Role::Editor),
            (UserId::new("vic"), Role::Viewer),
        ]),
    }])
}

/// Start a server on a free port.
async fn start_test_server(
    config: ServerConfig,
    store: Arc<dyn StateStore>,
    doc: DocumentId,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::with_components(
        config,
        store,
        Arc::new(HmacTokenVerifier::new(SECRET).unwrap()),
        Arc::new(oracle(doc)),
    ));
    let handle = tokio::spawn(server.clone().serve(listener));
    TestServer {
        server,
        port,
        handle,
    }
}

fn token(user: &str) -> String {
    HmacTokenVerifier::new(SECRET)
        .unwrap()
        .issue_for(&UserId::new(user), 3600)
}

/// Connect a client and wait for the server's welcome.
async fn connect(
    server: &TestServer,
    doc: DocumentId,
    user: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(user, doc, server.url(), token(user));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    (client, events)
}

async fn wait_for_event(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event within timeout")
}

async fn wait_for_text(client: &SyncClient, expected: &str) {
    let reached = timeout(Duration::from_secs(5), async {
        while client.text().await != expected {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "expected {expected:?}, have {:?}",
        client.text().await
    );
}

async fn wait_for_server_text(server: &TestServer, doc: DocumentId, expected: &str) {
    let reached = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(room) = server.server.documents().get(&doc).await {
                if room.engine().await.text() == expected {
                    return;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "server never reached {expected:?}");
}

type RawSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn raw_connect(server: &TestServer, doc: DocumentId, token: &str) -> RawSocket {
    let url = format!("{}/docs/{doc}?token={token}", server.url());
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Read until the close frame; returns its code and every data message
/// seen before it.
async fn read_until_close(ws: &mut RawSocket) -> (Option<u16>, Vec<ServerMessage>) {
    let mut seen = Vec::new();
    let code = timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => seen.push(ServerMessage::decode(&data).unwrap()),
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .expect("connection should close within timeout");
    (code, seen)
}

#[tokio::test]
async fn test_insert_propagates_to_peer() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _alice_events) = connect(&server, doc, "alice").await;
    let (bob, mut bob_events) = connect(&server, doc, "bob").await;
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    alice.insert(0, "Hello").await.unwrap();

    let event = wait_for_event(&mut bob_events, |e| {
        matches!(e, SyncEvent::Synced { text, .. } if text == "Hello")
    })
    .await;
    assert!(matches!(event, SyncEvent::Synced { full: false, .. }));
    assert_eq!(bob.text().await, "Hello");
    wait_for_server_text(&server, doc, "Hello").await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _events) = connect(&server, doc, "alice").await;
    alice.insert(0, "Hello").await.unwrap();
    alice.insert(5, ", world").await.unwrap();
    wait_for_server_text(&server, doc, "Hello, world").await;

    let (bob, _bob_events) = connect(&server, doc, "bob").await;
    wait_for_text(&bob, "Hello, world").await;
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _a) = connect(&server, doc, "alice").await;
    let (bob, _b) = connect(&server, doc, "bob").await;
    alice.insert(0, "base").await.unwrap();
    wait_for_text(&bob, "base").await;

    // Both edit the same position without seeing each other.
    let (a, b) = tokio::join!(alice.insert(0, "A"), bob.insert(0, "B"));
    a.unwrap();
    b.unwrap();

    let converged = timeout(Duration::from_secs(5), async {
        loop {
            let (ta, tb) = (alice.text().await, bob.text().await);
            if ta == tb && ta.len() == 6 {
                return ta;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replicas should converge");

    assert!(converged == "ABbase" || converged == "BAbase");
    wait_for_server_text(&server, doc, &converged).await;
}

#[tokio::test]
async fn test_deletes_propagate() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _a) = connect(&server, doc, "alice").await;
    let (bob, _b) = connect(&server, doc, "bob").await;
    alice.insert(0, "Hello, world").await.unwrap();
    wait_for_text(&bob, "Hello, world").await;

    bob.delete(5, 7).await.unwrap();
    wait_for_text(&alice, "Hello").await;
}

#[tokio::test]
async fn test_sole_writer_history_is_collected() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _a) = connect(&server, doc, "alice").await;
    alice.insert(0, "scratch").await.unwrap();
    alice.delete(0, 7).await.unwrap();
    wait_for_server_text(&server, doc, "").await;

    // The writer's own delete counts as seen without any reply from us.
    let expected = VersionVector::from([("alice", 2)]);
    let observed = timeout(Duration::from_secs(5), async {
        loop {
            if server.server.sessions().stable_vector(&doc).await.as_ref() == Some(&expected) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(observed.is_ok(), "session vector never covered its own edits");

    server.server.flush_cycle().await;
    let room = server.server.documents().get(&doc).await.unwrap();
    let engine = room.engine().await;
    assert_eq!(engine.state().horizon(), &expected);
    assert_eq!(engine.state().tombstone_count(), 7);
    assert_eq!(engine.text(), "");
}

#[tokio::test]
async fn test_invalid_token_closes_without_data() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let mut ws = raw_connect(&server, doc, "not-a-token").await;
    let (code, seen) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(4001));
    assert!(seen.is_empty(), "no document data before auth: {seen:?}");

    let health = server.server.health().await;
    assert_eq!(health.total_session_count, 0);
    assert_eq!(health.active_document_count, 0);
    assert_eq!(server.server.stats().await.refused_connections, 1);
}

#[tokio::test]
async fn test_forged_token_is_rejected() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let forged = HmacTokenVerifier::new("some-other-secret")
        .unwrap()
        .issue_for(&UserId::new("alice"), 3600);
    let mut ws = raw_connect(&server, doc, &forged).await;
    assert_eq!(read_until_close(&mut ws).await.0, Some(4001));
}

#[tokio::test]
async fn test_unknown_user_is_forbidden() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let mut ws = raw_connect(&server, doc, &token("mallory")).await;
    let (code, seen) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(4003));
    assert!(seen.is_empty());
}

#[tokio::test]
async fn test_collaborator_cannot_create_document() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let mut ws = raw_connect(&server, doc, &token("bob")).await;
    assert_eq!(read_until_close(&mut ws).await.0, Some(4004));
    assert_eq!(server.server.health().await.active_document_count, 0);
}

#[tokio::test]
async fn test_viewer_is_read_only() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _a) = connect(&server, doc, "alice").await;
    alice.insert(0, "mine").await.unwrap();
    let (vic, mut vic_events) = connect(&server, doc, "vic").await;
    wait_for_text(&vic, "mine").await;

    vic.insert(0, "x").await.unwrap();
    let event = wait_for_event(&mut vic_events, |e| matches!(e, SyncEvent::Error { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::Error {
            kind: ErrorKind::ReadOnly,
            ..
        }
    ));

    // Still attached, document untouched.
    vic.heartbeat().await.unwrap();
    wait_for_event(&mut vic_events, |e| matches!(e, SyncEvent::HeartbeatAck)).await;
    wait_for_server_text(&server, doc, "mine").await;
    assert_eq!(alice.text().await, "mine");
}

#[tokio::test]
async fn test_session_capacity() {
    let doc = Uuid::new_v4();
    let config = ServerConfig {
        max_sessions_per_document: 2,
        ..test_config()
    };
    let server = start_test_server(config, Arc::new(MemoryStore::new()), doc).await;

    let (_alice, _a) = connect(&server, doc, "alice").await;
    let (_bob, _b) = connect(&server, doc, "bob").await;

    let mut ws = raw_connect(&server, doc, &token("vic")).await;
    let (code, seen) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(4029));
    assert!(matches!(
        seen.as_slice(),
        [ServerMessage::Error {
            kind: ErrorKind::Capacity,
            ..
        }]
    ));
    assert_eq!(server.server.sessions().session_count(&doc).await, 2);
}

#[tokio::test]
async fn test_presence_tracks_participants() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (_alice, mut alice_events) = connect(&server, doc, "alice").await;
    let (mut bob, _b) = connect(&server, doc, "bob").await;

    let both = vec![UserId::new("alice"), UserId::new("bob")];
    wait_for_event(&mut alice_events, |e| *e == SyncEvent::Presence(both.clone())).await;

    bob.disconnect();
    let alone = vec![UserId::new("alice")];
    wait_for_event(&mut alice_events, |e| *e == SyncEvent::Presence(alone.clone())).await;
}

#[tokio::test]
async fn test_malformed_messages_close_connection() {
    let doc = Uuid::new_v4();
    let config = ServerConfig {
        max_malformed_messages: 2,
        ..test_config()
    };
    let server = start_test_server(config, Arc::new(MemoryStore::new()), doc).await;

    let mut ws = raw_connect(&server, doc, &token("alice")).await;
    ws.send(Message::Binary(vec![0xff, 0xff, 0xff].into()))
        .await
        .unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();

    let (code, seen) = read_until_close(&mut ws).await;
    assert_eq!(code, Some(1002));
    let errors = seen
        .iter()
        .filter(|m| {
            matches!(
                m,
                ServerMessage::Error {
                    kind: ErrorKind::MalformedMessage,
                    ..
                }
            )
        })
        .count();
    assert_eq!(errors, 2);
}

#[tokio::test]
async fn test_idle_session_is_pruned() {
    let doc = Uuid::new_v4();
    let config = ServerConfig {
        heartbeat_timeout_secs: 1,
        prune_interval_secs: 1,
        ..test_config()
    };
    let server = start_test_server(config, Arc::new(MemoryStore::new()), doc).await;

    let (alice, mut alice_events) = connect(&server, doc, "alice").await;
    let alice = Arc::new(alice);
    alice.insert(0, "keep").await.unwrap();
    wait_for_server_text(&server, doc, "keep").await;

    let beating = alice.clone();
    let heartbeat = tokio::spawn(async move {
        loop {
            let _ = beating.heartbeat().await;
            sleep(Duration::from_millis(200)).await;
        }
    });

    // Bob goes silent after the handshake.
    let mut silent = raw_connect(&server, doc, &token("bob")).await;
    let (code, _) = read_until_close(&mut silent).await;
    assert_eq!(code, Some(4010));

    let alone = vec![UserId::new("alice")];
    wait_for_event(&mut alice_events, |e| *e == SyncEvent::Presence(alone.clone())).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);
    assert_eq!(server.server.sessions().session_count(&doc).await, 1);
    wait_for_server_text(&server, doc, "keep").await;

    heartbeat.abort();
}

#[tokio::test]
async fn test_sync_request_returns_missing_ops() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (alice, _a) = connect(&server, doc, "alice").await;
    alice.insert(0, "abc").await.unwrap();
    wait_for_server_text(&server, doc, "abc").await;

    let mut ws = raw_connect(&server, doc, &token("bob")).await;
    let request = ClientMessage::SyncRequest {
        vector: Default::default(),
    };
    ws.send(Message::Binary(request.encode().unwrap().into()))
        .await
        .unwrap();

    // Welcome, full state, presence, then the answer to the request.
    let answered = timeout(Duration::from_secs(5), async {
        let mut diffs = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if let ServerMessage::Diff { diff } = ServerMessage::decode(&data).unwrap() {
                    assert!(!diff.is_empty());
                    diffs += 1;
                    if diffs == 2 {
                        return;
                    }
                }
            }
        }
    })
    .await;
    assert!(answered.is_ok());
}

/// Store that refuses the first `failures` saves.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

impl StateStore for FlakyStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.load(id)
    }

    fn save(&self, id: DocumentId, doc: &StoredDocument) -> Result<(), StoreError> {
        let down = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        self.inner.save(id, doc)
    }

    fn delete(&self, id: DocumentId) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.inner.list()
    }
}

#[tokio::test]
async fn test_edits_survive_storage_outage() {
    let doc = Uuid::new_v4();
    let store = Arc::new(FlakyStore::new(3));
    let server = start_test_server(test_config(), store.clone(), doc).await;

    let (alice, mut alice_events) = connect(&server, doc, "alice").await;
    let (bob, _b) = connect(&server, doc, "bob").await;
    alice.insert(0, "draft").await.unwrap();
    wait_for_server_text(&server, doc, "draft").await;

    for _ in 0..3 {
        let report = server.server.flush_cycle().await;
        assert_eq!(report.failed, vec![doc]);
        assert_eq!(server.server.health().await.status, HealthStatus::Degraded);
    }

    // Editing keeps working while saves fail.
    bob.insert(5, "!").await.unwrap();
    wait_for_text(&alice, "draft!").await;
    assert!(store.inner.load(doc).unwrap().is_none());

    let report = server.server.flush_cycle().await;
    assert_eq!(report.flushed, 1);
    assert!(report.failed.is_empty());
    assert_eq!(server.server.health().await.status, HealthStatus::Ok);
    let saved = store.inner.load(doc).unwrap().unwrap();
    assert_eq!(saved.state.render(), "draft!");

    alice.flush().await.unwrap();
    wait_for_event(&mut alice_events, |e| *e == SyncEvent::Flushed { durable: true }).await;
}

#[tokio::test]
async fn test_last_detach_flushes() {
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let server = start_test_server(test_config(), store.clone(), doc).await;

    let (mut alice, mut events) = connect(&server, doc, "alice").await;
    alice.insert(0, "saved on leave").await.unwrap();
    wait_for_server_text(&server, doc, "saved on leave").await;
    alice.disconnect();
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;

    let saved = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(doc) = store.load(doc).unwrap() {
                return doc;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("document saved after last session left");
    assert_eq!(saved.state.render(), "saved on leave");
}

#[tokio::test]
async fn test_offline_edits_replay_on_reconnect() {
    let doc = Uuid::new_v4();
    let server = start_test_server(test_config(), Arc::new(MemoryStore::new()), doc).await;

    let (mut alice, mut alice_events) = connect(&server, doc, "alice").await;
    let (bob, _b) = connect(&server, doc, "bob").await;
    alice.insert(0, "on").await.unwrap();
    wait_for_text(&bob, "on").await;

    alice.disconnect();
    wait_for_event(&mut alice_events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;
    alice.insert(2, "line").await.unwrap();
    assert!(alice.pending_len().await >= 1);

    alice.connect().await.unwrap();
    wait_for_event(&mut alice_events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    wait_for_text(&bob, "online").await;
    wait_for_text(&alice, "online").await;
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let server = start_test_server(test_config(), store.clone(), doc).await;

    let (alice, mut events) = connect(&server, doc, "alice").await;
    alice.insert(0, "last words").await.unwrap();
    wait_for_server_text(&server, doc, "last words").await;

    let report = server.server.shutdown().await;
    assert!(report.failed.is_empty());

    let event = wait_for_event(&mut events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Disconnected {
            code: Some(1001),
            reason: "server shutting down".into()
        }
    );
    let stored = store.load(doc).unwrap().unwrap();
    assert_eq!(stored.state.render(), "last words");

    let finished = timeout(Duration::from_secs(10), server.handle).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
}
