//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - A local [`Replica`] edited synchronously and merged with server diffs
//! - An offline queue: local updates are kept until the server's vector
//!   shows them applied, and replayed after every (re)connect
//! - Automatic heartbeats and causal-gap recovery

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::auth::{Role, UserId};
use crate::crdt::{CrdtError, Replica, ReplicaId, Update, VersionVector};
use crate::error::ErrorKind;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::{DocumentId, SessionId};

/// Interval between automatic heartbeats; well inside the server's
/// 15 s timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected {
        session_id: SessionId,
        role: Role,
    },
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    /// Remote state merged into the local replica.
    Synced {
        full: bool,
        text: String,
    },
    Presence(Vec<UserId>),
    Error {
        kind: ErrorKind,
        message: String,
    },
    Flushed {
        durable: bool,
    },
    HeartbeatAck,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Edit(#[from] CrdtError),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue is full")]
    QueueFull,
}

/// Local updates the server has not confirmed yet.
pub struct OfflineQueue {
    queue: VecDeque<Update>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    /// Queue an update for (re)sending. Fails when full.
    pub fn enqueue(&mut self, update: Update) -> bool {
        if self.is_full() {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Forget every update up to and including `seq`.
    pub fn acknowledge(&mut self, seq: u64) {
        while self.queue.front().is_some_and(|u| u.seq <= seq) {
            self.queue.pop_front();
        }
    }

    /// Everything still unconfirmed, oldest first.
    pub fn pending(&self) -> Vec<Update> {
        self.queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// State shared between the client handle and its reader task.
struct Shared {
    replica: Mutex<Replica>,
    pending: Mutex<OfflineQueue>,
    state: RwLock<ConnectionState>,
    events: mpsc::Sender<SyncEvent>,
    /// A causal gap was reported; queued updates go out again once the
    /// next diff has acknowledged what the server kept.
    resyncing: AtomicBool,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Dropping client event: {e}");
        }
    }
}

pub struct SyncClient {
    doc_id: DocumentId,
    server_url: String,
    token: String,
    shared: Arc<Shared>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// `server_url` is the base, e.g. `ws://127.0.0.1:9090`; the client
    /// connects to `{server_url}/docs/{doc_id}`.
    pub fn new(
        replica: impl Into<ReplicaId>,
        doc_id: DocumentId,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let (events, event_rx) = mpsc::channel(256);
        Self {
            doc_id,
            server_url: server_url.into(),
            token: token.into(),
            shared: Arc::new(Shared {
                replica: Mutex::new(Replica::new(replica)),
                pending: Mutex::new(OfflineQueue::new(10_000)),
                state: RwLock::new(ConnectionState::Disconnected),
                events,
                resyncing: AtomicBool::new(false),
            }),
            outgoing_tx: None,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Endpoint for this document with the token percent-encoded.
    pub fn url(&self) -> Result<Url, ClientError> {
        let base = format!("{}/docs/{}", self.server_url.trim_end_matches('/'), self.doc_id);
        let mut url = Url::parse(&base).map_err(|e| ClientError::Connect(format!("{base}: {e}")))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// Connect (or reconnect) and spawn the reader and writer tasks.
    /// Queued updates are replayed once the server welcomes us.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state.write().await;
            *state = match *state {
                ConnectionState::Disconnected => ConnectionState::Connecting,
                _ => ConnectionState::Reconnecting,
            };
        }

        let url = match self.url() {
            Ok(url) => url,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: outgoing channel plus heartbeats.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let weak_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);
        let heartbeat = ClientMessage::Heartbeat.encode()?;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                let data = tokio::select! {
                    next = out_rx.recv() => match next {
                        Some(data) => data,
                        None => break,
                    },
                    _ = ticker.tick() => heartbeat.clone(),
                };
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        // Reader task: merge diffs, surface events. It must not keep the
        // writer alive after `disconnect`.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut closed_with = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => shared.handle(message, &weak_tx).await,
                        Err(e) => log::warn!("Undecodable server message: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        closed_with = frame.map(|f| (u16::from(f.code), f.reason.to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Connection error: {e}");
                        break;
                    }
                }
            }

            *shared.state.write().await = ConnectionState::Disconnected;
            let (code, reason) = match closed_with {
                Some((code, reason)) => (Some(code), reason),
                None => (None, String::new()),
            };
            shared.emit(SyncEvent::Disconnected { code, reason });
        });

        Ok(())
    }

    /// Close the connection. Unconfirmed edits stay queued.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message.encode()?)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn submit(&self, update: Update) -> Result<(), ClientError> {
        if *self.shared.state.read().await == ConnectionState::Connected {
            // A failed send is fine: the update is queued for replay.
            if let Err(e) = self.send(&ClientMessage::Update(update)).await {
                log::debug!("Update kept for replay: {e}");
            }
        }
        Ok(())
    }

    /// Insert `text` at character position `pos`.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<(), ClientError> {
        let update = {
            let mut pending = self.shared.pending.lock().await;
            if pending.is_full() {
                return Err(ClientError::QueueFull);
            }
            let update = self.shared.replica.lock().await.insert(pos, text)?;
            pending.enqueue(update.clone());
            update
        };
        self.submit(update).await
    }

    /// Delete `len` characters starting at `pos`.
    pub async fn delete(&self, pos: usize, len: usize) -> Result<(), ClientError> {
        let update = {
            let mut pending = self.shared.pending.lock().await;
            if pending.is_full() {
                return Err(ClientError::QueueFull);
            }
            let update = self.shared.replica.lock().await.delete(pos, len)?;
            pending.enqueue(update.clone());
            update
        };
        self.submit(update).await
    }

    /// Ask for everything beyond our vector.
    pub async fn request_sync(&self) -> Result<(), ClientError> {
        let vector = self.vector().await;
        self.send(&ClientMessage::SyncRequest { vector }).await
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Heartbeat).await
    }

    /// Ask the server to persist the document now.
    pub async fn flush(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Flush).await
    }

    pub async fn text(&self) -> String {
        self.shared.replica.lock().await.text()
    }

    pub async fn vector(&self) -> VersionVector {
        self.shared.replica.lock().await.vector().clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Shared {
    async fn handle(&self, message: ServerMessage, out: &mpsc::WeakSender<Vec<u8>>) {
        match message {
            ServerMessage::Welcome { session_id, role, .. } => {
                *self.state.write().await = ConnectionState::Connected;
                self.resyncing.store(false, Ordering::Release);
                self.emit(SyncEvent::Connected { session_id, role });
                self.replay(out).await;
            }
            ServerMessage::Diff { diff } => {
                let (confirmed, text) = {
                    let mut replica = self.replica.lock().await;
                    replica.merge(&diff);
                    (diff.vector.get(replica.id()), replica.text())
                };
                self.pending.lock().await.acknowledge(confirmed);
                self.emit(SyncEvent::Synced {
                    full: diff.full,
                    text,
                });
                if self.resyncing.swap(false, Ordering::AcqRel) {
                    self.replay(out).await;
                }
            }
            ServerMessage::Presence { participants } => {
                self.emit(SyncEvent::Presence(participants));
            }
            ServerMessage::Error { kind, message } => {
                log::warn!("Server reported {}: {message}", kind.as_str());
                if kind == ErrorKind::CausalGap {
                    self.resyncing.store(true, Ordering::Release);
                    let vector = self.replica.lock().await.vector().clone();
                    if let (Some(out), Ok(bytes)) =
                        (out.upgrade(), (ClientMessage::SyncRequest { vector }).encode())
                    {
                        let _ = out.send(bytes).await;
                    }
                }
                self.emit(SyncEvent::Error { kind, message });
            }
            ServerMessage::Flushed { durable } => self.emit(SyncEvent::Flushed { durable }),
            ServerMessage::HeartbeatAck => self.emit(SyncEvent::HeartbeatAck),
        }
    }

    /// Resend every update the server has not confirmed. Duplicates are
    /// ignored on the other end.
    async fn replay(&self, out: &mpsc::WeakSender<Vec<u8>>) {
        let queued = self.pending.lock().await.pending();
        let Some(out) = out.upgrade() else {
            return;
        };
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for update in queued {
            if let Ok(bytes) = ClientMessage::Update(update).encode() {
                if out.send(bytes).await.is_err() {
                    break;
                }
            }
        }
    }
}
