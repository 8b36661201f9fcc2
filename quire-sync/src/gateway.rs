//! Connection gateway: one task per WebSocket connection.
//!
//! ```text
//! Connecting ─► Authenticating ─► Authorizing ─► Attached ─► Closing ─► Closed
//!      │               │ 4001           │ 4003/4004    │ 1001/1002/4010
//!      └── timeout ────┴── 4008 ────────┘              │
//!                                                      └─ deregister, detach,
//!                                                         flush on last detach
//! ```
//!
//! No document state is read or sent before both the token and the
//! access verdict check out. Once attached, the connection multiplexes
//! four sources: inbound frames, the document's broadcast channel, the
//! session's prune notifier and the server shutdown signal.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::form_urlencoded;
use uuid::Uuid;

use crate::auth::{Access, AccessOracle, AuthError, Role, TokenVerifier, UserId};
use crate::broadcast::Frame;
use crate::crdt::Update;
use crate::documents::{DocumentRegistry, DocumentRoom};
use crate::error::{close, ErrorKind, SyncError};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{Session, SessionRegistry};
use crate::{DocumentId, SessionId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authorizing,
    Attached,
    Closing,
    Closed,
}

/// Connection-level counters, lock-free.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    refused: AtomicU64,
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl ConnectionCounters {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Everything a connection needs from the server.
pub struct GatewayContext {
    pub documents: Arc<DocumentRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub oracle: Arc<dyn AccessOracle>,
    /// Bound on the upgrade, and separately on authentication plus
    /// authorization.
    pub auth_timeout: Duration,
    pub max_malformed: u32,
    pub counters: ConnectionCounters,
}

/// What the upgrade request told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub document: Option<DocumentId>,
    pub token: Option<String>,
}

impl Handshake {
    /// Document id from the last path segment; token from `?token=`,
    /// falling back to `Authorization: Bearer`.
    pub fn from_request(req: &Request) -> Self {
        let uri = req.uri();
        let document = uri
            .path()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|segment| Uuid::parse_str(segment).ok());

        let token = uri
            .query()
            .and_then(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .find(|(k, _)| k == "token")
                    .map(|(_, v)| v.into_owned())
            })
            .or_else(|| {
                let value = req.headers().get("authorization")?.to_str().ok()?;
                let (scheme, token) = value.split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("bearer")
                    .then(|| token.trim().to_string())
            })
            .filter(|t| !t.is_empty());

        Self { document, token }
    }
}

enum Exit {
    /// Peer went away or the socket failed.
    Disconnected,
    Close(u16, &'static str),
}

/// Per-session state while attached.
struct Attachment {
    session: SessionId,
    user: UserId,
    role: Role,
    room: Arc<DocumentRoom>,
    malformed: u32,
}

struct Connection {
    addr: SocketAddr,
    state: ConnectionState,
    ctx: Arc<GatewayContext>,
}

/// Drive one accepted TCP stream through its whole lifetime.
pub async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    shutdown: watch::Receiver<bool>,
) {
    ctx.counters.total.fetch_add(1, Ordering::Relaxed);
    ctx.counters.active.fetch_add(1, Ordering::Relaxed);
    let counters_ctx = ctx.clone();

    let conn = Connection {
        addr,
        state: ConnectionState::Connecting,
        ctx,
    };
    conn.run(stream, shutdown).await;

    counters_ctx.counters.active.fetch_sub(1, Ordering::Relaxed);
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        log::trace!("{}: {:?} -> {next:?}", self.addr, self.state);
        self.state = next;
    }

    async fn run(mut self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let mut handshake = Handshake::default();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            handshake = Handshake::from_request(req);
            Ok(resp)
        };
        let ws = match timeout(
            self.ctx.auth_timeout,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                log::debug!("WebSocket upgrade from {} failed: {e}", self.addr);
                return;
            }
            Err(_) => {
                log::debug!("WebSocket upgrade from {} timed out", self.addr);
                return;
            }
        };
        let (mut sink, mut source) = ws.split();

        let deadline = Instant::now() + self.ctx.auth_timeout;
        let admitted = timeout_at(deadline, self.admit(&handshake))
            .await
            .unwrap_or(Err(SyncError::Timeout("authentication")));
        let (user, document, access) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => return self.refuse(&mut sink, &e, false).await,
        };

        let room = match self.ctx.documents.attach(document, access.may_create()).await {
            Ok(room) => room,
            Err(e) => return self.refuse(&mut sink, &e, false).await,
        };
        let role = access.role().unwrap_or(Role::Viewer);
        let session = Session::new(user.clone(), document, role);
        let session_id = session.id;
        let evicted = match self.ctx.sessions.register(session).await {
            Ok(evicted) => evicted,
            Err(e) => {
                self.release(&room).await;
                return self.refuse(&mut sink, &e, true).await;
            }
        };
        self.transition(ConnectionState::Attached);

        let mut link = Attachment {
            session: session_id,
            user,
            role,
            room,
            malformed: 0,
        };
        let exit = match self.greet(&mut sink, &link).await {
            ControlFlow::Continue(mut rx) => {
                log::info!(
                    "{} ({:?}) attached to doc {document} from {}",
                    link.user,
                    link.role,
                    self.addr
                );
                self.announce(&link.room, document).await;
                if *shutdown.borrow() {
                    Exit::Close(close::GOING_AWAY, "server shutting down")
                } else {
                    self.pump(&mut sink, &mut source, &mut rx, &mut link, &evicted, &mut shutdown)
                        .await
                }
            }
            ControlFlow::Break(exit) => exit,
        };

        self.transition(ConnectionState::Closing);
        if let Exit::Close(code, reason) = exit {
            close_with(&mut sink, code, reason).await;
        }
        let _ = sink.close().await;

        self.ctx.sessions.deregister(&link.session).await;
        self.release(&link.room).await;
        self.announce(&link.room, document).await;
        log::info!("{} detached from doc {document}", link.user);
        self.transition(ConnectionState::Closed);
    }

    /// Authenticate, then authorize.
    async fn admit(&mut self, handshake: &Handshake) -> Result<(UserId, DocumentId, Access), SyncError> {
        self.transition(ConnectionState::Authenticating);
        let token = handshake
            .token
            .as_deref()
            .ok_or_else(|| SyncError::Authentication(AuthError::Missing.to_string()))?;
        let user = self
            .ctx
            .verifier
            .verify(token)
            .await
            .map_err(|e| SyncError::Authentication(e.to_string()))?;

        self.transition(ConnectionState::Authorizing);
        let document = handshake
            .document
            .ok_or_else(|| SyncError::MalformedMessage("path does not end in a document id".into()))?;
        let access = self.ctx.oracle.authorize(&user, document).await;
        if access.role().is_none() {
            return Err(SyncError::Authorization { user, document });
        }
        Ok((user, document, access))
    }

    /// Close a connection that never got attached.
    async fn refuse(&mut self, sink: &mut WsSink, err: &SyncError, notify: bool) {
        self.ctx.counters.refused.fetch_add(1, Ordering::Relaxed);
        log::info!("Refusing {} ({:?}): {err}", self.addr, self.state);
        self.transition(ConnectionState::Closing);
        if notify {
            let _ = send(sink, &ServerMessage::error(err.kind(), err.to_string())).await;
        }
        let code = err.close_code().unwrap_or(match err.kind() {
            ErrorKind::MalformedMessage => close::PROTOCOL,
            _ => close::INTERNAL,
        });
        close_with(sink, code, err.close_reason()).await;
        let _ = sink.close().await;
        self.transition(ConnectionState::Closed);
    }

    /// Count the session out of its room, flushing after the last one.
    async fn release(&self, room: &DocumentRoom) {
        if self.ctx.documents.detach(room) {
            if let Err(e) = room.flush(self.ctx.documents.bridge()).await {
                log::error!("Flush of doc {} on last detach failed: {e}", room.id());
            }
        }
    }

    async fn announce(&self, room: &DocumentRoom, document: DocumentId) {
        let participants = self.ctx.sessions.presence(&document).await;
        if let Err(e) = room.broadcast().presence(participants) {
            log::error!("Presence broadcast for doc {document} failed: {e}");
        }
    }

    /// Welcome plus full state. Subscribing under the engine lock means
    /// every later diff reaches this session.
    async fn greet(
        &mut self,
        sink: &mut WsSink,
        link: &Attachment,
    ) -> ControlFlow<Exit, broadcast::Receiver<Frame>> {
        let (rx, snapshot) = {
            let engine = link.room.engine().await;
            (link.room.broadcast().subscribe(), engine.full_snapshot())
        };
        self.ctx.sessions.observe(&link.session, &snapshot.vector).await;

        let welcome = ServerMessage::Welcome {
            session_id: link.session,
            user_id: link.user.clone(),
            role: link.role,
        };
        send(sink, &welcome).await?;
        send(sink, &ServerMessage::Diff { diff: snapshot }).await?;
        ControlFlow::Continue(rx)
    }

    async fn pump(
        &mut self,
        sink: &mut WsSink,
        source: &mut WsSource,
        rx: &mut broadcast::Receiver<Frame>,
        link: &mut Attachment,
        evicted: &Notify,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        loop {
            let step = tokio::select! {
                _ = evicted.notified() => {
                    log::info!("{} on {} pruned after silence", link.user, self.addr);
                    ControlFlow::Break(Exit::Close(close::IDLE, "idle timeout"))
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        ControlFlow::Break(Exit::Close(close::GOING_AWAY, "server shutting down"))
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                frame = rx.recv() => self.forward(sink, link, frame).await,
                inbound = source.next() => match inbound {
                    Some(Ok(msg)) => self.inbound(sink, link, msg).await,
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {}: {e}", self.addr);
                        ControlFlow::Break(Exit::Disconnected)
                    }
                    None => ControlFlow::Break(Exit::Disconnected),
                },
            };
            if let ControlFlow::Break(exit) = step {
                return exit;
            }
        }
    }

    async fn forward(
        &mut self,
        sink: &mut WsSink,
        link: &Attachment,
        frame: Result<Frame, RecvError>,
    ) -> ControlFlow<Exit> {
        match frame {
            Ok(frame) if !frame.is_for(&link.session) => ControlFlow::Continue(()),
            Ok(Frame::Diff { bytes, .. }) | Ok(Frame::Presence { bytes }) => {
                send_bytes(sink, &bytes).await
            }
            Ok(Frame::Resync { notice, .. }) => {
                if let Some(notice) = notice {
                    send_bytes(sink, &notice).await?;
                }
                self.send_full(sink, link).await
            }
            Err(RecvError::Lagged(skipped)) => {
                link.room.broadcast().record_lag(skipped);
                log::warn!(
                    "{} on doc {} lagged {skipped} frames, resending full state",
                    link.user,
                    link.room.id()
                );
                self.send_full(sink, link).await
            }
            Err(RecvError::Closed) => ControlFlow::Break(Exit::Close(close::INTERNAL, "internal")),
        }
    }

    async fn send_full(&self, sink: &mut WsSink, link: &Attachment) -> ControlFlow<Exit> {
        let snapshot = link.room.engine().await.full_snapshot();
        self.ctx.sessions.observe(&link.session, &snapshot.vector).await;
        send(sink, &ServerMessage::Diff { diff: snapshot }).await
    }

    async fn inbound(&mut self, sink: &mut WsSink, link: &mut Attachment, msg: Message) -> ControlFlow<Exit> {
        self.ctx.counters.messages.fetch_add(1, Ordering::Relaxed);
        self.ctx.counters.bytes.fetch_add(msg.len() as u64, Ordering::Relaxed);
        self.ctx.sessions.heartbeat(&link.session).await;

        match msg {
            Message::Binary(data) => match ClientMessage::decode(&data) {
                Ok(message) => self.dispatch(sink, link, message).await,
                Err(e) => self.violation(sink, link, e.to_string()).await,
            },
            Message::Text(_) => {
                self.violation(sink, link, ProtocolError::TextFrame.to_string())
                    .await
            }
            Message::Close(_) => ControlFlow::Break(Exit::Disconnected),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => ControlFlow::Continue(()),
        }
    }

    async fn violation(&mut self, sink: &mut WsSink, link: &mut Attachment, detail: String) -> ControlFlow<Exit> {
        link.malformed += 1;
        log::warn!(
            "Malformed message from {} ({}/{}): {detail}",
            link.user,
            link.malformed,
            self.ctx.max_malformed
        );
        send(sink, &ServerMessage::error(ErrorKind::MalformedMessage, detail)).await?;
        if link.malformed >= self.ctx.max_malformed {
            return ControlFlow::Break(Exit::Close(close::PROTOCOL, "malformed_message"));
        }
        ControlFlow::Continue(())
    }

    async fn dispatch(
        &mut self,
        sink: &mut WsSink,
        link: &mut Attachment,
        message: ClientMessage,
    ) -> ControlFlow<Exit> {
        match message {
            ClientMessage::Heartbeat => {
                link.malformed = 0;
                send(sink, &ServerMessage::HeartbeatAck).await
            }
            ClientMessage::SyncRequest { vector } => {
                link.malformed = 0;
                self.ctx.sessions.observe(&link.session, &vector).await;
                let diff = link.room.engine().await.snapshot_since(&vector);
                log::debug!(
                    "{} resync from {vector}: {} ops (full: {})",
                    link.user,
                    diff.ops.len(),
                    diff.full
                );
                send(sink, &ServerMessage::Diff { diff }).await
            }
            ClientMessage::Flush => {
                link.malformed = 0;
                let durable = match link.room.flush(self.ctx.documents.bridge()).await {
                    Ok(_) => true,
                    Err(e) => {
                        log::warn!("Requested flush of doc {} failed: {e}", link.room.id());
                        false
                    }
                };
                send(sink, &ServerMessage::Flushed { durable }).await
            }
            ClientMessage::Update(update) => self.submit(sink, link, update).await,
        }
    }

    /// Apply an update and fan out whatever it released, all under the
    /// engine lock.
    async fn submit(&mut self, sink: &mut WsSink, link: &mut Attachment, update: Update) -> ControlFlow<Exit> {
        if !link.role.can_edit() {
            let err = SyncError::ReadOnly;
            return send(sink, &ServerMessage::error(err.kind(), err.to_string())).await;
        }

        let mut observed = update.depends_on.clone();
        let own = update.id();
        let mut direct = Vec::new();
        let result = {
            let mut engine = link.room.engine().await;
            let broadcast = link.room.broadcast();
            engine.apply(update, link.session).map(|outcome| {
                let mut resync_self = false;
                let kept = outcome.duplicate || outcome.applied.iter().any(|a| a.id == own);
                for applied in outcome.applied {
                    if applied.needs_full_sync {
                        if applied.origin == link.session {
                            resync_self = true;
                        } else if let Err(e) = broadcast.resync(applied.origin, None) {
                            log::error!("Resync of session {} failed: {e}", applied.origin);
                        }
                    }
                    if let Err(e) = broadcast.diff(applied.origin, &ServerMessage::Diff { diff: applied.diff }) {
                        log::error!("Broadcast on doc {} failed: {e}", engine.id());
                    }
                }
                for rejected in outcome.rejected {
                    let err = SyncError::CausalGap {
                        replica: rejected.update.replica,
                        seq: rejected.update.seq,
                        reason: rejected.reason.to_string(),
                    };
                    if rejected.origin == link.session {
                        direct.push(ServerMessage::error(err.kind(), err.to_string()));
                        resync_self = true;
                    } else if let Err(e) = broadcast.resync(rejected.origin, Some(&err)) {
                        log::error!("Resync of session {} failed: {e}", rejected.origin);
                    }
                }
                if resync_self {
                    direct.push(ServerMessage::Diff {
                        diff: engine.full_snapshot(),
                    });
                }
                kept
            })
        };

        let kept = match result {
            Ok(kept) => kept,
            Err(e) => return self.violation(sink, link, e.to_string()).await,
        };
        link.malformed = 0;
        // The producer holds its own edit once the document does.
        if kept {
            observed.observe(&own.replica, own.seq);
        }
        self.ctx.sessions.observe(&link.session, &observed).await;
        for message in &direct {
            send(sink, message).await?;
        }
        ControlFlow::Continue(())
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> ControlFlow<Exit> {
    match message.encode() {
        Ok(bytes) => send_bytes(sink, &bytes).await,
        Err(e) => {
            log::error!("Failed to encode {message:?}: {e}");
            ControlFlow::Break(Exit::Close(close::INTERNAL, "internal"))
        }
    }
}

async fn send_bytes(sink: &mut WsSink, bytes: &[u8]) -> ControlFlow<Exit> {
    match sink.send(Message::Binary(bytes.to_vec().into())).await {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => {
            log::debug!("Send failed: {e}");
            ControlFlow::Break(Exit::Disconnected)
        }
    }
}

async fn close_with(sink: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame not delivered: {e}");
    }
}
