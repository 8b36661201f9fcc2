//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── DocumentRoom (doc 1) ── engine, broadcast
//!            ├── gateway (1 task/conn) ┤
//! Client B ──┘          │              └── DocumentRoom (doc 2)
//!                       │                        │ flush / load
//!                SessionRegistry         PersistenceBridge ── StateStore
//! ```
//!
//! Besides the accept loop the server runs one maintenance task with
//! three tickers: heartbeat pruning, periodic collect-and-flush, and idle
//! document eviction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::auth::{AccessOracle, AuthError, HmacTokenVerifier, StaticAccessOracle, TokenVerifier};
use crate::config::{ConfigError, ServerConfig};
use crate::documents::{DocumentRegistry, FlushReport};
use crate::gateway::{self, ConnectionCounters, GatewayContext};
use crate::session::SessionRegistry;
use crate::storage::{
    MemoryStore, PersistenceBridge, PersistenceStatus, RocksStore, StateStore, StoreError,
};

/// How long shutdown waits for connections to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("auth setup failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    /// Saves are failing; edits are held in memory only.
    Degraded,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_document_count: usize,
    pub total_session_count: usize,
    pub uptime: Duration,
    pub persistence: PersistenceStatus,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
    pub active_sessions: usize,
    pub saves: u64,
    pub failed_saves: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    ctx: Arc<GatewayContext>,
    started: Instant,
    shutdown: watch::Sender<bool>,
    stopping: AtomicBool,
}

impl SyncServer {
    /// Build a server from configuration: RocksDB storage when a path is
    /// set, HMAC tokens and the configured access rules.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn StateStore> = match config.store_config() {
            Some(store_config) => Arc::new(RocksStore::open(store_config)?),
            None => {
                log::warn!("No storage_path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        if config.token_secret.is_empty() {
            log::warn!("token_secret is empty; tokens can be forged by anyone");
        }
        let verifier = Arc::new(HmacTokenVerifier::new(&config.token_secret)?);
        let mut oracle = StaticAccessOracle::new(config.access.iter().cloned());
        if let Some(owner) = &config.default_owner {
            oracle = oracle.with_default_owner(owner.clone());
        }
        Ok(Self::with_components(config, store, verifier, Arc::new(oracle)))
    }

    /// Build a server around externally supplied collaborators.
    pub fn with_components(
        config: ServerConfig,
        store: Arc<dyn StateStore>,
        verifier: Arc<dyn TokenVerifier>,
        oracle: Arc<dyn AccessOracle>,
    ) -> Self {
        let bridge = PersistenceBridge::new(store, config.retry_policy());
        let documents = Arc::new(DocumentRegistry::new(
            bridge,
            config.causal(),
            config.broadcast_capacity,
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.max_sessions_per_document,
            config.heartbeat_timeout(),
        ));
        let ctx = Arc::new(GatewayContext {
            documents,
            sessions,
            verifier,
            oracle,
            auth_timeout: config.auth_timeout(),
            max_malformed: config.max_malformed_messages.max(1),
            counters: ConnectionCounters::default(),
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            ctx,
            started: Instant::now(),
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn documents(&self) -> &Arc<DocumentRegistry> {
        &self.ctx.documents
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.ctx.sessions
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`] is called.
    ///
    /// [`shutdown`]: SyncServer::shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        log::info!("Sync server listening on {addr}");

        let mut stop = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().maintain(self.shutdown.subscribe()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    self.spawn_connection(&mut tasks, stream, peer);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            while tasks.try_join_next().is_some() {}
        }

        drop(listener);
        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            log::warn!("{} tasks still running after shutdown grace period", tasks.len());
            tasks.abort_all();
        }
        log::info!("Sync server on {addr} stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        tasks: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) {
        log::debug!("New TCP connection from {peer}");
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        tasks.spawn(gateway::serve(
            stream,
            peer,
            self.ctx.clone(),
            self.shutdown.subscribe(),
        ));
    }

    async fn maintain(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut prune = tokio::time::interval(self.config.prune_interval());
        let mut flush = tokio::time::interval(self.config.flush_interval());
        let idle = self.config.idle_eviction();
        let mut evict = tokio::time::interval((idle / 2).max(Duration::from_secs(1)));
        for ticker in [&mut prune, &mut flush, &mut evict] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = prune.tick() => {
                    self.prune().await;
                }
                _ = flush.tick() => {
                    self.flush_cycle().await;
                }
                _ = evict.tick() => {
                    self.ctx.documents.evict_idle(idle).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Drop silent sessions. Their connections close themselves.
    pub async fn prune(&self) -> usize {
        let pruned = self.ctx.sessions.prune().await;
        if !pruned.is_empty() {
            log::info!("Pruned {} silent sessions", pruned.len());
        }
        pruned.len()
    }

    /// Reclaim history every attached session has seen, then save every
    /// dirty document.
    pub async fn flush_cycle(&self) -> FlushReport {
        for room in self.ctx.documents.rooms().await {
            let stable = self.ctx.sessions.stable_vector(&room.id()).await;
            room.collect(stable.as_ref()).await;
        }
        let report = self.ctx.documents.flush_all().await;
        if report.flushed > 0 || !report.failed.is_empty() {
            log::info!(
                "Flush cycle: {} saved, {} clean, {} failed",
                report.flushed,
                report.clean,
                report.failed.len()
            );
        }
        report
    }

    pub async fn health(&self) -> HealthReport {
        let persistence = self.ctx.documents.bridge().status();
        let status = if self.stopping.load(Ordering::Acquire) {
            HealthStatus::ShuttingDown
        } else if persistence.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        HealthReport {
            status,
            active_document_count: self.ctx.documents.active_count().await,
            total_session_count: self.ctx.sessions.total_sessions().await,
            uptime: self.started.elapsed(),
            persistence,
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.ctx.counters;
        let persistence = self.ctx.documents.bridge().status();
        ServerStats {
            total_connections: counters.total(),
            active_connections: counters.active(),
            refused_connections: counters.refused(),
            total_messages: counters.messages(),
            total_bytes: counters.bytes(),
            active_documents: self.ctx.documents.active_count().await,
            active_sessions: self.ctx.sessions.total_sessions().await,
            saves: persistence.saves,
            failed_saves: persistence.failed_saves,
        }
    }

    /// Flush every dirty document, then close all connections with 1001.
    /// Only the first call does any work.
    pub async fn shutdown(&self) -> FlushReport {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }
        log::info!("Shutting down: flushing documents");
        let report = self.ctx.documents.flush_all().await;
        if !report.failed.is_empty() {
            log::error!(
                "{} documents could not be saved before shutdown",
                report.failed.len()
            );
        }
        self.shutdown.send_replace(true);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserId;
    use crate::crdt::Replica;
    use uuid::Uuid;

    fn config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            token_secret: "test".into(),
            default_owner: Some(UserId::new("dev")),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(config()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = ServerConfig {
            save_attempts: 0,
            ..config()
        };
        assert!(matches!(SyncServer::new(bad), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..config()
        })
        .unwrap();
        assert_eq!(server.health().await.status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn test_health_initial() {
        let server = SyncServer::new(config()).unwrap();
        let health = server.health().await;
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.active_document_count, 0);
        assert_eq!(health.total_session_count, 0);
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_dirty_documents() {
        let store = Arc::new(MemoryStore::new());
        let server = SyncServer::with_components(
            config(),
            store.clone(),
            Arc::new(HmacTokenVerifier::new("test").unwrap()),
            Arc::new(StaticAccessOracle::default()),
        );
        let id = Uuid::new_v4();
        let room = server.documents().attach(id, true).await.unwrap();
        let mut r = Replica::new("a");
        room.engine()
            .await
            .apply(r.insert(0, "bye").unwrap(), Uuid::nil())
            .unwrap();

        let report = server.shutdown().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(store.load(id).unwrap().unwrap().state.render(), "bye");
        assert_eq!(server.health().await.status, HealthStatus::ShuttingDown);
        assert_eq!(server.shutdown().await, FlushReport::default());
    }
}
