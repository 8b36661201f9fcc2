//! Session registry: who is attached to which document, and whether they
//! are still alive.
//!
//! Sessions are refreshed by any inbound frame. A periodic [`prune`]
//! removes sessions silent for longer than the heartbeat timeout and
//! wakes their connection task so it can close. Pruning only touches
//! registry state; document contents are never affected.
//!
//! [`prune`]: SessionRegistry::prune

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::{Role, UserId};
use crate::crdt::VersionVector;
use crate::error::SyncError;
use crate::{DocumentId, SessionId};

/// Default heartbeat timeout.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: UserId,
    pub document: DocumentId,
    pub role: Role,
    pub joined_at: Instant,
    pub last_seen: Instant,
    /// Latest version vector this session reported having.
    pub observed: VersionVector,
}

impl Session {
    pub fn new(user: UserId, document: DocumentId, role: Role) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            user,
            document,
            role,
            joined_at: now,
            last_seen: now,
            observed: VersionVector::new(),
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

struct Entry {
    session: Session,
    evicted: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    by_document: HashMap<DocumentId, HashMap<SessionId, Entry>>,
    document_of: HashMap<SessionId, DocumentId>,
}

impl Inner {
    fn entry_mut(&mut self, id: &SessionId) -> Option<&mut Entry> {
        let doc = self.document_of.get(id)?;
        self.by_document.get_mut(doc)?.get_mut(id)
    }

    fn remove(&mut self, id: &SessionId) -> Option<Entry> {
        let doc = self.document_of.remove(id)?;
        let sessions = self.by_document.get_mut(&doc)?;
        let entry = sessions.remove(id);
        if sessions.is_empty() {
            self.by_document.remove(&doc);
        }
        entry
    }
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    max_per_document: usize,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_per_document: usize, timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_per_document,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Add a session. The returned notifier fires if the session is
    /// pruned.
    pub async fn register(&self, session: Session) -> Result<Arc<Notify>, SyncError> {
        let mut inner = self.inner.write().await;
        let document = session.document;
        let sessions = inner.by_document.entry(document).or_default();
        if sessions.len() >= self.max_per_document {
            let limit = self.max_per_document;
            if sessions.is_empty() {
                inner.by_document.remove(&document);
            }
            return Err(SyncError::Capacity { document, limit });
        }

        let evicted = Arc::new(Notify::new());
        let id = session.id;
        log::info!(
            "Session {id} ({}, {:?}) registered on doc {document}",
            session.user,
            session.role
        );
        sessions.insert(
            id,
            Entry {
                session,
                evicted: evicted.clone(),
            },
        );
        inner.document_of.insert(id, document);
        Ok(evicted)
    }

    /// Refresh `last_seen`. Returns false for unknown sessions.
    pub async fn heartbeat(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entry_mut(id) {
            Some(entry) => {
                entry.session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record that a session has incorporated at least `vector`.
    pub async fn observe(&self, id: &SessionId, vector: &VersionVector) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entry_mut(id) {
            entry.session.observed.merge(vector);
            entry.session.last_seen = Instant::now();
        }
    }

    /// Remove a session; idempotent.
    pub async fn deregister(&self, id: &SessionId) -> Option<Session> {
        let removed = self.inner.write().await.remove(id).map(|e| e.session);
        if let Some(s) = &removed {
            log::info!("Session {id} ({}) left doc {}", s.user, s.document);
        }
        removed
    }

    pub async fn prune(&self) -> Vec<Session> {
        self.prune_at(Instant::now()).await
    }

    /// Remove every session idle at `now` and wake its connection.
    pub async fn prune_at(&self, now: Instant) -> Vec<Session> {
        let mut inner = self.inner.write().await;
        let idle: Vec<SessionId> = inner
            .by_document
            .values()
            .flat_map(|sessions| sessions.values())
            .filter(|e| e.session.is_idle(now, self.timeout))
            .map(|e| e.session.id)
            .collect();

        let mut pruned = Vec::with_capacity(idle.len());
        for id in idle {
            if let Some(entry) = inner.remove(&id) {
                log::info!(
                    "Pruned silent session {id} ({}) from doc {}",
                    entry.session.user,
                    entry.session.document
                );
                entry.evicted.notify_one();
                pruned.push(entry.session);
            }
        }
        pruned
    }

    /// Distinct users attached to a document, sorted.
    pub async fn presence(&self, document: &DocumentId) -> Vec<UserId> {
        let inner = self.inner.read().await;
        let mut users: Vec<UserId> = inner
            .by_document
            .get(document)
            .map(|s| s.values().map(|e| e.session.user.clone()).collect())
            .unwrap_or_default();
        users.sort();
        users.dedup();
        users
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let inner = self.inner.read().await;
        let doc = inner.document_of.get(id)?;
        inner
            .by_document
            .get(doc)
            .and_then(|s| s.get(id))
            .map(|e| e.session.clone())
    }

    pub async fn session_count(&self, document: &DocumentId) -> usize {
        self.inner
            .read()
            .await
            .by_document
            .get(document)
            .map_or(0, |s| s.len())
    }

    pub async fn total_sessions(&self) -> usize {
        self.inner.read().await.document_of.len()
    }

    /// Meet of the observed vectors of a document's sessions; `None`
    /// when nobody is attached.
    pub async fn stable_vector(&self, document: &DocumentId) -> Option<VersionVector> {
        let inner = self.inner.read().await;
        let sessions = inner.by_document.get(document)?;
        let mut vectors = sessions.values().map(|e| &e.session.observed);
        let first = vectors.next()?.clone();
        Some(vectors.fold(first, |acc, v| acc.meet(v)))
    }
}
