//! Persistence bridge: async façade over a [`StateStore`] with bounded
//! exponential backoff and an operator-visible durability signal.
//!
//! A failed save never touches in-memory state. The caller keeps the
//! engine dirty and the next flush trigger tries again with a fresh
//! snapshot.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{StateStore, StoreError, StoredDocument};
use crate::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base·2^attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Snapshot of persistence health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStatus {
    pub degraded: bool,
    /// Documents whose latest save exhausted its retries.
    pub failing: Vec<DocumentId>,
    pub saves: u64,
    pub failed_saves: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Health {
    failing: Mutex<BTreeSet<DocumentId>>,
    saves: AtomicU64,
    failed_saves: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
    health: Arc<Health>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            health: Arc::new(Health::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Load a document, retrying transient failures.
    pub async fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let result = tokio::task::spawn_blocking(move || store.load(id))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))
                .and_then(|r| r);
            match result {
                Ok(doc) => return Ok(doc),
                // Corrupt bytes will not get better on retry.
                Err(e @ (StoreError::Deserialization(_) | StoreError::Compression(_))) => {
                    return Err(e)
                }
                Err(e) if attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    log::warn!("Load of doc {id} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Save a snapshot with bounded retries. On exhaustion the document is
    /// marked failing, and the bridge stays degraded until every failing
    /// document has been saved again.
    pub async fn save(&self, id: DocumentId, doc: StoredDocument) -> Result<(), StoreError> {
        let doc = Arc::new(doc);
        let mut attempt = 0;
        loop {
            let store = self.store.clone();
            let snapshot = doc.clone();
            let result = tokio::task::spawn_blocking(move || store.save(id, &snapshot))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(()) => {
                    self.record_success(id);
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "Save of doc {id} failed (attempt {}/{}): {e}; retrying in {delay:?}",
                        attempt + 1,
                        self.policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.record_failure(id, &e);
                    return Err(e);
                }
            }
        }
    }

    fn failing(&self) -> MutexGuard<'_, BTreeSet<DocumentId>> {
        self.health.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_success(&self, id: DocumentId) {
        self.health.saves.fetch_add(1, Ordering::Relaxed);
        let mut failing = self.failing();
        if failing.remove(&id) {
            if failing.is_empty() {
                log::info!("Persistence recovered (doc {id} saved)");
            } else {
                log::info!("Doc {id} saved again; {} still failing", failing.len());
            }
        }
    }

    fn record_failure(&self, id: DocumentId, e: &StoreError) {
        self.health.failed_saves.fetch_add(1, Ordering::Relaxed);
        let failing = {
            let mut failing = self.failing();
            failing.insert(id);
            failing.len()
        };
        if let Ok(mut last) = self.health.last_error.lock() {
            *last = Some(e.to_string());
        }
        log::error!(
            "Durability degraded: doc {id} not saved after {} attempts ({failing} documents failing): {e}",
            self.policy.max_attempts
        );
    }

    pub fn is_degraded(&self) -> bool {
        !self.failing().is_empty()
    }

    pub fn status(&self) -> PersistenceStatus {
        let failing: Vec<DocumentId> = self.failing().iter().copied().collect();
        PersistenceStatus {
            degraded: !failing.is_empty(),
            failing,
            saves: self.health.saves.load(Ordering::Relaxed),
            failed_saves: self.health.failed_saves.load(Ordering::Relaxed),
            last_error: self
                .health
                .last_error
                .lock()
                .ok()
                .and_then(|last| last.clone()),
        }
    }
}
