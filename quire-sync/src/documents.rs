//! Document registry: one live [`DocumentRoom`] per open document.
//!
//! A room is created on first attach (loaded through the persistence
//! bridge, or empty when the caller may create) and evicted once it has
//! been unattached for the idle period and holds nothing unsaved.
//!
//! ```text
//!            attach ──► [loading] ──► [live, attached > 0]
//!                                        │ last detach → flush
//!                                        ▼
//!                                  [live, idle] ──► evict (clean + idle)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OnceCell, RwLock};
use tokio::time::Instant;

use crate::broadcast::BroadcastGroup;
use crate::causal::CausalConfig;
use crate::crdt::{CollectStats, VersionVector};
use crate::engine::DocumentEngine;
use crate::error::SyncError;
use crate::storage::PersistenceBridge;
use crate::DocumentId;

struct Occupancy {
    attached: usize,
    idle_since: Instant,
}

/// A live document: its engine (the per-document sequence point), its
/// fan-out channel and its save gate.
pub struct DocumentRoom {
    id: DocumentId,
    engine: AsyncMutex<DocumentEngine>,
    /// Held for the whole of a save so at most one is in flight.
    save_gate: AsyncMutex<()>,
    broadcast: BroadcastGroup,
    occupancy: Mutex<Occupancy>,
}

impl DocumentRoom {
    pub fn new(engine: DocumentEngine, broadcast_capacity: usize) -> Self {
        Self {
            id: engine.id(),
            engine: AsyncMutex::new(engine),
            save_gate: AsyncMutex::new(()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            occupancy: Mutex::new(Occupancy {
                attached: 0,
                idle_since: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Lock the engine. Broadcasts made while holding the guard go out
    /// in application order.
    pub async fn engine(&self) -> MutexGuard<'_, DocumentEngine> {
        self.engine.lock().await
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    fn occupancy(&self) -> std::sync::MutexGuard<'_, Occupancy> {
        self.occupancy.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attached(&self) -> usize {
        self.occupancy().attached
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        let occupancy = self.occupancy();
        (occupancy.attached == 0).then(|| now.saturating_duration_since(occupancy.idle_since))
    }

    /// Save the current state if it changed since the last save.
    ///
    /// The state is snapshotted under the engine lock and written outside
    /// it, so edits continue during slow saves. Returns whether anything
    /// was written.
    pub async fn flush(&self, bridge: &PersistenceBridge) -> Result<bool, SyncError> {
        let _gate = self.save_gate.lock().await;
        let (generation, snapshot) = {
            let engine = self.engine.lock().await;
            if !engine.is_dirty() {
                return Ok(false);
            }
            (engine.generation(), engine.to_stored())
        };

        bridge.save(self.id, snapshot).await?;
        self.engine.lock().await.mark_persisted(generation);
        log::debug!("Flushed doc {} at generation {generation}", self.id);
        Ok(true)
    }

    /// Reclaim history below `stable`, or below the document's own vector
    /// when nobody is attached.
    pub async fn collect(&self, stable: Option<&VersionVector>) -> CollectStats {
        let mut engine = self.engine.lock().await;
        let stable = stable.cloned().unwrap_or_else(|| engine.vector().clone());
        engine.collect(&stable)
    }
}

/// Outcome of flushing every live document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub clean: usize,
    pub failed: Vec<DocumentId>,
}

type Slot = Arc<OnceCell<Arc<DocumentRoom>>>;

pub struct DocumentRegistry {
    rooms: RwLock<HashMap<DocumentId, Slot>>,
    bridge: PersistenceBridge,
    causal: CausalConfig,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    pub fn new(bridge: PersistenceBridge, causal: CausalConfig, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            bridge,
            causal,
            broadcast_capacity,
        }
    }

    pub fn bridge(&self) -> &PersistenceBridge {
        &self.bridge
    }

    async fn slot(&self, id: DocumentId) -> Slot {
        {
            let rooms = self.rooms.read().await;
            if let Some(slot) = rooms.get(&id) {
                return slot.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms.entry(id).or_default().clone()
    }

    /// Open (or reuse) a document and count one more attached session.
    ///
    /// Concurrent first attaches share a single load. `create` decides
    /// whether a document missing from the store starts empty.
    pub async fn attach(&self, id: DocumentId, create: bool) -> Result<Arc<DocumentRoom>, SyncError> {
        loop {
            let slot = self.slot(id).await;
            let opened = slot
                .get_or_try_init(|| async {
                    let loaded = self.bridge.load(id).await?;
                    let fresh = loaded.is_none();
                    let engine = DocumentEngine::open(id, loaded, create, self.causal)?;
                    log::info!(
                        "Opened doc {id} ({})",
                        if fresh { "new" } else { "loaded from store" }
                    );
                    Ok::<_, SyncError>(Arc::new(DocumentRoom::new(engine, self.broadcast_capacity)))
                })
                .await;

            let room = match opened {
                Ok(room) => room.clone(),
                Err(e) => {
                    let mut rooms = self.rooms.write().await;
                    if rooms
                        .get(&id)
                        .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                    {
                        rooms.remove(&id);
                    }
                    return Err(e);
                }
            };

            // Counting under the read lock excludes a concurrent eviction.
            let rooms = self.rooms.read().await;
            if rooms.get(&id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                room.occupancy().attached += 1;
                return Ok(room);
            }
            // Evicted between load and count; open it again.
        }
    }

    /// Count one session fewer. Returns true when it was the last one.
    pub fn detach(&self, room: &DocumentRoom) -> bool {
        let mut occupancy = room.occupancy();
        occupancy.attached = occupancy.attached.saturating_sub(1);
        if occupancy.attached == 0 {
            occupancy.idle_since = Instant::now();
            true
        } else {
            false
        }
    }

    pub async fn get(&self, id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        let rooms = self.rooms.read().await;
        rooms.get(id).and_then(|s| s.get().cloned())
    }

    pub async fn rooms(&self) -> Vec<Arc<DocumentRoom>> {
        let rooms = self.rooms.read().await;
        rooms.values().filter_map(|s| s.get().cloned()).collect()
    }

    pub async fn active_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.values().filter(|s| s.initialized()).count()
    }

    pub async fn flush(&self, id: &DocumentId) -> Result<bool, SyncError> {
        match self.get(id).await {
            Some(room) => room.flush(&self.bridge).await,
            None => Ok(false),
        }
    }

    /// Flush every dirty document. Failures are collected, not returned
    /// early, so one broken document does not block the rest.
    pub async fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for room in self.rooms().await {
            match room.flush(&self.bridge).await {
                Ok(true) => report.flushed += 1,
                Ok(false) => report.clean += 1,
                Err(e) => {
                    log::error!("Flush of doc {} failed: {e}", room.id());
                    report.failed.push(room.id());
                }
            }
        }
        report
    }

    /// Drop rooms that have been unattached for `idle` and have nothing
    /// unsaved.
    pub async fn evict_idle(&self, idle: Duration) -> Vec<DocumentId> {
        let now = Instant::now();
        let mut rooms = self.rooms.write().await;
        let evictable: Vec<DocumentId> = rooms
            .iter()
            .filter_map(|(id, slot)| {
                let room = slot.get()?;
                if room.idle_for(now)? < idle {
                    return None;
                }
                // A busy engine is not idle; try again next round.
                let engine = room.engine.try_lock().ok()?;
                (!engine.is_dirty()).then_some(*id)
            })
            .collect();

        for id in &evictable {
            rooms.remove(id);
            log::info!("Evicted idle doc {id}");
        }
        evictable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Replica;
    use crate::storage::{MemoryStore, RetryPolicy, StateStore, StoreError, StoredDocument};
    use uuid::Uuid;

    fn registry() -> (DocumentRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let bridge = PersistenceBridge::new(store.clone(), RetryPolicy::default());
        (DocumentRegistry::new(bridge, CausalConfig::default(), 16), store)
    }

    async fn edit(room: &DocumentRoom, replica: &mut Replica, text: &str) {
        let pos = replica.len();
        let update = replica.insert(pos, text).unwrap();
        room.engine().await.apply(update, Uuid::nil()).unwrap();
    }

    #[tokio::test]
    async fn test_attach_missing_without_create() {
        let (reg, _) = registry();
        let id = Uuid::new_v4();
        assert!(matches!(
            reg.attach(id, false).await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(reg.active_count().await, 0);
        // A later owner attach can still create it.
        assert!(reg.attach(id, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_shares_room() {
        let (reg, _) = registry();
        let id = Uuid::new_v4();
        let a = reg.attach(id, true).await.unwrap();
        let b = reg.attach(id, false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.attached(), 2);
        assert!(!reg.detach(&a));
        assert!(reg.detach(&b));
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let (reg, store) = registry();
        let id = Uuid::new_v4();
        let room = reg.attach(id, true).await.unwrap();
        let mut alice = Replica::new("alice");
        edit(&room, &mut alice, "hello").await;

        assert!(room.flush(reg.bridge()).await.unwrap());
        assert!(!room.flush(reg.bridge()).await.unwrap());
        assert_eq!(reg.bridge().status().saves, 1);
        assert_eq!(store.load(id).unwrap().unwrap().state.render(), "hello");
    }

    #[tokio::test]
    async fn test_reattach_after_eviction_loads_state() {
        let (reg, _) = registry();
        let id = Uuid::new_v4();
        let room = reg.attach(id, true).await.unwrap();
        let mut alice = Replica::new("alice");
        edit(&room, &mut alice, "durable").await;
        reg.detach(&room);

        // Dirty rooms are never evicted.
        assert!(reg.evict_idle(Duration::ZERO).await.is_empty());
        let report = reg.flush_all().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(reg.evict_idle(Duration::ZERO).await, vec![id]);
        assert_eq!(reg.active_count().await, 0);

        let again = reg.attach(id, false).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &again));
        assert_eq!(again.engine().await.text(), "durable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_rooms_are_not_evicted() {
        let (reg, _) = registry();
        let id = Uuid::new_v4();
        let room = reg.attach(id, true).await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(reg.evict_idle(Duration::from_secs(60)).await.is_empty());

        reg.detach(&room);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reg.evict_idle(Duration::from_secs(60)).await.is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(reg.evict_idle(Duration::from_secs(60)).await, vec![id]);
    }

    #[tokio::test]
    async fn test_collect_without_sessions_uses_own_vector() {
        let (reg, _) = registry();
        let room = reg.attach(Uuid::new_v4(), true).await.unwrap();
        let mut alice = Replica::new("alice");
        edit(&room, &mut alice, "abc").await;
        let update = alice.delete(0, 3).unwrap();
        room.engine().await.apply(update, Uuid::nil()).unwrap();

        let stats = room.collect(None).await;
        assert_eq!(stats.folded_deletes, 1);
        assert_eq!(room.engine().await.text(), "");
    }

    /// Slow store that tracks how many saves of each document overlap.
    #[derive(Default)]
    struct Overlap {
        inner: MemoryStore,
        in_flight: Mutex<HashMap<DocumentId, usize>>,
        peak: Mutex<HashMap<DocumentId, usize>>,
    }

    impl StateStore for Overlap {
        fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.load(id)
        }
        fn save(&self, id: DocumentId, doc: &StoredDocument) -> Result<(), StoreError> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let now = in_flight.entry(id).or_default();
                *now += 1;
                let mut peak = self.peak.lock().unwrap();
                let high = peak.entry(id).or_default();
                *high = (*high).max(*now);
            }
            std::thread::sleep(Duration::from_millis(5));
            let result = self.inner.save(id, doc);
            *self.in_flight.lock().unwrap().entry(id).or_default() -= 1;
            result
        }
        fn delete(&self, id: DocumentId) -> Result<bool, StoreError> {
            self.inner.delete(id)
        }
        fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
            self.inner.list()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_save_in_flight_per_document() {
        let store = Arc::new(Overlap::default());
        let bridge = PersistenceBridge::new(store.clone(), RetryPolicy::default());
        let reg = Arc::new(DocumentRegistry::new(bridge, CausalConfig::default(), 16));
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tasks = Vec::new();
        for doc in [first, second] {
            let room = reg.attach(doc, true).await.unwrap();
            for writer in 0..6 {
                let (reg, room) = (reg.clone(), room.clone());
                tasks.push(tokio::spawn(async move {
                    let mut replica = Replica::new(format!("w{writer}"));
                    for round in 0..4 {
                        edit(&room, &mut replica, "x").await;
                        if round % 2 == 0 {
                            room.flush(reg.bridge()).await.unwrap();
                        } else {
                            reg.flush(&room.id()).await.unwrap();
                        }
                    }
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        reg.flush_all().await;

        let peak = store.peak.lock().unwrap().clone();
        assert_eq!(peak.get(&first), Some(&1));
        assert_eq!(peak.get(&second), Some(&1));
        for doc in [first, second] {
            let stored = store.load(doc).unwrap().unwrap();
            assert_eq!(stored.state.render().len(), 24);
        }
    }
}
