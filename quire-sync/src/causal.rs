//! Causal delivery buffer.
//!
//! Holds updates until the document's version vector satisfies their
//! `depends_on` and they are the next sequence from their replica.
//! Readiness depends only on the vector, so admission never depends on
//! arrival time; held updates are re-checked by the engine each time the
//! vector advances.
//!
//! Waiting is bounded two ways, both tied to dependency progress rather
//! than the clock:
//! - `capacity`: when full, the longest-waiting update is rejected
//! - `retention_window`: an update still blocked after this many other
//!   updates have been applied is treated as permanently unsatisfiable

use std::collections::BTreeMap;
use std::fmt;

use crate::crdt::{OpId, Update, VersionVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalConfig {
    pub capacity: usize,
    pub retention_window: u64,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retention_window: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    CapacityExceeded,
    RetentionExpired,
    /// Became ready, but its Lamport clock is ahead of its dependencies.
    ClockAhead,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapReason::CapacityExceeded => f.write_str("causal buffer full"),
            GapReason::RetentionExpired => f.write_str("dependencies never arrived"),
            GapReason::ClockAhead => f.write_str("lamport clock ahead of dependencies"),
        }
    }
}

/// An update the buffer gave up on, with the tag of whoever sent it.
#[derive(Debug, Clone)]
pub struct Rejected<T> {
    pub update: Update,
    pub origin: T,
    pub reason: GapReason,
}

#[derive(Debug, Clone)]
struct Held<T> {
    update: Update,
    origin: T,
    admitted_at: u64,
}

/// Per-document buffer. `T` tags each update with its producer so
/// rejections can be routed back.
#[derive(Debug, Clone)]
pub struct CausalBuffer<T> {
    held: BTreeMap<OpId, Held<T>>,
    config: CausalConfig,
}

impl<T: Clone> CausalBuffer<T> {
    pub fn new(config: CausalConfig) -> Self {
        Self {
            held: BTreeMap::new(),
            config,
        }
    }

    /// Already incorporated into `vector`.
    pub fn is_duplicate(update: &Update, vector: &VersionVector) -> bool {
        update.seq <= vector.get(&update.replica)
    }

    /// Next from its replica and every dependency satisfied.
    pub fn is_ready(update: &Update, vector: &VersionVector) -> bool {
        update.seq == vector.get(&update.replica) + 1 && vector.dominates(&update.depends_on)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.held.contains_key(id)
    }

    /// Park an update. `now` is the owner's applied-update counter.
    pub fn hold(&mut self, update: Update, origin: T, now: u64) -> Vec<Rejected<T>> {
        let id = update.id();
        if self.held.contains_key(&id) {
            return Vec::new();
        }
        self.held.insert(
            id,
            Held {
                update,
                origin,
                admitted_at: now,
            },
        );

        let mut rejected = Vec::new();
        while self.held.len() > self.config.capacity {
            let oldest = self
                .held
                .iter()
                .min_by_key(|(id, h)| (h.admitted_at, (*id).clone()))
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else { break };
            if let Some(h) = self.held.remove(&oldest) {
                rejected.push(Rejected {
                    update: h.update,
                    origin: h.origin,
                    reason: GapReason::CapacityExceeded,
                });
            }
        }
        rejected
    }

    /// Remove and return one held update that `vector` now satisfies.
    /// Held updates that became duplicates are dropped along the way.
    pub fn take_ready(&mut self, vector: &VersionVector) -> Option<(Update, T)> {
        self.held
            .retain(|_, h| !Self::is_duplicate(&h.update, vector));
        let id = self
            .held
            .iter()
            .find(|(_, h)| Self::is_ready(&h.update, vector))
            .map(|(id, _)| id.clone())?;
        self.held.remove(&id).map(|h| (h.update, h.origin))
    }

    /// Reject updates that have waited through more than
    /// `retention_window` applications without becoming ready.
    pub fn expire(&mut self, now: u64) -> Vec<Rejected<T>> {
        let window = self.config.retention_window;
        let expired: Vec<OpId> = self
            .held
            .iter()
            .filter(|(_, h)| now.saturating_sub(h.admitted_at) > window)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.held.remove(&id))
            .map(|h| Rejected {
                update: h.update,
                origin: h.origin,
                reason: GapReason::RetentionExpired,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Operation;

    fn update(replica: &str, seq: u64, deps: VersionVector) -> Update {
        Update::new(replica, seq, Operation::insert(None, seq, "x"), deps)
    }

    #[test]
    fn test_readiness() {
        let v = VersionVector::from([("a", 1)]);
        assert!(CausalBuffer::<()>::is_ready(&update("a", 2, VersionVector::new()), &v));
        assert!(!CausalBuffer::<()>::is_ready(&update("a", 3, VersionVector::new()), &v));
        assert!(!CausalBuffer::<()>::is_ready(
            &update("b", 1, VersionVector::from([("a", 2)])),
            &v
        ));
        assert!(CausalBuffer::<()>::is_duplicate(&update("a", 1, VersionVector::new()), &v));
    }

    #[test]
    fn test_take_ready_releases_in_dependency_order() {
        let mut buf = CausalBuffer::new(CausalConfig::default());
        let mut v = VersionVector::new();
        buf.hold(update("a", 2, VersionVector::from([("a", 1)])), 7u8, 0);
        assert!(buf.take_ready(&v).is_none());

        v.set("a".into(), 1);
        let (u, origin) = buf.take_ready(&v).unwrap();
        assert_eq!(u.seq, 2);
        assert_eq!(origin, 7);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_duplicate_hold_ignored() {
        let mut buf = CausalBuffer::new(CausalConfig::default());
        buf.hold(update("a", 2, VersionVector::new()), (), 0);
        buf.hold(update("a", 2, VersionVector::new()), (), 0);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_capacity_rejects_oldest() {
        let mut buf = CausalBuffer::new(CausalConfig {
            capacity: 2,
            retention_window: 100,
        });
        assert!(buf.hold(update("a", 5, VersionVector::new()), 1, 0).is_empty());
        assert!(buf.hold(update("b", 5, VersionVector::new()), 2, 1).is_empty());
        let rejected = buf.hold(update("c", 5, VersionVector::new()), 3, 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].origin, 1);
        assert_eq!(rejected[0].reason, GapReason::CapacityExceeded);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_expire_after_retention_window() {
        let mut buf = CausalBuffer::new(CausalConfig {
            capacity: 10,
            retention_window: 3,
        });
        buf.hold(update("a", 9, VersionVector::new()), (), 0);
        assert!(buf.expire(3).is_empty());
        let rejected = buf.expire(4);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, GapReason::RetentionExpired);
    }

    #[test]
    fn test_stale_held_updates_dropped() {
        let mut buf = CausalBuffer::new(CausalConfig::default());
        buf.hold(update("a", 1, VersionVector::from([("b", 1)])), (), 0);
        let v = VersionVector::from([("a", 1)]);
        assert!(buf.take_ready(&v).is_none());
        assert!(buf.is_empty());
    }
}
