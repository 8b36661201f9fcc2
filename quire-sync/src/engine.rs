//! Per-document engine: authoritative state, version vector and causal
//! buffer for one document.
//!
//! The engine is plain synchronous state. Serialization of access (the
//! single sequence point per document) is provided by the owning
//! [`DocumentRoom`](crate::documents::DocumentRoom), which keeps it
//! behind one async mutex and broadcasts diffs while still holding it, so
//! fan-out order equals application order.

use crate::causal::{CausalBuffer, CausalConfig, GapReason, Rejected};
use crate::crdt::{CollectStats, CrdtError, Diff, OpId, Operation, TextState, Update, VersionVector};
use crate::error::SyncError;
use crate::storage::StoredDocument;
use crate::{DocumentId, SessionId};

/// One update that made it into the state.
#[derive(Debug, Clone)]
pub struct Applied {
    pub id: OpId,
    pub origin: SessionId,
    pub diff: Diff,
    /// Producer sent `depends_on = {}` against a non-empty document and
    /// must be brought up to date with full state.
    pub needs_full_sync: bool,
}

/// What happened to a submitted update.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Updates applied by this call, in application order. Includes held
    /// updates released by the advance.
    pub applied: Vec<Applied>,
    pub buffered: bool,
    pub duplicate: bool,
    /// Held updates given up on during this call.
    pub rejected: Vec<Rejected<SessionId>>,
}

#[derive(Debug)]
pub struct DocumentEngine {
    id: DocumentId,
    state: TextState,
    vector: VersionVector,
    buffer: CausalBuffer<SessionId>,
    /// Highest Lamport clock of any insert in the state.
    lamport: u64,
    /// Updates applied since the engine was opened.
    applied: u64,
    /// Bumped on every state change.
    generation: u64,
    /// Generation last confirmed durable.
    persisted: u64,
}

impl DocumentEngine {
    pub fn new(id: DocumentId, config: CausalConfig) -> Self {
        Self {
            id,
            state: TextState::new(),
            vector: VersionVector::new(),
            buffer: CausalBuffer::new(config),
            lamport: 0,
            applied: 0,
            generation: 0,
            persisted: 0,
        }
    }

    /// Build from what the store returned. `create` decides whether an
    /// absent document starts empty or is an error.
    pub fn open(
        id: DocumentId,
        loaded: Option<StoredDocument>,
        create: bool,
        config: CausalConfig,
    ) -> Result<Self, SyncError> {
        let Some(stored) = loaded else {
            if create {
                return Ok(Self::new(id, config));
            }
            return Err(SyncError::NotFound(id));
        };

        let implied = stored.state.version_vector();
        if implied != stored.vector {
            return Err(SyncError::Internal(format!(
                "stored state of {id} is corrupt: vector {} but state implies {implied}",
                stored.vector
            )));
        }

        let mut engine = Self::new(id, config);
        engine.lamport = stored.state.max_lamport();
        engine.state = stored.state;
        engine.vector = stored.vector;
        Ok(engine)
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    pub fn state(&self) -> &TextState {
        &self.state
    }

    pub fn text(&self) -> String {
        self.state.render()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.generation != self.persisted
    }

    /// Record that `generation` reached the store.
    pub fn mark_persisted(&mut self, generation: u64) {
        if generation > self.persisted {
            self.persisted = generation;
        }
    }

    /// Route an update through the causal buffer.
    pub fn apply(&mut self, update: Update, origin: SessionId) -> Result<ApplyOutcome, SyncError> {
        update.validate()?;
        let mut outcome = ApplyOutcome::default();

        if CausalBuffer::<SessionId>::is_duplicate(&update, &self.vector) {
            log::trace!("doc {}: duplicate update {}:{}", self.id, update.replica, update.seq);
            outcome.duplicate = true;
            return Ok(outcome);
        }

        if CausalBuffer::<SessionId>::is_ready(&update, &self.vector) {
            self.check_clock(&update)?;
            outcome.applied.push(self.incorporate(update, origin));
            while let Some((held, held_origin)) = self.buffer.take_ready(&self.vector) {
                if self.check_clock(&held).is_err() {
                    outcome.rejected.push(Rejected {
                        update: held,
                        origin: held_origin,
                        reason: GapReason::ClockAhead,
                    });
                    continue;
                }
                outcome.applied.push(self.incorporate(held, held_origin));
            }
        } else {
            let id = update.id();
            log::debug!(
                "doc {}: holding {id:?}, needs {} have {}",
                self.id,
                update.depends_on,
                self.vector
            );
            outcome.rejected = self.buffer.hold(update, origin, self.applied);
            outcome.buffered = self.buffer.contains(&id);
        }

        outcome.rejected.extend(self.buffer.expire(self.applied));
        for r in &outcome.rejected {
            log::warn!(
                "doc {}: rejecting {}:{} ({})",
                self.id,
                r.update.replica,
                r.update.seq,
                r.reason
            );
        }
        Ok(outcome)
    }

    /// A producer assigns `1 + max` over everything it has seen, and by the
    /// time an update is ready all of that is in the state. Anything
    /// higher is fabricated and would push every later clock with it.
    fn check_clock(&self, update: &Update) -> Result<(), CrdtError> {
        if let Operation::Insert { lamport, .. } = &update.payload {
            let ceiling = self.lamport.saturating_add(1);
            if *lamport > ceiling {
                return Err(CrdtError::ClockAhead {
                    lamport: *lamport,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    fn incorporate(&mut self, update: Update, origin: SessionId) -> Applied {
        let id = update.id();
        if let Operation::Insert { lamport, .. } = &update.payload {
            self.lamport = self.lamport.max(*lamport);
        }
        let needs_full_sync = update.depends_on.is_empty()
            && self.vector.iter().any(|(r, _)| r != &update.replica);

        self.state.integrate(id.clone(), update.payload.clone());
        self.vector.set(update.replica, update.seq);
        self.applied += 1;
        self.generation += 1;

        Applied {
            diff: Diff::single(id.clone(), update.payload, self.vector.clone()),
            id,
            origin,
            needs_full_sync,
        }
    }

    /// Minimal data to bring a peer at `peer` up to the current vector.
    pub fn snapshot_since(&self, peer: &VersionVector) -> Diff {
        Diff::since(&self.state, peer, self.vector.clone())
    }

    pub fn full_snapshot(&self) -> Diff {
        Diff::full(&self.state, self.vector.clone())
    }

    pub fn to_stored(&self) -> StoredDocument {
        StoredDocument {
            state: self.state.clone(),
            vector: self.vector.clone(),
        }
    }

    /// Reclaim history every live peer has incorporated. `stable` is the
    /// meet of the attached sessions' observed vectors.
    pub fn collect(&mut self, stable: &VersionVector) -> CollectStats {
        let stable = stable.meet(&self.vector);
        let stats = self.state.collect(&stable);
        if stats.folded_deletes > 0 || stats.hollowed_runs > 0 {
            self.generation += 1;
            log::debug!(
                "doc {}: collected {} deletes, {} runs (horizon {})",
                self.id,
                stats.folded_deletes,
                stats.hollowed_runs,
                self.state.horizon()
            );
        }
        stats
    }
}
