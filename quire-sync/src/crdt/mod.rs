//! Replicated document state and its merge semantics.
//!
//! Pure data structures, no I/O:
//!
//! - [`vector`] — version vectors (replica → highest contiguous seq)
//! - [`text`] — the text CRDT (`TextState`) and its join
//! - [`replica`] — a local editing replica producing [`Update`]s
//!
//! An [`Update`] is what a client submits; a [`Diff`] is what the server
//! sends back out. Both are plain serde values carried by the wire
//! protocol.

pub mod replica;
pub mod text;
pub mod vector;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use replica::Replica;
pub use text::{CharId, CollectStats, OpId, Operation, RunContent, TextState};
pub use vector::{ReplicaId, VersionVector};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("sequence numbers start at 1")]
    ZeroSequence,
    #[error("update {replica}:{seq} claims to depend on its own future ({depends})")]
    SelfDependency {
        replica: ReplicaId,
        seq: u64,
        depends: u64,
    },
    #[error("insert carries no text")]
    EmptyInsert,
    #[error("delete names no characters")]
    EmptyDelete,
    #[error("collected runs cannot be submitted as edits")]
    HollowInsert,
    #[error("position {pos} out of bounds (length {len})")]
    PositionOutOfBounds { pos: usize, len: usize },
    #[error("lamport clock exhausted")]
    ClockOverflow,
    #[error("lamport clock {lamport} is ahead of anything observed (at most {ceiling})")]
    ClockAhead { lamport: u64, ceiling: u64 },
}

/// An immutable edit from one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub replica: ReplicaId,
    pub seq: u64,
    pub payload: Operation,
    /// Everything the producer had observed when it made the edit.
    pub depends_on: VersionVector,
}

impl Update {
    pub fn new(
        replica: impl Into<ReplicaId>,
        seq: u64,
        payload: Operation,
        depends_on: VersionVector,
    ) -> Self {
        Self {
            replica: replica.into(),
            seq,
            payload,
            depends_on,
        }
    }

    pub fn id(&self) -> OpId {
        OpId::new(self.replica.clone(), self.seq)
    }

    /// Structural checks that do not need document state.
    pub fn validate(&self) -> Result<(), CrdtError> {
        if self.seq == 0 {
            return Err(CrdtError::ZeroSequence);
        }
        let own = self.depends_on.get(&self.replica);
        if own >= self.seq {
            return Err(CrdtError::SelfDependency {
                replica: self.replica.clone(),
                seq: self.seq,
                depends: own,
            });
        }
        match &self.payload {
            Operation::Insert { lamport, .. } if *lamport == u64::MAX => Err(CrdtError::ClockOverflow),
            Operation::Insert {
                content: RunContent::Hollow(_),
                ..
            } => Err(CrdtError::HollowInsert),
            Operation::Insert {
                content: RunContent::Text(text),
                ..
            } if text.is_empty() => Err(CrdtError::EmptyInsert),
            Operation::Delete { targets } if targets.is_empty() => Err(CrdtError::EmptyDelete),
            _ => Ok(()),
        }
    }
}

/// State a peer needs to catch up, plus the sender's vector afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub ops: Vec<(OpId, Operation)>,
    /// Set only on full-state diffs.
    pub tombstones: Vec<CharId>,
    pub horizon: VersionVector,
    pub vector: VersionVector,
    pub full: bool,
}

impl Diff {
    /// Diff carrying a single freshly applied operation.
    pub fn single(id: OpId, op: Operation, vector: VersionVector) -> Self {
        Self {
            ops: vec![(id, op)],
            vector,
            ..Default::default()
        }
    }

    /// Everything in `state`.
    pub fn full(state: &TextState, vector: VersionVector) -> Self {
        Self {
            ops: state.ops().map(|(id, op)| (id.clone(), op.clone())).collect(),
            tombstones: state.tombstones().cloned().collect(),
            horizon: state.horizon().clone(),
            vector,
            full: true,
        }
    }

    /// Minimal diff from `peer`, falling back to full state when the peer
    /// is empty or behind the collection horizon.
    pub fn since(state: &TextState, peer: &VersionVector, vector: VersionVector) -> Self {
        if peer.is_empty() {
            return Self::full(state, vector);
        }
        match state.delta_since(peer) {
            Some(ops) => Self {
                ops,
                vector,
                ..Default::default()
            },
            None => Self::full(state, vector),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.tombstones.is_empty()
    }

    /// Join this diff into `state`.
    pub fn apply_to(&self, state: &mut TextState) {
        if self.full {
            state.absorb(
                self.ops.iter().cloned(),
                self.tombstones.iter().cloned(),
                &self.horizon,
            );
        } else {
            for (id, op) in &self.ops {
                state.integrate(id.clone(), op.clone());
            }
        }
    }
}
