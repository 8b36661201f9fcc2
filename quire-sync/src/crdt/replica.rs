//! A local editing replica.
//!
//! Turns position-based edits into [`Update`]s with the right anchors,
//! Lamport clock and `depends_on`, and folds remote [`Diff`]s back in.

use super::text::{CharId, OpId, Operation, TextState};
use super::vector::{ReplicaId, VersionVector};
use super::{CrdtError, Diff, Update};

#[derive(Debug, Clone)]
pub struct Replica {
    id: ReplicaId,
    state: TextState,
    vector: VersionVector,
}

impl Replica {
    pub fn new(id: impl Into<ReplicaId>) -> Self {
        Self {
            id: id.into(),
            state: TextState::new(),
            vector: VersionVector::new(),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn state(&self) -> &TextState {
        &self.state
    }

    pub fn vector(&self) -> &VersionVector {
        &self.vector
    }

    pub fn text(&self) -> String {
        self.state.render()
    }

    pub fn len(&self) -> usize {
        self.state.visible().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `text` so that it starts at character position `pos`.
    pub fn insert(&mut self, pos: usize, text: &str) -> Result<Update, CrdtError> {
        if text.is_empty() {
            return Err(CrdtError::EmptyInsert);
        }
        let visible = self.state.visible();
        if pos > visible.len() {
            return Err(CrdtError::PositionOutOfBounds {
                pos,
                len: visible.len(),
            });
        }
        let after = pos.checked_sub(1).map(|i| visible[i].0.clone());
        let lamport = self
            .state
            .max_lamport()
            .checked_add(1)
            .ok_or(CrdtError::ClockOverflow)?;
        Ok(self.local(Operation::insert(after, lamport, text)))
    }

    /// Delete `len` characters starting at `pos`.
    pub fn delete(&mut self, pos: usize, len: usize) -> Result<Update, CrdtError> {
        if len == 0 {
            return Err(CrdtError::EmptyDelete);
        }
        let visible = self.state.visible();
        let end = pos.saturating_add(len);
        if end > visible.len() {
            return Err(CrdtError::PositionOutOfBounds {
                pos: end,
                len: visible.len(),
            });
        }
        let targets: Vec<CharId> = visible[pos..end].iter().map(|(id, _)| id.clone()).collect();
        Ok(self.local(Operation::delete(targets)))
    }

    fn local(&mut self, op: Operation) -> Update {
        let seq = self.vector.get(&self.id) + 1;
        let update = Update::new(self.id.clone(), seq, op, self.vector.clone());
        self.state
            .integrate(OpId::new(self.id.clone(), seq), update.payload.clone());
        self.vector.set(self.id.clone(), seq);
        update
    }

    /// Fold a diff received from the server.
    pub fn merge(&mut self, diff: &Diff) {
        diff.apply_to(&mut self.state);
        self.vector = self.state.version_vector();
    }

    /// Apply another replica's update directly (peer-to-peer or tests).
    pub fn apply(&mut self, update: &Update) {
        self.state.integrate(update.id(), update.payload.clone());
        self.vector = self.state.version_vector();
    }
}
