//! Replicated text: an RGA-style operation log with tombstones.
//!
//! The state is a set of insert runs and deletes keyed by `OpId`. Joining
//! two states is set union plus pointwise max of the GC horizon, so it is
//! commutative, associative and idempotent. The visible text is a pure
//! function of the state, which makes convergence independent of the
//! order in which operations were received.
//!
//! ```text
//!   root ─┬─ "He" (lamport 2, replica b)
//!         └─ "Hi" (lamport 1, replica a)   siblings: lamport desc,
//!                                          then replica, then seq
//! ```
//!
//! Each character of an insert run is a tree node: the first character
//! hangs off the run's anchor (`after`), each following character hangs
//! off its predecessor. Rendering is a pre-order walk.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::vector::{ReplicaId, VersionVector};

/// Identity of one operation: the producing replica and its sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl OpId {
    pub fn new(replica: impl Into<ReplicaId>, seq: u64) -> Self {
        Self {
            replica: replica.into(),
            seq,
        }
    }

    /// Covered by `vector`, i.e. already incorporated by whoever holds it.
    pub fn covered_by(&self, vector: &VersionVector) -> bool {
        self.seq <= vector.get(&self.replica)
    }
}

/// One character position: offset into an insert run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CharId {
    pub op: OpId,
    pub offset: u32,
}

impl CharId {
    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }
}

/// Characters carried by an insert run.
///
/// `Hollow` is what a run becomes once every character is deleted and the
/// deletion is stable; it keeps the run's shape so anchors into it stay
/// valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunContent {
    Text(String),
    Hollow(u32),
}

impl RunContent {
    pub fn len(&self) -> u32 {
        match self {
            RunContent::Text(s) => s.chars().count() as u32,
            RunContent::Hollow(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hollow absorbs text of the same run.
    fn join(&mut self, other: &RunContent) {
        if let RunContent::Hollow(n) = other {
            *self = RunContent::Hollow(*n);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        /// Character this run is placed after; `None` is the document start.
        after: Option<CharId>,
        lamport: u64,
        content: RunContent,
    },
    Delete {
        targets: Vec<CharId>,
    },
}

impl Operation {
    pub fn insert(after: Option<CharId>, lamport: u64, text: impl Into<String>) -> Self {
        Operation::Insert {
            after,
            lamport,
            content: RunContent::Text(text.into()),
        }
    }

    pub fn delete(targets: Vec<CharId>) -> Self {
        Operation::Delete { targets }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete { .. })
    }
}

/// Result of a [`TextState::collect`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub folded_deletes: usize,
    pub hollowed_runs: usize,
}

/// The replicated document value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextState {
    ops: BTreeMap<OpId, Operation>,
    /// Targets of deletes that were folded out of `ops`.
    tombstones: BTreeSet<CharId>,
    /// Every delete at or below this vector lives in `tombstones`.
    horizon: VersionVector,
}

struct Node {
    id: CharId,
    lamport: u64,
    ch: Option<char>,
}

impl TextState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn horizon(&self) -> &VersionVector {
        &self.horizon
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn ops(&self) -> impl Iterator<Item = (&OpId, &Operation)> {
        self.ops.iter()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &CharId> {
        self.tombstones.iter()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.ops.contains_key(id) || id.covered_by(&self.horizon)
    }

    /// Add one operation. Returns whether the state changed.
    pub fn integrate(&mut self, id: OpId, op: Operation) -> bool {
        match op {
            Operation::Delete { targets } if id.covered_by(&self.horizon) => {
                let before = self.tombstones.len();
                self.tombstones.extend(targets);
                self.tombstones.len() != before
            }
            Operation::Insert {
                after,
                lamport,
                content,
            } => match self.ops.get_mut(&id) {
                Some(Operation::Insert {
                    content: existing, ..
                }) => {
                    let before = existing.clone();
                    existing.join(&content);
                    *existing != before
                }
                Some(Operation::Delete { .. }) => false,
                None => {
                    self.ops.insert(
                        id,
                        Operation::Insert {
                            after,
                            lamport,
                            content,
                        },
                    );
                    true
                }
            },
            delete => {
                if self.ops.contains_key(&id) {
                    return false;
                }
                self.ops.insert(id, delete);
                true
            }
        }
    }

    /// Lattice join.
    pub fn join(&mut self, other: &TextState) {
        for (id, op) in &other.ops {
            self.integrate(id.clone(), op.clone());
        }
        self.tombstones.extend(other.tombstones.iter().cloned());
        self.horizon.merge(&other.horizon);
        self.normalize();
    }

    /// Join with an explicit horizon and tombstone set (full-state sync).
    pub fn absorb(
        &mut self,
        ops: impl IntoIterator<Item = (OpId, Operation)>,
        tombstones: impl IntoIterator<Item = CharId>,
        horizon: &VersionVector,
    ) {
        for (id, op) in ops {
            self.integrate(id, op);
        }
        self.tombstones.extend(tombstones);
        self.horizon.merge(horizon);
        self.normalize();
    }

    /// Fold deletes covered by the horizon into the tombstone set.
    fn normalize(&mut self) -> usize {
        let horizon = &self.horizon;
        let folded: Vec<OpId> = self
            .ops
            .iter()
            .filter(|(id, op)| op.is_delete() && id.covered_by(horizon))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &folded {
            if let Some(Operation::Delete { targets }) = self.ops.remove(id) {
                self.tombstones.extend(targets);
            }
        }
        folded.len()
    }

    /// Advance the horizon to `stable` and reclaim what it covers.
    ///
    /// `stable` must only cover operations every live peer has
    /// incorporated; peers behind the new horizon can no longer receive
    /// deltas and get full state instead.
    pub fn collect(&mut self, stable: &VersionVector) -> CollectStats {
        self.horizon.merge(stable);
        let folded_deletes = self.normalize();

        let mut hollowed_runs = 0;
        let horizon = self.horizon.clone();
        let tombstones = &self.tombstones;
        for (id, op) in self.ops.iter_mut() {
            if !id.covered_by(&horizon) {
                continue;
            }
            if let Operation::Insert { content, .. } = op {
                if let RunContent::Text(_) = content {
                    let len = content.len();
                    let all_deleted =
                        (0..len).all(|k| tombstones.contains(&CharId::new(id.clone(), k)));
                    if all_deleted {
                        *content = RunContent::Hollow(len);
                        hollowed_runs += 1;
                    }
                }
            }
        }

        CollectStats {
            folded_deletes,
            hollowed_runs,
        }
    }

    /// Operations a peer at `peer` is missing, or `None` when the peer is
    /// behind the horizon and needs full state.
    pub fn delta_since(&self, peer: &VersionVector) -> Option<Vec<(OpId, Operation)>> {
        if !peer.dominates(&self.horizon) {
            return None;
        }
        Some(
            self.ops
                .iter()
                .filter(|(id, _)| !id.covered_by(peer))
                .map(|(id, op)| (id.clone(), op.clone()))
                .collect(),
        )
    }

    /// Highest contiguous sequence per replica present in this state.
    pub fn version_vector(&self) -> VersionVector {
        let mut vector = self.horizon.clone();
        let mut by_replica: BTreeMap<&ReplicaId, Vec<u64>> = BTreeMap::new();
        for id in self.ops.keys() {
            by_replica.entry(&id.replica).or_default().push(id.seq);
        }
        for (replica, seqs) in by_replica {
            // BTreeMap keys arrive sorted by (replica, seq).
            let mut next = vector.get(replica);
            for seq in seqs {
                if seq <= next {
                    continue;
                }
                if seq == next + 1 {
                    next = seq;
                } else {
                    break;
                }
            }
            vector.set(replica.clone(), next);
        }
        vector
    }

    pub fn max_lamport(&self) -> u64 {
        self.ops
            .values()
            .filter_map(|op| match op {
                Operation::Insert { lamport, .. } => Some(*lamport),
                Operation::Delete { .. } => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn is_deleted(&self, id: &CharId, pending: &BTreeSet<&CharId>) -> bool {
        self.tombstones.contains(id) || pending.contains(id)
    }

    /// Visible characters in document order with their identities.
    pub fn visible(&self) -> Vec<(CharId, char)> {
        let pending: BTreeSet<&CharId> = self
            .ops
            .values()
            .filter_map(|op| match op {
                Operation::Delete { targets } => Some(targets.iter()),
                Operation::Insert { .. } => None,
            })
            .flatten()
            .collect();

        let mut children: HashMap<Option<CharId>, Vec<Node>> = HashMap::new();
        for (op_id, op) in &self.ops {
            let Operation::Insert {
                after,
                lamport,
                content,
            } = op
            else {
                continue;
            };
            let chars: Vec<Option<char>> = match content {
                RunContent::Text(s) => s.chars().map(Some).collect(),
                RunContent::Hollow(n) => vec![None; *n as usize],
            };
            for (k, ch) in chars.into_iter().enumerate() {
                let offset = k as u32;
                let parent = if offset == 0 {
                    after.clone()
                } else {
                    Some(CharId::new(op_id.clone(), offset - 1))
                };
                children.entry(parent).or_default().push(Node {
                    id: CharId::new(op_id.clone(), offset),
                    lamport: *lamport,
                    ch,
                });
            }
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| b.lamport.cmp(&a.lamport).then_with(|| a.id.cmp(&b.id)));
        }

        // Runs whose anchor has not arrived are unreachable from the root
        // and stay invisible until it does.
        let mut out = Vec::new();
        let mut stack: Vec<&Node> = children
            .get(&None)
            .map(|roots| roots.iter().rev().collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            if let Some(ch) = node.ch {
                if !self.is_deleted(&node.id, &pending) {
                    out.push((node.id.clone(), ch));
                }
            }
            if let Some(kids) = children.get(&Some(node.id.clone())) {
                stack.extend(kids.iter().rev());
            }
        }
        out
    }

    pub fn render(&self) -> String {
        self.visible().into_iter().map(|(_, ch)| ch).collect()
    }
}
