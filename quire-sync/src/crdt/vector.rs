//! Version vectors: replica → highest contiguous sequence incorporated.
//!
//! Vectors form a join-semilattice under pointwise max. `dominates` is
//! the causal "has seen at least" relation used by the causal buffer,
//! and `meet` (pointwise min) computes the GC horizon across sessions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an editing replica (one per client editor instance).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Replica → highest sequence number. Missing entries read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Set an entry. Zero removes it so equal vectors compare equal.
    pub fn set(&mut self, replica: ReplicaId, seq: u64) {
        if seq == 0 {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, seq);
        }
    }

    /// Raise an entry to `seq` if it is currently lower.
    pub fn observe(&mut self, replica: &ReplicaId, seq: u64) {
        if seq > self.get(replica) {
            self.entries.insert(replica.clone(), seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.entries.iter().map(|(r, s)| (r, *s))
    }

    /// Sum of all entries; a cheap monotone progress measure.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    /// `self ≥ other` pointwise.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.iter().all(|(r, s)| self.get(r) >= s)
    }

    /// Neither vector dominates the other.
    pub fn concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Pointwise max (lattice join).
    pub fn merge(&mut self, other: &VersionVector) {
        for (r, s) in other.iter() {
            self.observe(r, s);
        }
    }

    pub fn joined(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Pointwise min (lattice meet). Entries absent on either side drop out.
    pub fn meet(&self, other: &VersionVector) -> VersionVector {
        let mut out = VersionVector::new();
        for (r, s) in self.iter() {
            out.set(r.clone(), s.min(other.get(r)));
        }
        out
    }

    /// Entries of `self` that `other` has not yet reached.
    pub fn missing_from(&self, other: &VersionVector) -> Vec<(ReplicaId, u64)> {
        self.iter()
            .filter(|(r, s)| other.get(r) < *s)
            .map(|(r, s)| (r.clone(), s))
            .collect()
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (r, s)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}:{s}")?;
        }
        f.write_str("}")
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VersionVector {
    fn from(entries: [(&str, u64); N]) -> Self {
        let mut v = VersionVector::new();
        for (r, s) in entries {
            v.set(ReplicaId::from(r), s);
        }
        v
    }
}
