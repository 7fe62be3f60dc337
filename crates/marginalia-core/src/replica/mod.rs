//! Reference replicated document and replicated map.
//!
//! These stand in for the CRDT collaborator a host editor would normally
//! provide (a shared text tree plus a shared key-value map). They are small,
//! deterministic, and speak the same interface the annotation components
//! consume: [`crate::anchor::DocumentView`] for the document and
//! [`LwwMap`] for persistence.
//!
//! # Identity and ordering
//!
//! Every replica owns a [`ReplicaId`]. Every write (a document item or a map
//! register) carries a Lamport [`Stamp`] `(clock, replica)`; the derived
//! ordering compares `clock` first and `replica` second, which gives a total
//! order that every replica agrees on.

pub mod document;
pub mod lww;
pub mod map;
pub mod sequence;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use document::{JoinOutcome, ReplicatedDocument, SplitOutcome};
pub use lww::LwwRegister;
pub use map::{LwwMap, MapBatch, MapWrite};
pub use sequence::{BlockKind, DocOp, Sequence, Token};

/// Stable identifier for one participant in a collaboration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Lamport timestamp. Also serves as the identity of a document item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    #[must_use]
    pub const fn new(clock: u64, replica: ReplicaId) -> Self {
        Self { clock, replica }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Identity of a document item (one token of the flattened sequence).
pub type ItemId = Stamp;

/// Per-replica Lamport clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LamportClock {
    replica: ReplicaId,
    counter: u64,
}

impl LamportClock {
    #[must_use]
    pub const fn new(replica: ReplicaId) -> Self {
        Self { replica, counter: 0 }
    }

    #[must_use]
    pub const fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Re-home the clock on another replica, keeping the counter.
    pub const fn set_replica(&mut self, replica: ReplicaId) {
        self.replica = replica;
    }

    /// Produce the next local stamp.
    pub const fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica)
    }

    /// Advance past a stamp observed from another replica.
    pub fn observe(&mut self, stamp: Stamp) {
        self.counter = self.counter.max(stamp.clock);
    }
}
