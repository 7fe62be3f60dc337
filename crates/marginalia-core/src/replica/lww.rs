//! Last-Writer-Wins (LWW) Register CRDT.
//!
//! Every key of the replicated annotation map is one register. The merge
//! uses a deterministic tie-breaking chain so that all replicas converge on
//! the same winner regardless of delivery order.
//!
//! # Tie-Breaking Chain
//!
//! Given two `LwwRegister<T>` values `a` and `b`:
//!
//! 1. **Lamport clock**: the higher `stamp.clock` wins.
//! 2. **Replica id**: if clocks are equal, the higher `stamp.replica` wins.
//!
//! A replica never reuses a stamp, so equal stamps mean the same write and
//! merging them is a no-op.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::Stamp;

// ---------------------------------------------------------------------------
// LwwRegister
// ---------------------------------------------------------------------------

/// A Last-Writer-Wins register holding a value of type `T`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    /// The current value of the register.
    pub value: T,
    /// Lamport stamp of the write that produced `value`.
    pub stamp: Stamp,
}

impl<T> LwwRegister<T> {
    /// Create a new LWW register with the given value and stamp.
    pub const fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }
}

impl<T: Clone> LwwRegister<T> {
    /// Merge another register into this one, keeping the winning value.
    ///
    /// Returns `true` when `self` changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        if self.wins_over(other) {
            false
        } else {
            self.value = other.value.clone();
            self.stamp = other.stamp;
            true
        }
    }

    /// Returns `true` if `self` wins over `other` in the tie-breaking chain.
    fn wins_over(&self, other: &Self) -> bool {
        // Step 1: Lamport clock (higher wins)
        match self.stamp.clock.cmp(&other.stamp.clock) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }

        // Step 2: replica id (higher wins; equal means the same write)
        self.stamp.replica >= other.stamp.replica
    }
}

impl<T: fmt::Display> fmt::Display for LwwRegister<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
