//! Replicated string-keyed map of LWW registers.
//!
//! Removal writes a tombstone register (`None`) so that a concurrent `set`
//! with an older stamp cannot resurrect the key. Writes are shipped to other
//! replicas as [`MapBatch`]es; [`LwwMap::transact`] groups every write made
//! inside the closure into a single batch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::lww::LwwRegister;
use super::{LamportClock, ReplicaId, Stamp};

/// One register write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapWrite<V> {
    pub key: String,
    pub register: LwwRegister<Option<V>>,
}

/// A group of writes that travels to other replicas as one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapBatch<V> {
    /// Namespace of the map that produced the batch.
    pub field: String,
    pub origin: ReplicaId,
    pub writes: Vec<MapWrite<V>>,
}

impl<V> MapBatch<V> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Last-writer-wins map keyed by string.
#[derive(Debug, Clone)]
pub struct LwwMap<V> {
    field: String,
    clock: LamportClock,
    registers: BTreeMap<String, LwwRegister<Option<V>>>,
    pending: Option<Vec<MapWrite<V>>>,
    outgoing: Vec<MapBatch<V>>,
}

impl<V: Clone> LwwMap<V> {
    /// Create an empty map namespaced under `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            field: field.into(),
            clock: LamportClock::new(replica),
            registers: BTreeMap::new(),
            pending: None,
            outgoing: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub const fn replica(&self) -> ReplicaId {
        self.clock.replica()
    }

    /// Stamp later writes with `replica`.
    pub const fn bind(&mut self, replica: ReplicaId) {
        self.clock.set_replica(replica);
    }

    /// Live value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&V> {
        self.registers.get(key).and_then(|reg| reg.value.as_ref())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.registers
            .iter()
            .filter_map(|(key, reg)| reg.value.as_ref().map(|value| (key.as_str(), value)))
    }

    /// Live keys in key order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.iter().map(|(key, _)| key)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.write(key.into(), Some(value));
    }

    /// Tombstone `key`. Returns the previous live value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let previous = self.get(key).cloned();
        if previous.is_some() {
            self.write(key.to_string(), None);
        }
        previous
    }

    fn write(&mut self, key: String, value: Option<V>) {
        let stamp = self.clock.tick();
        let register = LwwRegister::new(value, stamp);
        self.registers.insert(key.clone(), register.clone());
        let write = MapWrite { key, register };
        match self.pending.as_mut() {
            Some(pending) => pending.push(write),
            None => self.outgoing.push(MapBatch {
                field: self.field.clone(),
                origin: self.replica(),
                writes: vec![write],
            }),
        }
    }

    /// Run `f` with every write grouped into one outgoing batch.
    ///
    /// Nested calls join the outermost transaction.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let outermost = self.begin();
        let result = f(self);
        if outermost {
            self.commit();
        }
        result
    }

    /// Start grouping writes. Returns `false` if a transaction is already
    /// open, in which case the caller must not [`Self::commit`].
    pub fn begin(&mut self) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(Vec::new());
        true
    }

    /// Close the open transaction and queue its writes as one batch.
    pub fn commit(&mut self) {
        if let Some(writes) = self.pending.take()
            && !writes.is_empty()
        {
            self.outgoing.push(MapBatch {
                field: self.field.clone(),
                origin: self.replica(),
                writes,
            });
        }
    }

    /// Drain batches produced since the last call.
    pub fn take_batches(&mut self) -> Vec<MapBatch<V>> {
        std::mem::take(&mut self.outgoing)
    }

    /// Merge a remote batch. Returns the keys whose winning value changed.
    ///
    /// Batches from a different namespace are ignored.
    pub fn apply_batch(&mut self, batch: &MapBatch<V>) -> Vec<String> {
        if batch.field != self.field {
            return Vec::new();
        }
        let mut changed = Vec::new();
        for write in &batch.writes {
            self.clock.observe(write.register.stamp);
            let updated = match self.registers.get_mut(&write.key) {
                Some(existing) => existing.merge(&write.register),
                None => {
                    self.registers.insert(write.key.clone(), write.register.clone());
                    true
                }
            };
            if updated {
                changed.push(write.key.clone());
            }
        }
        changed
    }

    /// Every register, tombstones included, as one batch for bootstrapping a
    /// new replica.
    #[must_use]
    pub fn full_state(&self) -> MapBatch<V> {
        MapBatch {
            field: self.field.clone(),
            origin: self.replica(),
            writes: self
                .registers
                .iter()
                .map(|(key, register)| MapWrite {
                    key: key.clone(),
                    register: register.clone(),
                })
                .collect(),
        }
    }

    /// Highest stamp this map has produced or observed.
    #[must_use]
    pub fn latest_stamp(&self) -> Option<Stamp> {
        self.registers.values().map(|reg| reg.stamp).max()
    }
}
