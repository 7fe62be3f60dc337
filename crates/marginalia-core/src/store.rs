//! Annotation store: the replicated map of annotations plus the
//! reversible-operation log consumed by undo/redo.
//!
//! The store is the only writer of annotation state. Every mutation records
//! a [`ReversibleOp`] holding the entry before and after the write; the log
//! is drained with [`AnnotationStore::flush_log`] and replayed with
//! [`AnnotationStore::restore`].
//!
//! Operations take the document they resolve positions against as an
//! explicit argument. On a document that is not bound to a replica every
//! mutating operation is a no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::anchor::{Anchor, AnchorResolver, DocumentView};
use crate::error::AnnotationError;
use crate::replica::{LwwMap, MapBatch, ReplicaId};

// ---------------------------------------------------------------------------
// Entries and log records
// ---------------------------------------------------------------------------

/// Persisted form of one annotation. This is the wire format of the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub id: String,
    pub pos: Anchor,
    pub data: Value,
}

/// One logged store mutation.
///
/// Applying `next` replays the mutation; applying `prev` undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversibleOp {
    pub key: String,
    pub prev: Option<AnnotationEntry>,
    pub next: Option<AnnotationEntry>,
}

impl ReversibleOp {
    /// The same record with `prev` and `next` swapped.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            key: self.key.clone(),
            prev: self.next.clone(),
            next: self.prev.clone(),
        }
    }
}

/// Per-annotation view handed to the decoration sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSummary {
    pub id: String,
    pub data: Value,
    /// Resolved absolute position; `None` while the anchor is unresolved.
    pub pos: Option<usize>,
}

/// Relocation request: re-anchor `id` at `new_pos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveInstruction {
    pub id: String,
    pub new_pos: usize,
}

/// Outcome of [`AnnotationStore::move_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub moved: usize,
    /// Ids that were not live; every other move was applied.
    pub missing: Vec<String>,
    /// Moves whose target position was past the end, left unapplied.
    pub out_of_range: Vec<MoveInstruction>,
}

/// Serialized store contents, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entries: BTreeMap<String, AnnotationEntry>,
}

// ---------------------------------------------------------------------------
// AnnotationStore
// ---------------------------------------------------------------------------

/// Replicated annotation map with a reversible-operation log.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    map: LwwMap<AnnotationEntry>,
    log: Vec<ReversibleOp>,
}

impl AnnotationStore {
    /// Empty store writing under the map namespace `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            map: LwwMap::new(field, replica),
            log: Vec::new(),
        }
    }

    pub const fn bind(&mut self, replica: ReplicaId) {
        self.map.bind(replica);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&AnnotationEntry> {
        self.map.get(id)
    }

    /// Live entries ordered by id.
    pub fn entries(&self) -> impl Iterator<Item = &AnnotationEntry> {
        self.map.iter().map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.map.keys().map(str::to_string).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn write(&mut self, key: &str, next: Option<AnnotationEntry>) {
        let prev = self.map.get(key).cloned();
        match &next {
            Some(entry) => self.map.set(key, entry.clone()),
            None => {
                self.map.remove(key);
            }
        }
        self.log.push(ReversibleOp {
            key: key.to_string(),
            prev,
            next,
        });
    }

    fn anchor_for(
        doc: &dyn DocumentView,
        pos: usize,
    ) -> Result<Option<Anchor>, AnnotationError> {
        match doc.to_anchor(pos) {
            Ok(anchor) => Ok(Some(anchor)),
            Err(AnnotationError::Unbound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Anchor an annotation at `pos`.
    ///
    /// Writes are upserts keyed by `id`: a live entry with the same id is
    /// replaced, and the logged op keeps it as `prev` so undo restores it.
    /// Returns `false` without writing when the document is unbound.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::PositionOutOfRange`] if `pos` is past the end.
    pub fn add(
        &mut self,
        doc: &dyn DocumentView,
        id: &str,
        pos: usize,
        data: Value,
    ) -> Result<bool, AnnotationError> {
        let Some(anchor) = Self::anchor_for(doc, pos)? else {
            debug!(id, "add skipped: document unbound");
            return Ok(false);
        };
        if self.map.get(id).is_some() {
            debug!(id, pos, "add replaces live annotation with the same id");
        }
        self.write(
            id,
            Some(AnnotationEntry {
                id: id.to_string(),
                pos: anchor,
                data,
            }),
        );
        debug!(id, pos, "annotation added");
        Ok(true)
    }

    /// Replace the payload of `id`, keeping its anchor.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::MissingTarget`] if `id` is not live.
    pub fn update(
        &mut self,
        doc: &dyn DocumentView,
        id: &str,
        data: Value,
    ) -> Result<bool, AnnotationError> {
        let current = self.live(id)?;
        if !doc.is_bound() {
            return Ok(false);
        }
        self.write(id, Some(AnnotationEntry { data, ..current }));
        debug!(id, "annotation updated");
        Ok(true)
    }

    /// Remove `id`. Returns whether it was live.
    pub fn delete(&mut self, doc: &dyn DocumentView, id: &str) -> bool {
        if !doc.is_bound() || self.map.get(id).is_none() {
            return false;
        }
        self.write(id, None);
        debug!(id, "annotation deleted");
        true
    }

    /// Remove every annotation in one replicated batch. Returns the count.
    pub fn clear(&mut self, doc: &dyn DocumentView) -> usize {
        if !doc.is_bound() {
            return 0;
        }
        let ids = self.ids();
        self.transact(|store| {
            for id in &ids {
                store.write(id, None);
            }
        });
        debug!(removed = ids.len(), "annotations cleared");
        ids.len()
    }

    /// Re-anchor `id` at `new_pos`.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::MissingTarget`] if `id` is not live, or
    /// [`AnnotationError::PositionOutOfRange`] if `new_pos` is past the end.
    pub fn move_to(
        &mut self,
        doc: &dyn DocumentView,
        id: &str,
        new_pos: usize,
    ) -> Result<bool, AnnotationError> {
        let current = self.live(id)?;
        let Some(anchor) = Self::anchor_for(doc, new_pos)? else {
            return Ok(false);
        };
        self.write(
            id,
            Some(AnnotationEntry {
                pos: anchor,
                ..current
            }),
        );
        debug!(id, new_pos, "annotation moved");
        Ok(true)
    }

    /// Apply a batch of moves as one replicated change.
    ///
    /// Missing ids and out-of-range targets are collected in the report
    /// rather than aborting the batch; every other move is applied.
    ///
    /// # Errors
    ///
    /// Any other anchoring error, returned after the rest of the batch has
    /// been applied.
    pub fn move_many(
        &mut self,
        doc: &dyn DocumentView,
        moves: &[MoveInstruction],
    ) -> Result<MoveReport, AnnotationError> {
        let mut report = MoveReport::default();
        let mut first_error = None;
        self.transact(|store| {
            for instruction in moves {
                match store.move_to(doc, &instruction.id, instruction.new_pos) {
                    Ok(true) => report.moved += 1,
                    Ok(false) => {}
                    Err(AnnotationError::MissingTarget { id }) => report.missing.push(id),
                    Err(AnnotationError::PositionOutOfRange { .. }) => {
                        report.out_of_range.push(instruction.clone());
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        });
        first_error.map_or(Ok(report), Err)
    }

    /// Group every write made by `f` into one replicated batch.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let outermost = self.map.begin();
        let result = f(self);
        if outermost {
            self.map.commit();
        }
        result
    }

    fn live(&self, id: &str) -> Result<AnnotationEntry, AnnotationError> {
        self.map
            .get(id)
            .cloned()
            .ok_or_else(|| AnnotationError::MissingTarget { id: id.to_string() })
    }

    // -----------------------------------------------------------------------
    // Log
    // -----------------------------------------------------------------------

    /// Drain the reversible-operation log accumulated since the last flush.
    pub fn flush_log(&mut self) -> Vec<ReversibleOp> {
        std::mem::take(&mut self.log)
    }

    /// Operations logged since the last flush.
    #[must_use]
    pub fn pending_log(&self) -> &[ReversibleOp] {
        &self.log
    }

    /// Replay `ops` forward by applying each `next` value.
    ///
    /// Restoring does not log; the caller owns the history bookkeeping.
    pub fn restore(&mut self, ops: &[ReversibleOp]) {
        self.transact(|store| {
            for op in ops {
                match &op.next {
                    Some(entry) => store.map.set(op.key.clone(), entry.clone()),
                    None => {
                        store.map.remove(&op.key);
                    }
                }
            }
        });
        debug!(ops = ops.len(), "store restored from log");
    }

    // -----------------------------------------------------------------------
    // Persistence and replication
    // -----------------------------------------------------------------------

    /// Live contents keyed by id.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entries: self
                .map
                .iter()
                .map(|(key, entry)| (key.to_string(), entry.clone()))
                .collect(),
        }
    }

    /// JSON form of [`Self::snapshot`].
    ///
    /// # Errors
    ///
    /// [`AnnotationError::Codec`] if a payload cannot be serialized.
    pub fn serialize(&self) -> Result<String, AnnotationError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Make the live contents equal to `snapshot`. Differences are logged.
    pub fn restore_snapshot(&mut self, snapshot: &StoreSnapshot) {
        let stale: BTreeSet<String> = self
            .map
            .keys()
            .filter(|key| !snapshot.entries.contains_key(*key))
            .map(str::to_string)
            .collect();
        self.transact(|store| {
            for key in &stale {
                store.write(key, None);
            }
            for (key, entry) in &snapshot.entries {
                if store.map.get(key) != Some(entry) {
                    store.write(key, Some(entry.clone()));
                }
            }
        });
    }

    /// Parse JSON produced by [`Self::serialize`] and restore it.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::Codec`] on malformed input.
    pub fn restore_json(&mut self, json: &str) -> Result<(), AnnotationError> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        self.restore_snapshot(&snapshot);
        Ok(())
    }

    /// Merge a remote batch. Returns the ids whose value changed.
    pub fn apply_batch(&mut self, batch: &MapBatch<AnnotationEntry>) -> Vec<String> {
        self.map.apply_batch(batch)
    }

    /// Drain locally produced batches.
    pub fn take_batches(&mut self) -> Vec<MapBatch<AnnotationEntry>> {
        self.map.take_batches()
    }

    /// Full register state for bootstrapping another replica.
    #[must_use]
    pub fn full_state(&self) -> MapBatch<AnnotationEntry> {
        self.map.full_state()
    }

    /// Summaries of every live annotation resolved against `doc`.
    #[must_use]
    pub fn summarize(&self, doc: &dyn AnchorResolver) -> Vec<AnnotationSummary> {
        self.entries()
            .map(|entry| AnnotationSummary {
                id: entry.id.clone(),
                data: entry.data.clone(),
                pos: doc.to_absolute(&entry.pos),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicatedDocument;
    use serde_json::json;

    const TWO: &str = "<h1>h</h1><p>block 1</p>";

    fn setup() -> (ReplicatedDocument, AnnotationStore) {
        let doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        (doc, AnnotationStore::new("annotations", ReplicaId(1)))
    }

    #[test]
    fn add_anchors_entry_and_logs() {
        let (doc, mut store) = setup();
        assert!(store.add(&doc, "c1", 4, json!({"note": "x"})).unwrap());
        let entry = store.get("c1").unwrap();
        assert_eq!(doc.to_absolute(&entry.pos), Some(4));
        let log = store.flush_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].prev.is_none());
        assert!(store.flush_log().is_empty());
    }

    #[test]
    fn unbound_document_makes_mutations_noops() {
        let doc = ReplicatedDocument::parse_html(TWO).unwrap();
        let mut store = AnnotationStore::new("annotations", ReplicaId(0));
        assert!(!store.add(&doc, "c1", 4, json!(1)).unwrap());
        assert!(store.is_empty());
        assert!(store.pending_log().is_empty());
        assert_eq!(store.clear(&doc), 0);
    }

    #[test]
    fn add_past_end_is_an_error() {
        let (doc, mut store) = setup();
        assert!(matches!(
            store.add(&doc, "c1", 99, json!(1)),
            Err(AnnotationError::PositionOutOfRange { pos: 99, size: 12 })
        ));
    }

    #[test]
    fn delete_is_tolerant_move_is_not() {
        let (doc, mut store) = setup();
        assert!(!store.delete(&doc, "ghost"));
        assert!(matches!(
            store.move_to(&doc, "ghost", 4),
            Err(AnnotationError::MissingTarget { .. })
        ));
        assert!(matches!(
            store.update(&doc, "ghost", json!(1)),
            Err(AnnotationError::MissingTarget { .. })
        ));
    }

    #[test]
    fn update_keeps_anchor() {
        let (doc, mut store) = setup();
        store.add(&doc, "c1", 5, json!("old")).unwrap();
        let anchor = store.get("c1").unwrap().pos;
        store.update(&doc, "c1", json!("new")).unwrap();
        let entry = store.get("c1").unwrap();
        assert_eq!(entry.pos, anchor);
        assert_eq!(entry.data, json!("new"));
    }

    #[test]
    fn move_many_applies_valid_moves_and_reports_missing() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 4, json!(1)).unwrap();
        store.add(&doc, "b", 4, json!(2)).unwrap();
        store.take_batches();
        let report = store
            .move_many(
                &doc,
                &[
                    MoveInstruction { id: "a".into(), new_pos: 1 },
                    MoveInstruction { id: "x".into(), new_pos: 1 },
                    MoveInstruction { id: "b".into(), new_pos: 2 },
                ],
            )
            .unwrap();
        assert_eq!(report.moved, 2);
        assert_eq!(report.missing, vec!["x".to_string()]);
        assert_eq!(doc.to_absolute(&store.get("b").unwrap().pos), Some(2));
        assert_eq!(store.take_batches().len(), 1);
    }

    #[test]
    fn move_many_skips_out_of_range_targets_and_applies_the_rest() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 4, json!(1)).unwrap();
        store.add(&doc, "b", 4, json!(2)).unwrap();
        let stale = MoveInstruction { id: "a".into(), new_pos: 40 };
        let report = store
            .move_many(
                &doc,
                &[stale.clone(), MoveInstruction { id: "b".into(), new_pos: 8 }],
            )
            .unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(report.out_of_range, vec![stale]);
        assert!(report.missing.is_empty());
        assert_eq!(doc.to_absolute(&store.get("a").unwrap().pos), Some(4));
        assert_eq!(doc.to_absolute(&store.get("b").unwrap().pos), Some(8));
    }

    #[test]
    fn add_with_live_id_replaces_and_undo_restores() {
        let (doc, mut store) = setup();
        store.add(&doc, "c1", 4, json!("first")).unwrap();
        let first = store.get("c1").cloned().unwrap();
        store.flush_log();

        assert!(store.add(&doc, "c1", 8, json!("second")).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("c1").map(|e| e.data.clone()), Some(json!("second")));

        let log = store.flush_log();
        assert_eq!(log[0].prev.as_ref(), Some(&first));
        let undo: Vec<ReversibleOp> = log.iter().rev().map(ReversibleOp::reversed).collect();
        store.restore(&undo);
        assert_eq!(store.get("c1"), Some(&first));
    }

    #[test]
    fn clear_is_one_batch_and_logs_each_entry() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 4, json!(1)).unwrap();
        store.add(&doc, "b", 5, json!(2)).unwrap();
        store.flush_log();
        store.take_batches();
        assert_eq!(store.clear(&doc), 2);
        assert!(store.is_empty());
        assert_eq!(store.flush_log().len(), 2);
        assert_eq!(store.take_batches().len(), 1);
    }

    #[test]
    fn restore_replays_without_logging() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 4, json!(1)).unwrap();
        store.delete(&doc, "a");
        let log = store.flush_log();

        let undo: Vec<ReversibleOp> = log.iter().rev().map(ReversibleOp::reversed).collect();
        store.restore(&undo);
        assert!(store.is_empty());
        assert!(store.pending_log().is_empty());

        store.restore(&log);
        assert!(store.is_empty());
        store.restore(&log[..1]);
        assert_eq!(store.get("a").map(|e| e.data.clone()), Some(json!(1)));
    }

    #[test]
    fn serialize_restore_round_trip() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 4, json!({"k": [1, 2]})).unwrap();
        store.add(&doc, "b", 12, json!(null)).unwrap();
        let json = store.serialize().unwrap();

        let mut other = AnnotationStore::new("annotations", ReplicaId(2));
        other.add(&doc, "stale", 1, json!(0)).unwrap();
        other.restore_json(&json).unwrap();
        assert_eq!(other.snapshot(), store.snapshot());
        assert_eq!(other.serialize().unwrap(), json);
    }

    #[test]
    fn wire_format_uses_id_pos_data() {
        let (doc, mut store) = setup();
        store.add(&doc, "a", 12, json!("x")).unwrap();
        let value = serde_json::to_value(store.get("a").unwrap()).unwrap();
        assert_eq!(value, json!({"id": "a", "pos": {"type": "doc-end"}, "data": "x"}));
    }

    #[test]
    fn remote_batches_converge() {
        let (doc, mut a) = setup();
        let mut b = AnnotationStore::new("annotations", ReplicaId(2));
        a.add(&doc, "c1", 4, json!(1)).unwrap();
        for batch in a.take_batches() {
            assert_eq!(b.apply_batch(&batch), vec!["c1".to_string()]);
        }
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(b.summarize(&doc)[0].pos, Some(4));
    }
}
