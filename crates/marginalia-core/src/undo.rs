//! Annotation undo/redo.
//!
//! Every undo-stack entry carries the reversible-operation log drained from
//! the store when the entry was recorded. Undo and redo are the same move in
//! opposite directions: pop an entry, restore the reversal of its log, and
//! push the reversed log onto the other stack.
//!
//! | Step | Restores | Pushes |
//! |---|---|---|
//! | undo | `reverse(log)`, every `prev` | redo entry with `reverse(log)` |
//! | redo | `reverse(reverse(log))`, every `next` | undo entry with `log` |
//!
//! Only annotation state is restored here; document content undo belongs to
//! the host editor.

use tracing::debug;

use crate::action::History;
use crate::store::{AnnotationStore, ReversibleOp};

/// Reverse a log: last operation first, `prev`/`next` swapped.
#[must_use]
pub fn reverse_ops(ops: &[ReversibleOp]) -> Vec<ReversibleOp> {
    ops.iter().rev().map(ReversibleOp::reversed).collect()
}

/// One history entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackItem {
    pub meta: Vec<ReversibleOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Undo,
    Redo,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// Undo and redo stacks of annotation logs.
#[derive(Debug, Clone, Default)]
pub struct UndoStack {
    undo: Vec<StackItem>,
    redo: Vec<StackItem>,
}

impl UndoStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the log of one transaction.
    ///
    /// A new local entry invalidates the redo stack. Under
    /// [`History::NewEntry`] a transaction that neither logged anything nor
    /// changed the document records nothing.
    pub fn record(&mut self, history: History, ops: Vec<ReversibleOp>, doc_changed: bool) {
        match history {
            History::Skip => {}
            History::NewEntry => {
                if ops.is_empty() && !doc_changed {
                    return;
                }
                self.redo.clear();
                self.undo.push(StackItem { meta: ops });
            }
            History::MergeWithLast => {
                if ops.is_empty() {
                    return;
                }
                match self.undo.last_mut() {
                    Some(item) => item.meta.extend(ops),
                    None => {
                        self.redo.clear();
                        self.undo.push(StackItem { meta: ops });
                    }
                }
            }
        }
    }

    /// Undo the most recent entry. Returns the number of restored ops, or
    /// `None` if there is nothing to undo.
    pub fn undo(&mut self, store: &mut AnnotationStore) -> Option<usize> {
        self.step(store, Direction::Undo)
    }

    /// Redo the most recently undone entry.
    pub fn redo(&mut self, store: &mut AnnotationStore) -> Option<usize> {
        self.step(store, Direction::Redo)
    }

    fn step(&mut self, store: &mut AnnotationStore, direction: Direction) -> Option<usize> {
        let (from, to) = match direction {
            Direction::Undo => (&mut self.undo, &mut self.redo),
            Direction::Redo => (&mut self.redo, &mut self.undo),
        };
        let item = from.pop()?;
        let reversed = reverse_ops(&item.meta);
        store.restore(&reversed);
        let restored = reversed.len();
        to.push(StackItem { meta: reversed });
        debug!(direction = direction.as_str(), ops = restored, "history step");
        Some(restored)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorResolver;
    use crate::replica::{ReplicaId, ReplicatedDocument};
    use serde_json::json;

    fn fixture() -> (ReplicatedDocument, AnnotationStore, UndoStack) {
        let doc = ReplicatedDocument::from_html("<p>block 1</p><p>block 2</p>", ReplicaId(1)).unwrap();
        let store = AnnotationStore::new("annotations", ReplicaId(1));
        (doc, store, UndoStack::new())
    }

    #[test]
    fn reverse_swaps_and_reorders() {
        let a = ReversibleOp {
            key: "a".into(),
            prev: None,
            next: None,
        };
        let b = ReversibleOp { key: "b".into(), ..a.clone() };
        let reversed = reverse_ops(&[a, b]);
        assert_eq!(reversed[0].key, "b");
        assert_eq!(reverse_ops(&reverse_ops(&reversed)), reversed);
    }

    #[test]
    fn undo_then_redo_restores_exact_state() {
        let (doc, mut store, mut stack) = fixture();
        store.add(&doc, "a", 1, json!(1)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);
        store.update(&doc, "a", json!(2)).unwrap();
        store.add(&doc, "b", 10, json!(3)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);

        let before = store.snapshot();
        assert_eq!(stack.undo(&mut store), Some(2));
        assert_eq!(store.get("a").map(|e| e.data.clone()), Some(json!(1)));
        assert!(store.get("b").is_none());
        assert_eq!(stack.redo(&mut store), Some(2));
        assert_eq!(store.snapshot(), before);

        stack.undo(&mut store);
        stack.undo(&mut store);
        assert!(store.is_empty());
        assert_eq!(stack.undo(&mut store), None);
        assert_eq!(stack.redo_depth(), 2);
    }

    #[test]
    fn new_entry_clears_redo() {
        let (doc, mut store, mut stack) = fixture();
        store.add(&doc, "a", 1, json!(1)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);
        stack.undo(&mut store);
        assert!(stack.can_redo());
        store.add(&doc, "b", 1, json!(1)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);
        assert!(!stack.can_redo());
    }

    #[test]
    fn merge_folds_into_last_entry() {
        let (doc, mut store, mut stack) = fixture();
        store.add(&doc, "a", 1, json!(1)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);
        store.move_to(&doc, "a", 10).unwrap();
        stack.record(History::MergeWithLast, store.flush_log(), false);
        assert_eq!(stack.undo_depth(), 1);
        stack.undo(&mut store);
        assert!(store.is_empty());
    }

    #[test]
    fn skip_and_empty_logs_record_nothing() {
        let (doc, mut store, mut stack) = fixture();
        stack.record(History::NewEntry, Vec::new(), false);
        store.add(&doc, "a", 1, json!(1)).unwrap();
        stack.record(History::Skip, store.flush_log(), true);
        assert!(!stack.can_undo());
    }

    #[test]
    fn document_edits_open_entries_for_relocation_to_join() {
        let (doc, mut store, mut stack) = fixture();
        store.add(&doc, "a", 1, json!(1)).unwrap();
        stack.record(History::NewEntry, store.flush_log(), false);
        stack.record(History::NewEntry, Vec::new(), true);
        store.move_to(&doc, "a", 10).unwrap();
        stack.record(History::MergeWithLast, store.flush_log(), false);
        assert_eq!(stack.undo_depth(), 2);

        stack.undo(&mut store);
        assert_eq!(doc.to_absolute(&store.get("a").unwrap().pos), Some(1));
    }
}
