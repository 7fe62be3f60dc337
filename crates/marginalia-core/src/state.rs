//! Change classifier and annotation state machine.
//!
//! Every transaction is classified in strict priority order:
//!
//! 1. an explicit [`Action`] is applied to the store, then decorations are
//!    rebuilt;
//! 2. a remote-origin transaction rebuilds decorations from the store;
//! 3. a local edit without a structural tag maps existing decorations
//!    through the edit's position delta;
//! 4. a local edit with a structural tag leaves decorations untouched until
//!    the relocation pass that follows it.
//!
//! Rebuild failures are logged and counted, and the previous decorations are
//! kept; the next observed change retries.

use tracing::{debug, warn};

use crate::action::{Action, Origin, Transaction};
use crate::anchor::DocumentView;
use crate::decoration::{DecorationSet, recompute};
use crate::error::AnnotationError;
use crate::store::AnnotationStore;
use crate::telemetry::{AnnotationEvent, Telemetry};

/// Dispatch decision for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Action,
    Remote,
    Map,
    Suppressed,
}

/// Decide how `tr` affects decorations.
#[must_use]
pub const fn classify(tr: &Transaction) -> Classification {
    if tr.action.is_some() {
        Classification::Action
    } else if matches!(tr.origin, Origin::Remote) {
        Classification::Remote
    } else if tr.tag.is_some() {
        Classification::Suppressed
    } else {
        Classification::Map
    }
}

/// Store, current decorations and telemetry for one editor.
#[derive(Debug)]
pub struct AnnotationState {
    store: AnnotationStore,
    decorations: DecorationSet,
    telemetry: Telemetry,
}

impl AnnotationState {
    #[must_use]
    pub const fn new(store: AnnotationStore, telemetry: Telemetry) -> Self {
        Self {
            store,
            decorations: DecorationSet::empty(),
            telemetry,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut AnnotationStore {
        &mut self.store
    }

    #[must_use]
    pub const fn decorations(&self) -> &DecorationSet {
        &self.decorations
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub const fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    /// Apply `tr` against the post-transaction document.
    ///
    /// Returns the classification and whether the decoration set changed.
    ///
    /// # Errors
    ///
    /// Store errors from the transaction's action: `MissingTarget` for
    /// `update`, `MissingTargets` for `move-many` (after the other moves and
    /// a rebuild), `PositionOutOfRange` for positions past the end (for
    /// `move-many`, also after the valid moves and a rebuild).
    pub fn apply(
        &mut self,
        doc: &dyn DocumentView,
        tr: &Transaction,
    ) -> Result<(Classification, bool), AnnotationError> {
        let classification = classify(tr);
        let before = self.decorations.clone();
        match classification {
            Classification::Action => {
                if let Some(action) = &tr.action {
                    let outcome = self.apply_action(doc, action);
                    self.rebuild(doc);
                    outcome?;
                }
            }
            Classification::Remote => {
                self.telemetry.emit(AnnotationEvent::RemoteRecompute);
                self.rebuild(doc);
            }
            Classification::Map => {
                self.decorations = self.decorations.map(&tr.mapping);
            }
            Classification::Suppressed => {
                debug!(tag = ?tr.tag, "decoration mapping suppressed");
            }
        }
        Ok((classification, self.decorations != before))
    }

    fn apply_action(
        &mut self,
        doc: &dyn DocumentView,
        action: &Action,
    ) -> Result<(), AnnotationError> {
        let kind = action.kind();
        if !doc.is_bound() && !matches!(action, Action::Refresh) {
            self.telemetry.emit(AnnotationEvent::UnboundSkip { action: kind });
            return Ok(());
        }
        match action {
            Action::Add { id, pos, data } => {
                self.store.add(doc, id, *pos, data.clone())?;
            }
            Action::Update { id, data } => {
                self.store.update(doc, id, data.clone())?;
            }
            Action::Delete { id } => {
                self.store.delete(doc, id);
            }
            Action::Clear => {
                self.store.clear(doc);
            }
            Action::MoveMany { to_move } => {
                let report = self.store.move_many(doc, to_move)?;
                if !report.missing.is_empty() {
                    for id in &report.missing {
                        warn!(instance = %self.telemetry.instance(), id, "move target missing");
                        self.telemetry
                            .emit(AnnotationEvent::MoveTargetMissing { id: id.clone() });
                    }
                    self.telemetry.emit(AnnotationEvent::ActionApplied { action: kind });
                    return Err(AnnotationError::MissingTargets {
                        ids: report.missing,
                    });
                }
                if let Some(stale) = report.out_of_range.first() {
                    warn!(
                        instance = %self.telemetry.instance(),
                        skipped = report.out_of_range.len(),
                        "move targets past document end"
                    );
                    self.telemetry.emit(AnnotationEvent::ActionApplied { action: kind });
                    return Err(AnnotationError::PositionOutOfRange {
                        pos: stale.new_pos,
                        size: doc.size(),
                    });
                }
            }
            Action::Refresh => {}
        }
        self.telemetry.emit(AnnotationEvent::ActionApplied { action: kind });
        Ok(())
    }

    /// Rebuild decorations from the store. Failures keep the previous set.
    pub fn rebuild(&mut self, doc: &dyn DocumentView) {
        match recompute(doc, &self.store) {
            Ok(out) => {
                for id in &out.unresolved {
                    self.telemetry
                        .emit(AnnotationEvent::AnchorUnresolved { id: id.clone() });
                }
                self.telemetry.emit(AnnotationEvent::RecomputeFinished {
                    decorations: out.set.len(),
                    unresolved: out.unresolved.len(),
                });
                self.decorations = out.set;
            }
            Err(err) => {
                warn!(
                    instance = %self.telemetry.instance(),
                    code = %err.code(),
                    error = %err,
                    "decoration recompute failed"
                );
                self.telemetry.emit(AnnotationEvent::RecomputeFailed {
                    error: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::StructuralTag;
    use crate::mapping::{Mapping, StepMap};
    use crate::replica::{ReplicaId, ReplicatedDocument};
    use crate::store::MoveInstruction;
    use serde_json::json;

    const TWO: &str = "<h1>h</h1><p>block 1</p>";

    fn state() -> AnnotationState {
        AnnotationState::new(
            AnnotationStore::new("annotations", ReplicaId(1)),
            Telemetry::new("test", false),
        )
    }

    fn add(id: &str, pos: usize) -> Transaction {
        Transaction::action(Action::Add {
            id: id.into(),
            pos,
            data: json!(id),
        })
    }

    #[test]
    fn classification_priority() {
        let edit = Transaction::edit(StepMap::insertion(1, 1));
        assert_eq!(classify(&edit), Classification::Map);
        let tagged = edit.clone().with_tag(StructuralTag::SplitAtStart);
        assert_eq!(classify(&tagged), Classification::Suppressed);
        assert_eq!(classify(&Transaction::remote(Mapping::new())), Classification::Remote);

        let mut remote_with_action = Transaction::remote(Mapping::new());
        remote_with_action.action = Some(Action::Refresh);
        assert_eq!(classify(&remote_with_action), Classification::Action);
    }

    #[test]
    fn action_applies_and_rebuilds() {
        let doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        let (class, changed) = state.apply(&doc, &add("c1", 4)).unwrap();
        assert_eq!(class, Classification::Action);
        assert!(changed);
        assert_eq!(state.decorations().spans(), vec![(3, 12)]);
        assert_eq!(state.telemetry().snapshot().actions_applied, 1);
    }

    #[test]
    fn local_edit_maps_decorations() {
        let mut doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();
        let step = doc.insert_text(2, "hello").unwrap();
        let recomputes = state.telemetry().snapshot().recomputes;
        state.apply(&doc, &Transaction::edit(step)).unwrap();
        assert_eq!(state.decorations().spans(), vec![(8, 17)]);
        assert_eq!(state.telemetry().snapshot().recomputes, recomputes);
    }

    #[test]
    fn tagged_edit_suppresses_mapping() {
        let mut doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();
        let outcome = doc.split_block(4).unwrap();
        let tr = Transaction::edit(outcome.step_map).with_tag(StructuralTag::SplitAtStart);
        let (_, changed) = state.apply(&doc, &tr).unwrap();
        assert!(!changed);
        assert_eq!(state.decorations().spans(), vec![(3, 12)]);
    }

    #[test]
    fn unbound_document_skips_actions() {
        let doc = ReplicatedDocument::parse_html(TWO).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();
        assert!(state.store().is_empty());
        assert_eq!(state.telemetry().snapshot().unbound_skips, 1);
    }

    #[test]
    fn missing_move_targets_apply_the_rest() {
        let doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 1)).unwrap();
        let tr = Transaction::action(Action::MoveMany {
            to_move: vec![
                MoveInstruction { id: "ghost".into(), new_pos: 4 },
                MoveInstruction { id: "c1".into(), new_pos: 4 },
            ],
        });
        let err = state.apply(&doc, &tr).unwrap_err();
        assert!(matches!(err, AnnotationError::MissingTargets { ref ids } if ids == &["ghost"]));
        assert_eq!(state.decorations().spans(), vec![(3, 12)]);
        assert_eq!(state.telemetry().snapshot().missing_move_targets, 1);
    }

    #[test]
    fn out_of_range_move_does_not_drop_later_moves() {
        let doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();
        state.apply(&doc, &add("c2", 4)).unwrap();
        let tr = Transaction::action(Action::MoveMany {
            to_move: vec![
                MoveInstruction { id: "c1".into(), new_pos: 30 },
                MoveInstruction { id: "c2".into(), new_pos: 1 },
            ],
        });
        let err = state.apply(&doc, &tr).unwrap_err();
        assert!(matches!(err, AnnotationError::PositionOutOfRange { pos: 30, size: 12 }));
        assert_eq!(state.decorations().get("c2").map(|d| (d.start, d.end)), Some((0, 3)));
        assert_eq!(state.decorations().get("c1").map(|d| (d.start, d.end)), Some((3, 12)));
    }

    #[test]
    fn failed_rebuild_keeps_previous_decorations() {
        let doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();

        let empty = ReplicatedDocument::new(ReplicaId(1));
        state.store_mut().add(&empty, "stray", 0, json!(0)).unwrap();
        state.rebuild(&empty);
        assert_eq!(state.decorations().spans(), vec![(3, 12)]);
        assert_eq!(state.telemetry().snapshot().recompute_failures, 1);
    }

    #[test]
    fn remote_transaction_rebuilds() {
        let mut doc = ReplicatedDocument::from_html(TWO, ReplicaId(1)).unwrap();
        let mut state = state();
        state.apply(&doc, &add("c1", 4)).unwrap();
        doc.split_block(6).unwrap();
        state.apply(&doc, &Transaction::remote(Mapping::new())).unwrap();
        assert_eq!(state.decorations().spans(), vec![(3, 7)]);
        assert_eq!(state.telemetry().snapshot().remote_recomputes, 1);
    }
}
