//! Reference editor host.
//!
//! [`Editor`] ties one replicated document to its annotation state, undo
//! stack, deferred-action queue and decoration sink, and speaks the sync
//! protocol with other editors. It is the transaction host the annotation
//! components expect: every change, local or remote, is funneled through
//! [`Editor::dispatch`] one transaction at a time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::action::{Action, History, Transaction};
use crate::anchor::DocumentView;
use crate::config::AnnotationConfig;
use crate::decoration::{Decoration, DecorationSet, DecorationSink};
use crate::error::AnnotationError;
use crate::mapping::{Mapping, StepMap};
use crate::replica::{BlockKind, DocOp, MapBatch, ReplicaId, ReplicatedDocument};
use crate::state::AnnotationState;
use crate::store::{AnnotationEntry, AnnotationStore, AnnotationSummary, MoveInstruction};
use crate::telemetry::{AnnotationEvent, EventSubscriber, Telemetry, TelemetrySnapshot};
use crate::undo::{Direction, UndoStack};

/// Everything one replica has to tell the others since its last message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub from: ReplicaId,
    pub doc: Vec<DocOp>,
    pub map: Vec<MapBatch<AnnotationEntry>>,
}

impl SyncMessage {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc.is_empty() && self.map.iter().all(MapBatch::is_empty)
    }
}

/// Current selection as absolute positions, `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub from: usize,
    pub to: usize,
}

impl Selection {
    #[must_use]
    pub const fn cursor(pos: usize) -> Self {
        Self { from: pos, to: pos }
    }

    #[must_use]
    pub const fn is_collapsed(&self) -> bool {
        self.from == self.to
    }
}

/// A document plus its annotations.
pub struct Editor {
    pub(crate) doc: ReplicatedDocument,
    pub(crate) state: AnnotationState,
    history: UndoStack,
    deferred: VecDeque<Transaction>,
    pub(crate) selection: Selection,
    sink: Option<Box<dyn DecorationSink>>,
    pub(crate) config: AnnotationConfig,
    ids: StdRng,
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("instance", &self.config.instance)
            .field("replica", &self.doc.replica())
            .field("annotations", &self.state.store().len())
            .field("decorations", &self.state.decorations().len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl Editor {
    fn from_parts(doc: ReplicatedDocument, config: AnnotationConfig) -> Self {
        let replica = doc.replica().unwrap_or(ReplicaId(0));
        let store = AnnotationStore::new(config.map_field.clone(), replica);
        let telemetry = Telemetry::new(config.instance.clone(), config.trace.events);
        Self {
            doc,
            state: AnnotationState::new(store, telemetry),
            history: UndoStack::new(),
            deferred: VecDeque::new(),
            selection: Selection::default(),
            sink: None,
            config,
            ids: StdRng::from_entropy(),
        }
    }

    /// Editor over `html`, bound to `replica`.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the markup cannot be parsed.
    pub fn with_content(
        html: &str,
        replica: ReplicaId,
        config: AnnotationConfig,
    ) -> Result<Self, AnnotationError> {
        let doc = ReplicatedDocument::from_html(html, replica)?;
        info!(instance = %config.instance, %replica, "editor bound");
        Ok(Self::from_parts(doc, config))
    }

    /// Editor over `html` that is not attached to a replica yet. Annotation
    /// mutations are no-ops until [`Self::bind`].
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the markup cannot be parsed.
    pub fn detached(html: &str, config: AnnotationConfig) -> Result<Self, AnnotationError> {
        let doc = ReplicatedDocument::parse_html(html)?;
        Ok(Self::from_parts(doc, config))
    }

    /// Attach the document and the annotation map to `replica`.
    pub fn bind(&mut self, replica: ReplicaId) {
        self.doc.bind(replica);
        self.state.store_mut().bind(replica);
        info!(instance = %self.config.instance, %replica, "editor bound");
        self.rebuild_now();
    }

    /// New editor on `replica` bootstrapped from this editor's full state.
    #[must_use]
    pub fn fork(&self, replica: ReplicaId, config: AnnotationConfig) -> Self {
        let mut editor = Self::from_parts(self.doc.fork(replica), config);
        editor.state.store_mut().apply_batch(&self.state.store().full_state());
        editor.rebuild_now();
        editor
    }

    /// Seed the generator used for annotation ids.
    pub fn seed_ids(&mut self, seed: u64) {
        self.ids = StdRng::seed_from_u64(seed);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn document(&self) -> &ReplicatedDocument {
        &self.doc
    }

    #[must_use]
    pub fn html(&self) -> String {
        self.doc.html()
    }

    #[must_use]
    pub const fn store(&self) -> &AnnotationStore {
        self.state.store()
    }

    #[must_use]
    pub const fn decorations(&self) -> &DecorationSet {
        self.state.decorations()
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<AnnotationSummary> {
        self.state.store().summarize(&self.doc)
    }

    #[must_use]
    pub const fn selection(&self) -> Selection {
        self.selection
    }

    #[must_use]
    pub const fn config(&self) -> &AnnotationConfig {
        &self.config
    }

    #[must_use]
    pub const fn telemetry(&self) -> TelemetrySnapshot {
        self.state.telemetry().snapshot()
    }

    #[must_use]
    pub const fn history(&self) -> &UndoStack {
        &self.history
    }

    /// Number of queued deferred transactions.
    #[must_use]
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn set_sink(&mut self, sink: impl DecorationSink + 'static) {
        self.sink = Some(Box::new(sink));
        self.notify();
    }

    pub fn subscribe(&mut self, subscriber: impl EventSubscriber + 'static) {
        self.state.telemetry_mut().subscribe(subscriber);
    }

    /// Place a collapsed cursor.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::PositionOutOfRange`] past the end.
    pub fn set_cursor(&mut self, pos: usize) -> Result<(), AnnotationError> {
        self.set_selection(pos, pos)
    }

    /// # Errors
    ///
    /// [`AnnotationError::PositionOutOfRange`] past the end.
    pub fn set_selection(&mut self, from: usize, to: usize) -> Result<(), AnnotationError> {
        let size = self.doc.size();
        let (from, to) = (from.min(to), from.max(to));
        if to > size {
            return Err(AnnotationError::PositionOutOfRange { pos: to, size });
        }
        self.selection = Selection { from, to };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run one transaction through the annotation state machine and record
    /// its annotation log on the undo stack.
    ///
    /// # Errors
    ///
    /// Propagates action errors (see [`AnnotationState::apply`]). The
    /// transaction's other effects are kept.
    pub fn dispatch(&mut self, tr: Transaction) -> Result<(), AnnotationError> {
        let outcome = self.state.apply(&self.doc, &tr);
        let ops = self.state.store_mut().flush_log();
        self.history.record(tr.history, ops, tr.doc_changed());
        let changed = match &outcome {
            Ok((classification, changed)) => {
                debug!(
                    instance = %self.config.instance,
                    ?classification,
                    changed,
                    "transaction dispatched"
                );
                *changed
            }
            Err(err) => {
                warn!(
                    instance = %self.config.instance,
                    code = %err.code(),
                    error = %err,
                    "transaction failed"
                );
                true
            }
        };
        if changed {
            self.notify();
        }
        outcome.map(|_| ())
    }

    /// Dispatch a local edit that has already been applied to the document.
    pub(crate) fn dispatch_edit(&mut self, step: StepMap) -> Result<(), AnnotationError> {
        self.clamp_selection();
        self.dispatch(Transaction::edit(step))
    }

    /// Queue (or, with deferral off, immediately dispatch) the follow-up
    /// action of a structural edit. It joins the edit's undo entry.
    pub(crate) fn schedule(&mut self, action: Action) -> Result<(), AnnotationError> {
        let tr = Transaction::action(action).with_history(History::MergeWithLast);
        if self.config.relocation.defer {
            self.deferred.push_back(tr);
            Ok(())
        } else {
            self.dispatch(tr)
        }
    }

    /// Dispatch every queued deferred transaction in order.
    ///
    /// Returns how many ran. Every transaction runs even if an earlier one
    /// fails.
    ///
    /// # Errors
    ///
    /// The first error encountered.
    pub fn run_deferred(&mut self) -> Result<usize, AnnotationError> {
        let mut ran = 0;
        let mut first_error = None;
        while let Some(tr) = self.deferred.pop_front() {
            ran += 1;
            if let Err(err) = self.dispatch(tr)
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        first_error.map_or(Ok(ran), Err)
    }

    fn notify(&mut self) {
        let summaries = self.state.store().summarize(&self.doc);
        if let Some(sink) = self.sink.as_mut() {
            sink.decorations_changed(self.state.decorations(), &summaries);
        }
    }

    fn rebuild_now(&mut self) {
        self.state.rebuild(&self.doc);
        self.notify();
    }

    fn clamp_selection(&mut self) {
        let size = self.doc.size();
        self.selection.from = self.selection.from.min(size);
        self.selection.to = self.selection.to.min(size);
    }

    // -----------------------------------------------------------------------
    // Document edits
    // -----------------------------------------------------------------------

    /// Type `text` at `pos` and leave the cursor after it.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] outside block content.
    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<(), AnnotationError> {
        let step = self.doc.insert_text(pos, text)?;
        self.selection = Selection::cursor(pos + text.chars().count());
        self.dispatch_edit(step)
    }

    /// Type at the cursor, replacing any selected range.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] outside block content.
    pub fn type_text(&mut self, text: &str) -> Result<(), AnnotationError> {
        let Selection { from, to } = self.selection;
        if from != to {
            self.delete_range(from, to)?;
        }
        self.insert_text(from, text)
    }

    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the range crosses blocks.
    pub fn delete_range(&mut self, from: usize, to: usize) -> Result<(), AnnotationError> {
        let step = self.doc.delete_range(from, to)?;
        self.selection = Selection::cursor(from);
        self.dispatch_edit(step)
    }

    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if `pos` is not between blocks.
    pub fn insert_block(
        &mut self,
        pos: usize,
        kind: BlockKind,
        text: &str,
    ) -> Result<(), AnnotationError> {
        let step = self.doc.insert_block(pos, kind, text)?;
        self.dispatch_edit(step)
    }

    // -----------------------------------------------------------------------
    // Annotation commands
    // -----------------------------------------------------------------------

    fn block_content_start_at_selection(&self) -> Result<usize, AnnotationError> {
        self.doc
            .enclosing_block(self.selection.from)
            .map(|block| block.content_start())
            .ok_or_else(|| {
                AnnotationError::InvalidEdit(format!(
                    "selection {} is not inside a block",
                    self.selection.from
                ))
            })
    }

    /// Annotate the block holding the selection under a generated id.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the selection is outside every
    /// block.
    pub fn add_annotation(&mut self, data: Value) -> Result<String, AnnotationError> {
        let id = self.ids.r#gen::<u32>().to_string();
        self.add_annotation_with_id(&id, data)?;
        Ok(id)
    }

    /// Annotate the block holding the selection under `id`.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the selection is outside every
    /// block.
    pub fn add_annotation_with_id(&mut self, id: &str, data: Value) -> Result<(), AnnotationError> {
        let pos = self.block_content_start_at_selection()?;
        self.dispatch(Transaction::action(Action::Add {
            id: id.to_string(),
            pos,
            data,
        }))
    }

    /// # Errors
    ///
    /// [`AnnotationError::MissingTarget`] if `id` is not live.
    pub fn update_annotation(&mut self, id: &str, data: Value) -> Result<(), AnnotationError> {
        self.dispatch(Transaction::action(Action::Update {
            id: id.to_string(),
            data,
        }))
    }

    /// # Errors
    ///
    /// Only on a failed rebuild precondition; deleting an unknown id is not
    /// an error.
    pub fn delete_annotation(&mut self, id: &str) -> Result<(), AnnotationError> {
        self.dispatch(Transaction::action(Action::Delete { id: id.to_string() }))
    }

    /// # Errors
    ///
    /// See [`Self::dispatch`].
    pub fn clear_annotations(&mut self) -> Result<(), AnnotationError> {
        self.dispatch(Transaction::action(Action::Clear))
    }

    /// # Errors
    ///
    /// [`AnnotationError::MissingTargets`] after applying every valid move.
    pub fn move_annotations(&mut self, to_move: Vec<MoveInstruction>) -> Result<(), AnnotationError> {
        self.dispatch(Transaction::action(Action::MoveMany { to_move }))
    }

    /// # Errors
    ///
    /// See [`Self::dispatch`].
    pub fn refresh_decorations(&mut self) -> Result<(), AnnotationError> {
        self.dispatch(Transaction::action(Action::Refresh))
    }

    /// Decorations touching the current selection.
    #[must_use]
    pub fn annotations_at_selection(&self) -> Vec<Decoration> {
        self.state
            .decorations()
            .find(self.selection.from, self.selection.to)
            .into_iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Undo the last entry's annotation changes. Returns `false` if there
    /// was nothing to undo.
    pub fn undo(&mut self) -> bool {
        self.step_history(Direction::Undo)
    }

    /// Redo the last undone entry's annotation changes.
    pub fn redo(&mut self) -> bool {
        self.step_history(Direction::Redo)
    }

    fn step_history(&mut self, direction: Direction) -> bool {
        let store = self.state.store_mut();
        let restored = match direction {
            Direction::Undo => self.history.undo(store),
            Direction::Redo => self.history.redo(store),
        };
        let Some(ops) = restored else {
            return false;
        };
        self.state.telemetry_mut().emit(AnnotationEvent::HistoryRestored {
            direction: direction.as_str(),
            ops,
        });
        self.rebuild_now();
        true
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Drain local document ops and map batches. `None` if there is nothing
    /// to send or the editor is unbound.
    pub fn sync_message(&mut self) -> Option<SyncMessage> {
        let from = self.doc.replica()?;
        let message = SyncMessage {
            from,
            doc: self.doc.take_updates(),
            map: self.state.store_mut().take_batches(),
        };
        (!message.is_empty()).then_some(message)
    }

    /// Full document and map state, for bootstrapping a peer.
    #[must_use]
    pub fn state_message(&self) -> SyncMessage {
        SyncMessage {
            from: self.doc.replica().unwrap_or(ReplicaId(0)),
            doc: self.doc.full_state(),
            map: vec![self.state.store().full_state()],
        }
    }

    /// Apply a message from another replica and dispatch a remote-origin
    /// transaction.
    ///
    /// # Errors
    ///
    /// See [`Self::dispatch`].
    pub fn receive(&mut self, message: &SyncMessage) -> Result<(), AnnotationError> {
        let doc_changed = self.doc.apply_remote(message.doc.iter().cloned());
        let mut changed_ids = 0;
        for batch in &message.map {
            changed_ids += self.state.store_mut().apply_batch(batch).len();
        }
        debug!(
            instance = %self.config.instance,
            from = %message.from,
            doc_changed,
            changed_ids,
            "remote update received"
        );
        self.clamp_selection();
        self.dispatch(Transaction::remote(Mapping::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorResolver;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    const TWO: &str = "<h1>h</h1><p>block 1</p>";

    fn editor(html: &str) -> Editor {
        Editor::with_content(html, ReplicaId(1), AnnotationConfig::default()).unwrap()
    }

    #[test]
    fn add_annotation_generates_decimal_ids() {
        let mut ed = editor(TWO);
        ed.seed_ids(7);
        ed.set_cursor(6).unwrap();
        let id = ed.add_annotation(json!({"text": "hi"})).unwrap();
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(ed.decorations().spans(), vec![(3, 12)]);
        let entry = ed.store().get(&id).unwrap();
        assert_eq!(ed.document().to_absolute(&entry.pos), Some(4));
    }

    #[test]
    fn selection_outside_blocks_is_rejected() {
        let mut ed = Editor::with_content("", ReplicaId(1), AnnotationConfig::default()).unwrap();
        assert!(ed.add_annotation(json!(1)).is_err());
        assert!(ed.set_cursor(1).is_err());
    }

    #[test]
    fn sink_sees_every_change() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&calls);
        let mut ed = editor(TWO);
        ed.set_sink(move |set: &DecorationSet, notes: &[AnnotationSummary]| {
            seen.borrow_mut().push((set.spans(), notes.len()));
        });
        ed.set_cursor(4).unwrap();
        ed.add_annotation_with_id("c1", json!(1)).unwrap();
        ed.insert_text(2, "hello").unwrap();
        let calls = calls.borrow();
        assert_eq!(calls[0], (vec![], 0));
        assert_eq!(calls[1], (vec![(3, 12)], 1));
        assert_eq!(calls[2], (vec![(8, 17)], 1));
    }

    #[test]
    fn detached_editor_ignores_annotations_until_bound() {
        let mut ed = Editor::detached(TWO, AnnotationConfig::default()).unwrap();
        ed.set_cursor(4).unwrap();
        ed.add_annotation_with_id("c1", json!(1)).unwrap();
        assert!(ed.store().is_empty());
        assert_eq!(ed.telemetry().unbound_skips, 1);
        assert!(ed.sync_message().is_none());

        ed.bind(ReplicaId(3));
        ed.add_annotation_with_id("c1", json!(1)).unwrap();
        assert_eq!(ed.store().len(), 1);
    }

    #[test]
    fn update_missing_annotation_errors() {
        let mut ed = editor(TWO);
        let err = ed.update_annotation("ghost", json!(1)).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::MissingTarget);
    }

    #[test]
    fn annotations_at_selection_uses_decorations() {
        let mut ed = editor("<p>one</p><p>two</p>");
        ed.set_cursor(1).unwrap();
        ed.add_annotation_with_id("a", json!(1)).unwrap();
        ed.set_cursor(7).unwrap();
        ed.add_annotation_with_id("b", json!(2)).unwrap();
        ed.set_cursor(8).unwrap();
        let found: Vec<_> = ed.annotations_at_selection().into_iter().map(|d| d.id).collect();
        assert_eq!(found, vec!["b".to_string()]);
        ed.set_selection(2, 7).unwrap();
        assert_eq!(ed.annotations_at_selection().len(), 2);
    }

    #[test]
    fn undo_redo_annotation_commands() {
        let mut ed = editor(TWO);
        ed.set_cursor(4).unwrap();
        ed.add_annotation_with_id("c1", json!(1)).unwrap();
        ed.update_annotation("c1", json!(2)).unwrap();
        assert!(ed.undo());
        assert_eq!(ed.store().get("c1").map(|e| e.data.clone()), Some(json!(1)));
        assert!(ed.undo());
        assert!(ed.decorations().is_empty());
        assert!(!ed.undo());
        assert!(ed.redo());
        assert!(ed.redo());
        assert_eq!(ed.store().get("c1").map(|e| e.data.clone()), Some(json!(2)));
        assert_eq!(ed.decorations().spans(), vec![(3, 12)]);
    }

    #[test]
    fn sync_round_trip() {
        let mut a = editor(TWO);
        let mut b = a.fork(ReplicaId(2), AnnotationConfig::default());
        a.set_cursor(4).unwrap();
        a.add_annotation_with_id("c1", json!("x")).unwrap();
        a.insert_text(2, "i").unwrap();

        let msg = a.sync_message().unwrap();
        let wire = serde_json::to_string(&msg).unwrap();
        let decoded: SyncMessage = serde_json::from_str(&wire).unwrap();
        b.receive(&decoded).unwrap();
        assert_eq!(b.html(), a.html());
        assert_eq!(b.decorations(), a.decorations());
        assert!(a.sync_message().is_none());
    }
}
