//! Structural key handlers.
//!
//! Enter, Backspace and Delete at block boundaries split or join blocks. The
//! handlers plan annotation relocation against the pre-edit document, run
//! the edit, and schedule the relocation as a follow-up action (deferred by
//! default, see [`Editor::run_deferred`]).
//!
//! Every handler returns `Ok(false)` when the key is not handled at the
//! cursor, e.g. Backspace at the start of the first block.

use tracing::debug;

use crate::action::{Action, StructuralTag, Transaction};
use crate::anchor::{BlockSpan, DocumentView};
use crate::editor::{Editor, Selection};
use crate::error::AnnotationError;
use crate::relocation::{plan_join, plan_split};
use crate::telemetry::AnnotationEvent;

impl Editor {
    /// Block whose content holds `pos`.
    fn content_block(&self, pos: usize) -> Option<BlockSpan> {
        self.doc
            .enclosing_block(pos)
            .filter(|block| block.content_start() <= pos && pos <= block.content_end())
    }

    fn delete_selection(&mut self) -> Result<bool, AnnotationError> {
        let Selection { from, to } = self.selection;
        if from == to {
            return Ok(false);
        }
        self.delete_range(from, to)?;
        Ok(true)
    }

    /// Split the block at the cursor.
    ///
    /// # Errors
    ///
    /// Document edit errors and errors from an immediately dispatched
    /// relocation.
    pub fn press_enter(&mut self) -> Result<bool, AnnotationError> {
        self.delete_selection()?;
        let pos = self.selection.from;
        let Some(block) = self.content_block(pos) else {
            return Ok(false);
        };

        if pos == block.content_start() {
            let outcome = self.doc.split_block(pos)?;
            self.selection = Selection::cursor(pos + 2);
            self.dispatch(
                Transaction::edit(outcome.step_map).with_tag(StructuralTag::SplitAtStart),
            )?;
            debug!(instance = %self.config.instance, pos, "split at block start");
            self.schedule(Action::Refresh)?;
            return Ok(true);
        }

        let plan = plan_split(&self.doc, self.state.store(), &block, pos);
        let outcome = self.doc.split_block(pos)?;
        self.selection = Selection::cursor(pos + 2);
        // Both split paths share the wire tag; only the follow-up differs.
        self.dispatch(
            Transaction::edit(outcome.step_map).with_tag(StructuralTag::SplitAtStart),
        )?;
        self.state.telemetry_mut().emit(AnnotationEvent::RelocationPlanned {
            edit: "split",
            moves: plan.moves(),
        });
        self.schedule(plan.into_action())?;
        Ok(true)
    }

    /// Delete backward, joining with the previous block at a content start.
    ///
    /// # Errors
    ///
    /// Document edit errors and errors from an immediately dispatched
    /// relocation.
    pub fn press_backspace(&mut self) -> Result<bool, AnnotationError> {
        if self.delete_selection()? {
            return Ok(true);
        }
        let pos = self.selection.from;
        let Some(block) = self.content_block(pos) else {
            return Ok(false);
        };
        if pos > block.content_start() {
            self.delete_range(pos - 1, pos)?;
            return Ok(true);
        }
        let has_previous = self.doc.blocks().iter().any(|b| b.end == block.start);
        if !has_previous {
            return Ok(false);
        }
        self.join_at(block.start)?;
        Ok(true)
    }

    /// Delete forward, joining with the next block at a content end.
    ///
    /// # Errors
    ///
    /// Document edit errors and errors from an immediately dispatched
    /// relocation.
    pub fn press_delete(&mut self) -> Result<bool, AnnotationError> {
        if self.delete_selection()? {
            return Ok(true);
        }
        let pos = self.selection.from;
        let Some(block) = self.content_block(pos) else {
            return Ok(false);
        };
        if pos < block.content_end() {
            self.delete_range(pos, pos + 1)?;
            return Ok(true);
        }
        let has_next = self.doc.blocks().iter().any(|b| b.start == block.end);
        if !has_next {
            return Ok(false);
        }
        self.join_at(block.end)?;
        Ok(true)
    }

    fn join_at(&mut self, boundary: usize) -> Result<(), AnnotationError> {
        let blocks = self.doc.blocks();
        let (Some(front), Some(absorbed)) = (
            blocks.iter().find(|b| b.end == boundary),
            blocks.iter().find(|b| b.start == boundary),
        ) else {
            return Err(AnnotationError::InvalidEdit(format!(
                "no blocks to join at {boundary}"
            )));
        };
        let join_pos = front.content_end();
        let plan = plan_join(&self.doc, self.state.store(), absorbed, join_pos);
        let current_pos = self.selection.from;

        let outcome = self.doc.join_blocks(boundary)?;
        self.selection = Selection::cursor(outcome.join_pos);
        self.dispatch(Transaction::edit(outcome.step_map).with_tag(
            StructuralTag::JoinBlock {
                current_pos,
                new_pos: outcome.join_pos,
            },
        ))?;
        self.state.telemetry_mut().emit(AnnotationEvent::RelocationPlanned {
            edit: "join",
            moves: plan.moves(),
        });
        self.schedule(plan.into_action())
    }
}
