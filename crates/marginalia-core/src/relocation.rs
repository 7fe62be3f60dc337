//! Structural-edit relocation.
//!
//! Splitting or joining blocks recreates the moved characters, so anchors
//! into them stop resolving. Before the edit runs, the key handler asks this
//! module which annotations will be orphaned and where their content will
//! land; the answer is a `move-many` batch (or a plain refresh when nothing
//! qualifies) that is dispatched once the edit has committed.
//!
//! All inputs are pre-edit positions; every `new_pos` is a post-edit
//! position.

use crate::action::Action;
use crate::anchor::{BlockSpan, DocumentView};
use crate::store::{AnnotationStore, MoveInstruction};

/// Follow-up action for one structural edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    /// No annotation needs to move; decorations only need a rebuild.
    Refresh,
    MoveMany(Vec<MoveInstruction>),
}

impl Relocation {
    fn from_moves(moves: Vec<MoveInstruction>) -> Self {
        if moves.is_empty() {
            Self::Refresh
        } else {
            Self::MoveMany(moves)
        }
    }

    #[must_use]
    pub fn moves(&self) -> usize {
        match self {
            Self::Refresh => 0,
            Self::MoveMany(moves) => moves.len(),
        }
    }

    #[must_use]
    pub fn into_action(self) -> Action {
        match self {
            Self::Refresh => Action::Refresh,
            Self::MoveMany(to_move) => Action::MoveMany { to_move },
        }
    }
}

fn plan(
    doc: &dyn DocumentView,
    store: &AnnotationStore,
    relocate: impl Fn(usize) -> Option<usize>,
) -> Relocation {
    let moves = store
        .entries()
        .filter_map(|entry| {
            let pos = doc.to_absolute(&entry.pos)?;
            relocate(pos).map(|new_pos| MoveInstruction {
                id: entry.id.clone(),
                new_pos,
            })
        })
        .collect();
    Relocation::from_moves(moves)
}

/// Plan for splitting `block` at `split_pos` (not its content start).
///
/// Annotations at the split position or inside the rear part follow their
/// text into the new block, whose content starts at `split_pos + 2`.
#[must_use]
pub fn plan_split(
    doc: &dyn DocumentView,
    store: &AnnotationStore,
    block: &BlockSpan,
    split_pos: usize,
) -> Relocation {
    let rear_content_start = split_pos + 2;
    plan(doc, store, |pos| {
        (pos == split_pos || (split_pos < pos && pos < block.end))
            .then(|| rear_content_start + (pos - split_pos))
    })
}

/// Plan for merging `absorbed` into the block before it.
///
/// `join_pos` is the pre-edit position of the front block's close token,
/// where the absorbed content begins after the join. An annotation on the
/// absorbed block's open token moves to `join_pos`; one inside it keeps its
/// offset from the absorbed content start. An empty absorbed block is a pure
/// deletion and yields a refresh.
#[must_use]
pub fn plan_join(
    doc: &dyn DocumentView,
    store: &AnnotationStore,
    absorbed: &BlockSpan,
    join_pos: usize,
) -> Relocation {
    if absorbed.is_empty() {
        return Relocation::Refresh;
    }
    plan(doc, store, |pos| {
        if pos == absorbed.start {
            Some(join_pos)
        } else if absorbed.contains(pos) {
            Some(join_pos + (pos - absorbed.content_start()))
        } else {
            None
        }
    })
}
