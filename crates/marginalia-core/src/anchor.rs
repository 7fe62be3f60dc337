//! Conversion between ephemeral absolute positions and durable anchors.
//!
//! An absolute position is only valid until the next edit. An [`Anchor`]
//! names the replicated item immediately to the right of a position, so it
//! survives edits elsewhere and travels between replicas. It stops resolving
//! once that item is deleted.

use serde::{Deserialize, Serialize};

use crate::error::AnnotationError;
use crate::replica::{BlockKind, ItemId};

/// Replica-independent reference to a document position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Anchor {
    /// The gap immediately before item `id`.
    Item { id: ItemId },
    /// The end of the document.
    DocEnd,
}

/// The absolute↔anchor bridge.
pub trait AnchorResolver {
    /// Anchor for `pos`.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::Unbound`] when the document has no replica binding,
    /// [`AnnotationError::PositionOutOfRange`] when `pos` is past the end.
    fn to_anchor(&self, pos: usize) -> Result<Anchor, AnnotationError>;

    /// Current absolute position of `anchor`, or `None` if the anchored
    /// content no longer exists.
    fn to_absolute(&self, anchor: &Anchor) -> Option<usize>;
}

/// Read-only view of a block document.
pub trait DocumentView: AnchorResolver {
    /// Number of positions past the last token.
    fn size(&self) -> usize;

    /// Whether the document is attached to a replica.
    fn is_bound(&self) -> bool;

    /// Top-level blocks in document order.
    fn blocks(&self) -> Vec<BlockSpan>;

    /// Smallest block enclosing `pos`.
    ///
    /// A position strictly inside a block resolves to that block. A position
    /// on a boundary resolves to the block starting there, else the block
    /// ending there.
    fn enclosing_block(&self, pos: usize) -> Option<BlockSpan> {
        let blocks = self.blocks();
        blocks
            .iter()
            .find(|block| block.start <= pos && pos < block.end)
            .or_else(|| blocks.iter().find(|block| block.end == pos))
            .copied()
    }
}

/// Extent of one block node: `[start, end)` covers its open and close tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: usize,
    pub end: usize,
    pub kind: BlockKind,
}

impl BlockSpan {
    /// First position inside the block.
    #[must_use]
    pub const fn content_start(&self) -> usize {
        self.start + 1
    }

    /// Last position inside the block (before the close token).
    #[must_use]
    pub const fn content_end(&self) -> usize {
        self.end - 1
    }

    #[must_use]
    pub const fn content_len(&self) -> usize {
        self.content_end() - self.content_start()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.content_len() == 0
    }

    /// Whether `pos` lies strictly between the block's open and close.
    #[must_use]
    pub const fn contains(&self, pos: usize) -> bool {
        self.start < pos && pos < self.end
    }
}
