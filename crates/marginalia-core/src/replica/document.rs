//! Replicated block document.
//!
//! Positions follow the flattened block model: `<h1>h</h1><p>block 1</p>`
//! has the heading at `[0, 3)` and the paragraph at `[3, 12)`, with the
//! paragraph's characters at positions 4 through 10.
//!
//! Splitting a block in the middle and joining two blocks recreate the moved
//! characters as new items, the same way a tree CRDT binding replaces the
//! moved subtree. Anchors into moved characters therefore stop resolving and
//! callers must relocate them (see [`crate::relocation`]).

use tracing::trace;

use super::sequence::{BlockKind, DocOp, Sequence, Token};
use super::{LamportClock, ReplicaId};
use crate::anchor::{Anchor, AnchorResolver, BlockSpan, DocumentView};
use crate::error::AnnotationError;
use crate::mapping::StepMap;

/// Replica used for content that existed before any binding.
const DETACHED: ReplicaId = ReplicaId(0);

/// Result of [`ReplicatedDocument::split_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// The block as it was before the split.
    pub block: BlockSpan,
    pub split_pos: usize,
    /// The split happened at the block's content start and only inserted an
    /// empty block in front of it.
    pub at_start: bool,
    pub step_map: StepMap,
}

/// Result of [`ReplicatedDocument::join_blocks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Front block, before the join.
    pub front: BlockSpan,
    /// Block merged into `front`, before the join.
    pub absorbed: BlockSpan,
    /// Pre-edit position of the front block's close token; the absorbed
    /// content starts here after the join.
    pub join_pos: usize,
    pub step_map: StepMap,
}

impl JoinOutcome {
    /// The absorbed block had no content, so the join only removed it.
    #[must_use]
    pub const fn absorbed_empty(&self) -> bool {
        self.absorbed.is_empty()
    }
}

/// A block document replicated through an RGA sequence.
#[derive(Debug, Clone)]
pub struct ReplicatedDocument {
    seq: Sequence,
    clock: LamportClock,
    bound: bool,
    outgoing: Vec<DocOp>,
}

impl ReplicatedDocument {
    /// Empty document bound to `replica`.
    #[must_use]
    pub fn new(replica: ReplicaId) -> Self {
        let mut doc = Self::detached();
        doc.bind(replica);
        doc
    }

    /// Empty document with no replica binding.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            seq: Sequence::new(),
            clock: LamportClock::new(DETACHED),
            bound: false,
            outgoing: Vec::new(),
        }
    }

    /// Parse `<h1>..</h1><p>..</p>` markup into a detached document.
    ///
    /// Initial content is stamped with a fixed replica, so two replicas
    /// parsing the same markup share item identities.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] on unsupported tags, unbalanced
    /// blocks, or text outside a block.
    pub fn parse_html(html: &str) -> Result<Self, AnnotationError> {
        let mut doc = Self::detached();
        let mut open: Option<BlockKind> = None;
        let mut chars = html.chars();
        while let Some(c) = chars.next() {
            match c {
                '<' => {
                    let mut tag = String::new();
                    for t in chars.by_ref() {
                        if t == '>' {
                            break;
                        }
                        tag.push(t);
                    }
                    let tag = tag.trim().to_ascii_lowercase();
                    if let Some(name) = tag.strip_prefix('/') {
                        match open.take() {
                            Some(kind) if kind.tag() == name => doc.push_token(Token::Close),
                            _ => {
                                return Err(AnnotationError::InvalidEdit(format!(
                                    "unbalanced </{name}>"
                                )));
                            }
                        }
                    } else {
                        let kind = BlockKind::from_tag(&tag).ok_or_else(|| {
                            AnnotationError::InvalidEdit(format!("unsupported tag <{tag}>"))
                        })?;
                        if open.is_some() {
                            return Err(AnnotationError::InvalidEdit(format!(
                                "nested block <{tag}>"
                            )));
                        }
                        open = Some(kind);
                        doc.push_token(Token::Open(kind));
                    }
                }
                '&' => {
                    let mut entity = String::new();
                    for t in chars.by_ref() {
                        if t == ';' {
                            break;
                        }
                        entity.push(t);
                    }
                    let decoded = match entity.as_str() {
                        "amp" => '&',
                        "lt" => '<',
                        "gt" => '>',
                        "quot" => '"',
                        other => {
                            return Err(AnnotationError::InvalidEdit(format!(
                                "unknown entity &{other};"
                            )));
                        }
                    };
                    doc.push_text_char(open, decoded)?;
                }
                c if open.is_none() && c.is_whitespace() => {}
                c => doc.push_text_char(open, c)?,
            }
        }
        if let Some(kind) = open {
            return Err(AnnotationError::InvalidEdit(format!("unclosed <{kind}>")));
        }
        Ok(doc)
    }

    /// Parse markup and bind the result to `replica`.
    ///
    /// # Errors
    ///
    /// See [`Self::parse_html`].
    pub fn from_html(html: &str, replica: ReplicaId) -> Result<Self, AnnotationError> {
        let mut doc = Self::parse_html(html)?;
        doc.bind(replica);
        Ok(doc)
    }

    fn push_text_char(&mut self, open: Option<BlockKind>, c: char) -> Result<(), AnnotationError> {
        if open.is_none() {
            return Err(AnnotationError::InvalidEdit(format!(
                "text '{c}' outside a block"
            )));
        }
        self.push_token(Token::Char(c));
        Ok(())
    }

    fn push_token(&mut self, token: Token) {
        let pos = self.seq.len();
        let id = self.clock.tick();
        // parsed content is shared initial state, not an outgoing edit
        let _ = self.seq.insert_local(pos, id, token);
    }

    /// Attach the document to `replica`. Later edits are stamped with it.
    pub fn bind(&mut self, replica: ReplicaId) {
        self.clock.set_replica(replica);
        self.bound = true;
    }

    #[must_use]
    pub const fn replica(&self) -> Option<ReplicaId> {
        if self.bound { Some(self.clock.replica()) } else { None }
    }

    /// Bootstrap a new replica holding this document's full state.
    #[must_use]
    pub fn fork(&self, replica: ReplicaId) -> Self {
        let mut doc = Self::new(replica);
        doc.apply_remote(self.full_state());
        doc
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Render the document as block markup.
    #[must_use]
    pub fn html(&self) -> String {
        let mut out = String::new();
        let mut open: Option<BlockKind> = None;
        for (_, token) in self.seq.visible() {
            match token {
                Token::Open(kind) => {
                    open = Some(kind);
                    out.push('<');
                    out.push_str(&kind.tag());
                    out.push('>');
                }
                Token::Char(c) => match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '"' => out.push_str("&quot;"),
                    c => out.push(c),
                },
                Token::Close => {
                    if let Some(kind) = open.take() {
                        out.push_str("</");
                        out.push_str(&kind.tag());
                        out.push('>');
                    }
                }
            }
        }
        out
    }

    /// Characters of `block`.
    #[must_use]
    pub fn block_text(&self, block: &BlockSpan) -> String {
        self.seq
            .visible()
            .skip(block.content_start())
            .take(block.content_len())
            .filter_map(|(_, token)| match token {
                Token::Char(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Remote ops still waiting for a missing dependency.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.seq.pending_len()
    }

    fn content_block(&self, from: usize, to: usize) -> Result<BlockSpan, AnnotationError> {
        let size = self.size();
        if to > size {
            return Err(AnnotationError::PositionOutOfRange { pos: to, size });
        }
        self.blocks()
            .into_iter()
            .find(|block| block.start < from && to < block.end)
            .ok_or_else(|| {
                AnnotationError::InvalidEdit(format!("{from}..{to} is not inside one block"))
            })
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    fn insert_token(&mut self, pos: usize, token: Token) -> Result<(), AnnotationError> {
        let size = self.seq.len();
        let id = self.clock.tick();
        let op = self
            .seq
            .insert_local(pos, id, token)
            .ok_or(AnnotationError::PositionOutOfRange { pos, size })?;
        self.outgoing.push(op);
        Ok(())
    }

    fn delete_token(&mut self, pos: usize) -> Result<Token, AnnotationError> {
        let size = self.seq.len();
        let token = self
            .seq
            .token_at(pos)
            .ok_or(AnnotationError::PositionOutOfRange { pos, size })?;
        if let Some(op) = self.seq.delete_local(pos) {
            self.outgoing.push(op);
        }
        Ok(token)
    }

    /// Insert characters inside a block.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if `pos` is not inside a block's
    /// content.
    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<StepMap, AnnotationError> {
        self.content_block(pos, pos)?;
        let mut len = 0;
        for (i, c) in text.chars().enumerate() {
            self.insert_token(pos + i, Token::Char(c))?;
            len += 1;
        }
        trace!(pos, len, "insert text");
        Ok(StepMap::insertion(pos, len))
    }

    /// Delete the characters in `[from, to)`, which must lie in one block.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if the range crosses a block boundary.
    pub fn delete_range(&mut self, from: usize, to: usize) -> Result<StepMap, AnnotationError> {
        if from >= to {
            return Ok(StepMap::empty());
        }
        self.content_block(from, to)?;
        for _ in from..to {
            self.delete_token(from)?;
        }
        trace!(from, to, "delete range");
        Ok(StepMap::deletion(from, to))
    }

    /// Insert a whole block at a block boundary.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if `pos` is not between blocks.
    pub fn insert_block(
        &mut self,
        pos: usize,
        kind: BlockKind,
        text: &str,
    ) -> Result<StepMap, AnnotationError> {
        let size = self.size();
        if pos > size {
            return Err(AnnotationError::PositionOutOfRange { pos, size });
        }
        let at_boundary = pos == size
            || self
                .blocks()
                .iter()
                .any(|block| block.start == pos || block.end == pos);
        if !at_boundary {
            return Err(AnnotationError::InvalidEdit(format!(
                "{pos} is not a block boundary"
            )));
        }
        self.insert_token(pos, Token::Open(kind))?;
        let mut len = 1;
        for c in text.chars() {
            self.insert_token(pos + len, Token::Char(c))?;
            len += 1;
        }
        self.insert_token(pos + len, Token::Close)?;
        Ok(StepMap::insertion(pos, len + 1))
    }

    /// Split the block containing `pos` into a front and a rear block.
    ///
    /// At the content start an empty block of the same kind is inserted in
    /// front and nothing else moves. Otherwise the rear characters are
    /// recreated in a new block; splitting at the content end yields an empty
    /// paragraph.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if `pos` is not inside a block.
    pub fn split_block(&mut self, pos: usize) -> Result<SplitOutcome, AnnotationError> {
        let block = self.content_block(pos, pos)?;
        if pos == block.content_start() {
            self.insert_token(block.start, Token::Open(block.kind))?;
            self.insert_token(block.start + 1, Token::Close)?;
            trace!(pos, "split at block start");
            return Ok(SplitOutcome {
                block,
                split_pos: pos,
                at_start: true,
                step_map: StepMap::insertion(block.start, 2),
            });
        }

        let mut rear = Vec::new();
        for _ in pos..block.content_end() {
            if let Token::Char(c) = self.delete_token(pos)? {
                rear.push(c);
            }
        }
        let rear_kind = if rear.is_empty() {
            BlockKind::Paragraph
        } else {
            block.kind
        };
        self.insert_token(pos, Token::Close)?;
        self.insert_token(pos + 1, Token::Open(rear_kind))?;
        for (i, c) in rear.iter().enumerate() {
            self.insert_token(pos + 2 + i, Token::Char(*c))?;
        }
        trace!(pos, moved = rear.len(), "split block");
        Ok(SplitOutcome {
            block,
            split_pos: pos,
            at_start: false,
            step_map: StepMap::insertion(pos, 2),
        })
    }

    /// Merge the block starting at `boundary` into the block ending there.
    ///
    /// # Errors
    ///
    /// [`AnnotationError::InvalidEdit`] if `boundary` does not separate two
    /// blocks.
    pub fn join_blocks(&mut self, boundary: usize) -> Result<JoinOutcome, AnnotationError> {
        let blocks = self.blocks();
        let front = blocks.iter().find(|block| block.end == boundary).copied();
        let absorbed = blocks.iter().find(|block| block.start == boundary).copied();
        let (Some(front), Some(absorbed)) = (front, absorbed) else {
            return Err(AnnotationError::InvalidEdit(format!(
                "no blocks to join at {boundary}"
            )));
        };

        let mut moved = Vec::new();
        for _ in absorbed.start..absorbed.end {
            if let Token::Char(c) = self.delete_token(absorbed.start)? {
                moved.push(c);
            }
        }
        let join_pos = front.content_end();
        for (i, c) in moved.iter().enumerate() {
            self.insert_token(join_pos + i, Token::Char(*c))?;
        }
        trace!(boundary, moved = moved.len(), "join blocks");
        Ok(JoinOutcome {
            front,
            absorbed,
            join_pos,
            step_map: StepMap::deletion(join_pos, join_pos + 2),
        })
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Drain ops produced by local edits since the last call.
    pub fn take_updates(&mut self) -> Vec<DocOp> {
        std::mem::take(&mut self.outgoing)
    }

    /// Every item, tombstones included.
    #[must_use]
    pub fn full_state(&self) -> Vec<DocOp> {
        self.seq.full_state()
    }

    /// Integrate remote ops. Returns `true` if visible content changed.
    pub fn apply_remote(&mut self, ops: impl IntoIterator<Item = DocOp>) -> bool {
        let mut changed = false;
        for op in ops {
            self.clock.observe(op.id());
            changed |= self.seq.apply(op);
        }
        changed
    }
}

impl AnchorResolver for ReplicatedDocument {
    fn to_anchor(&self, pos: usize) -> Result<Anchor, AnnotationError> {
        if !self.bound {
            return Err(AnnotationError::Unbound);
        }
        let size = self.size();
        if pos == size {
            return Ok(Anchor::DocEnd);
        }
        self.seq
            .id_at(pos)
            .map(|id| Anchor::Item { id })
            .ok_or(AnnotationError::PositionOutOfRange { pos, size })
    }

    fn to_absolute(&self, anchor: &Anchor) -> Option<usize> {
        match anchor {
            Anchor::Item { id } => self.seq.position_of(*id),
            Anchor::DocEnd => Some(self.size()),
        }
    }
}

impl DocumentView for ReplicatedDocument {
    fn size(&self) -> usize {
        self.seq.len()
    }

    fn is_bound(&self) -> bool {
        self.bound
    }

    fn blocks(&self) -> Vec<BlockSpan> {
        let mut blocks = Vec::new();
        let mut open: Option<(usize, BlockKind)> = None;
        for (pos, (_, token)) in self.seq.visible().enumerate() {
            match token {
                Token::Open(kind) => open = Some((pos, kind)),
                Token::Close => {
                    if let Some((start, kind)) = open.take() {
                        blocks.push(BlockSpan {
                            start,
                            end: pos + 1,
                            kind,
                        });
                    }
                }
                Token::Char(_) => {}
            }
        }
        blocks
    }
}
