//! Replicated Growable Array over document tokens.
//!
//! The document is flattened into a sequence of [`Token`]s: every block is
//! an `Open`, its characters, and a `Close`. Each token is an item with a
//! Lamport [`ItemId`] and an origin (its left neighbour when inserted).
//!
//! # Integration rule
//!
//! A remote insert is placed right after its origin, skipping every item
//! whose id is greater than the new id. An item's clock always exceeds its
//! origin's clock, so skipped runs contain whole subtrees and every replica
//! computes the same order regardless of delivery order.
//!
//! Deletion marks the item as a tombstone. Ops whose origin or target is not
//! known yet are buffered and retried after every successful integration.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ItemId;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Kind of a block node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    Paragraph,
    /// Heading level 1 through 6.
    Heading(u8),
}

impl BlockKind {
    /// HTML tag name.
    #[must_use]
    pub fn tag(self) -> String {
        match self {
            Self::Paragraph => "p".to_string(),
            Self::Heading(level) => format!("h{}", level.clamp(1, 6)),
        }
    }

    /// Parse an HTML tag name.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "p" => Some(Self::Paragraph),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                tag[1..].parse().ok().map(Self::Heading)
            }
            _ => None,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One visible unit of the flattened document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Token {
    Open(BlockKind),
    Char(char),
    Close,
}

/// A replicated document operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum DocOp {
    Insert {
        id: ItemId,
        origin: Option<ItemId>,
        token: Token,
    },
    Delete {
        id: ItemId,
    },
}

impl DocOp {
    /// Id of the item the op creates or removes.
    #[must_use]
    pub const fn id(&self) -> ItemId {
        match self {
            Self::Insert { id, .. } | Self::Delete { id } => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Item {
    id: ItemId,
    origin: Option<ItemId>,
    token: Token,
    deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Integration {
    Applied,
    Duplicate,
    Missing,
}

/// RGA sequence of tokens, tombstones included.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    items: Vec<Item>,
    pending: Vec<DocOp>,
}

impl Sequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| !item.deleted).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible tokens in document order.
    pub fn visible(&self) -> impl Iterator<Item = (ItemId, Token)> + '_ {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| (item.id, item.token))
    }

    /// Id of the visible token at `pos`.
    #[must_use]
    pub fn id_at(&self, pos: usize) -> Option<ItemId> {
        self.visible().nth(pos).map(|(id, _)| id)
    }

    #[must_use]
    pub fn token_at(&self, pos: usize) -> Option<Token> {
        self.visible().nth(pos).map(|(_, token)| token)
    }

    /// Visible position of `id`; `None` if unknown or tombstoned.
    #[must_use]
    pub fn position_of(&self, id: ItemId) -> Option<usize> {
        let mut pos = 0;
        for item in &self.items {
            if item.id == id {
                return (!item.deleted).then_some(pos);
            }
            if !item.deleted {
                pos += 1;
            }
        }
        None
    }

    /// Whether `id` has been integrated (live or tombstoned).
    #[must_use]
    pub fn knows(&self, id: ItemId) -> bool {
        self.index_of(id).is_some()
    }

    /// Ops waiting for a missing dependency.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn index_of(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn raw_index_of_visible(&self, pos: usize) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.deleted)
            .nth(pos)
            .map(|(index, _)| index)
    }

    /// Insert `token` so that it becomes visible at `pos`.
    ///
    /// `id` must be greater than every id integrated so far. Returns `None`
    /// when `pos` is past the end.
    pub fn insert_local(&mut self, pos: usize, id: ItemId, token: Token) -> Option<DocOp> {
        if pos > self.len() {
            return None;
        }
        let origin = if pos == 0 { None } else { self.id_at(pos - 1) };
        let op = DocOp::Insert { id, origin, token };
        (self.integrate(&op) == Integration::Applied).then_some(op)
    }

    /// Tombstone the visible token at `pos`.
    pub fn delete_local(&mut self, pos: usize) -> Option<DocOp> {
        let index = self.raw_index_of_visible(pos)?;
        self.items[index].deleted = true;
        Some(DocOp::Delete {
            id: self.items[index].id,
        })
    }

    /// Apply a remote op. Returns `true` if the visible sequence changed.
    ///
    /// Duplicates are ignored; ops with unknown dependencies are buffered.
    pub fn apply(&mut self, op: DocOp) -> bool {
        match self.integrate(&op) {
            Integration::Applied => {
                self.drain_pending();
                true
            }
            Integration::Duplicate => false,
            Integration::Missing => {
                if !self.pending.contains(&op) {
                    self.pending.push(op);
                }
                false
            }
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let mut progressed = false;
            let pending = std::mem::take(&mut self.pending);
            for op in pending {
                match self.integrate(&op) {
                    Integration::Applied => progressed = true,
                    Integration::Duplicate => {}
                    Integration::Missing => self.pending.push(op),
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn integrate(&mut self, op: &DocOp) -> Integration {
        match *op {
            DocOp::Insert { id, origin, token } => {
                if self.index_of(id).is_some() {
                    return Integration::Duplicate;
                }
                let mut at = match origin {
                    None => 0,
                    Some(origin) => match self.index_of(origin) {
                        Some(index) => index + 1,
                        None => return Integration::Missing,
                    },
                };
                while at < self.items.len() && self.items[at].id > id {
                    at += 1;
                }
                self.items.insert(
                    at,
                    Item {
                        id,
                        origin,
                        token,
                        deleted: false,
                    },
                );
                Integration::Applied
            }
            DocOp::Delete { id } => match self.index_of(id) {
                None => Integration::Missing,
                Some(index) if self.items[index].deleted => Integration::Duplicate,
                Some(index) => {
                    self.items[index].deleted = true;
                    Integration::Applied
                }
            },
        }
    }

    /// Every integrated item as ops, in an order any replica can apply.
    #[must_use]
    pub fn full_state(&self) -> Vec<DocOp> {
        let inserts = self.items.iter().map(|item| DocOp::Insert {
            id: item.id,
            origin: item.origin,
            token: item.token,
        });
        let deletes = self
            .items
            .iter()
            .filter(|item| item.deleted)
            .map(|item| DocOp::Delete { id: item.id });
        inserts.chain(deletes).chain(self.pending.iter().cloned()).collect()
    }

    /// Highest clock among integrated and buffered items.
    #[must_use]
    pub fn max_clock(&self) -> u64 {
        self.items
            .iter()
            .map(|item| item.id.clock)
            .chain(self.pending.iter().map(|op| op.id().clock))
            .max()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{LamportClock, ReplicaId};

    fn text(seq: &Sequence) -> String {
        seq.visible()
            .filter_map(|(_, token)| match token {
                Token::Char(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn type_str(seq: &mut Sequence, clock: &mut LamportClock, pos: usize, s: &str) -> Vec<DocOp> {
        s.chars()
            .enumerate()
            .filter_map(|(i, c)| seq.insert_local(pos + i, clock.tick(), Token::Char(c)))
            .collect()
    }

    #[test]
    fn local_inserts_land_at_position() {
        let mut seq = Sequence::new();
        let mut clock = LamportClock::new(ReplicaId(1));
        type_str(&mut seq, &mut clock, 0, "held");
        type_str(&mut seq, &mut clock, 3, "lo wor");
        assert_eq!(text(&seq), "hello word");
        assert!(seq.insert_local(99, clock.tick(), Token::Close).is_none());
    }

    #[test]
    fn delete_leaves_tombstone() {
        let mut seq = Sequence::new();
        let mut clock = LamportClock::new(ReplicaId(1));
        type_str(&mut seq, &mut clock, 0, "abc");
        let b = seq.id_at(1);
        seq.delete_local(1);
        assert_eq!(text(&seq), "ac");
        assert_eq!(seq.len(), 2);
        assert!(b.is_some_and(|id| seq.knows(id) && seq.position_of(id).is_none()));
    }

    #[test]
    fn concurrent_inserts_converge() {
        let mut clock_a = LamportClock::new(ReplicaId(1));
        let mut a = Sequence::new();
        let base = type_str(&mut a, &mut clock_a, 0, "xy");

        let mut b = Sequence::new();
        let mut clock_b = LamportClock::new(ReplicaId(2));
        for op in &base {
            clock_b.observe(op.id());
            b.apply(op.clone());
        }

        let ops_a = type_str(&mut a, &mut clock_a, 1, "AA");
        let ops_b = type_str(&mut b, &mut clock_b, 1, "BB");
        for op in ops_b {
            a.apply(op);
        }
        for op in ops_a {
            b.apply(op);
        }
        assert_eq!(text(&a), text(&b));
        assert_eq!(text(&a), "xBBAAy");
    }

    #[test]
    fn out_of_order_ops_are_buffered() {
        let mut clock = LamportClock::new(ReplicaId(1));
        let mut a = Sequence::new();
        let ops = type_str(&mut a, &mut clock, 0, "abc");
        let delete = a.delete_local(0).into_iter().collect::<Vec<_>>();

        let mut b = Sequence::new();
        for op in delete.iter().chain(ops.iter().rev()) {
            b.apply(op.clone());
        }
        assert_eq!(b.pending_len(), 0);
        assert_eq!(text(&b), "bc");
    }

    #[test]
    fn apply_is_idempotent() {
        let mut clock = LamportClock::new(ReplicaId(1));
        let mut a = Sequence::new();
        let ops = type_str(&mut a, &mut clock, 0, "ab");
        let mut b = Sequence::new();
        for op in ops.iter().chain(ops.iter()) {
            b.apply(op.clone());
        }
        assert_eq!(text(&b), "ab");
    }

    #[test]
    fn full_state_bootstraps_identical_sequence() {
        let mut clock = LamportClock::new(ReplicaId(1));
        let mut a = Sequence::new();
        type_str(&mut a, &mut clock, 0, "hello");
        a.delete_local(1);
        type_str(&mut a, &mut clock, 2, "--");

        let mut b = Sequence::new();
        for op in a.full_state() {
            b.apply(op);
        }
        assert_eq!(text(&a), text(&b));
        assert_eq!(a.visible().collect::<Vec<_>>(), b.visible().collect::<Vec<_>>());
        assert_eq!(b.max_clock(), a.max_clock());
    }

    #[test]
    fn block_kind_tags() {
        assert_eq!(BlockKind::Heading(2).tag(), "h2");
        assert_eq!(BlockKind::from_tag("h6"), Some(BlockKind::Heading(6)));
        assert_eq!(BlockKind::from_tag("p"), Some(BlockKind::Paragraph));
        assert_eq!(BlockKind::from_tag("div"), None);
    }
}
