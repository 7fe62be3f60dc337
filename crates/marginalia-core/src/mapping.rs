//! Position mapping through document edits.
//!
//! A [`StepMap`] records the replaced ranges of one edit in pre-edit
//! coordinates; a [`Mapping`] chains step maps. Mapping a position through
//! an insertion exactly at that position is ambiguous, so callers pick a
//! side with [`Assoc`].

/// Which side a position sticks to when content is inserted at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    /// Stay before inserted content.
    Before,
    /// Move past inserted content.
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Replaced {
    start: usize,
    old_len: usize,
    new_len: usize,
}

/// Result of mapping one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    /// The token on the `assoc` side of the position was removed.
    pub deleted: bool,
}

/// Position delta of a single edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    ranges: Vec<Replaced>,
}

impl StepMap {
    /// A step that moved nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Replace `old_len` tokens at `start` with `new_len` tokens.
    #[must_use]
    pub fn replace(start: usize, old_len: usize, new_len: usize) -> Self {
        if old_len == 0 && new_len == 0 {
            return Self::empty();
        }
        Self {
            ranges: vec![Replaced {
                start,
                old_len,
                new_len,
            }],
        }
    }

    #[must_use]
    pub fn insertion(pos: usize, len: usize) -> Self {
        Self::replace(pos, 0, len)
    }

    #[must_use]
    pub fn deletion(from: usize, to: usize) -> Self {
        Self::replace(from, to.saturating_sub(from), 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[must_use]
    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    #[must_use]
    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for range in &self.ranges {
            if range.start > pos {
                break;
            }
            let end = range.start + range.old_len;
            if pos <= end {
                let side = if range.old_len == 0 {
                    assoc
                } else if pos == range.start {
                    Assoc::Before
                } else if pos == end {
                    Assoc::After
                } else {
                    assoc
                };
                let offset = match side {
                    Assoc::Before => 0,
                    Assoc::After => range.new_len,
                };
                let deleted = range.old_len > 0
                    && match assoc {
                        Assoc::Before => pos > range.start,
                        Assoc::After => pos < end,
                    };
                return MapResult {
                    pos: shift(range.start + offset, diff),
                    deleted,
                };
            }
            diff += signed(range.new_len) - signed(range.old_len);
        }
        MapResult {
            pos: shift(pos, diff),
            deleted: false,
        }
    }
}

/// A sequence of step maps applied in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    #[must_use]
    pub const fn new() -> Self {
        Self { maps: Vec::new() }
    }

    pub fn push(&mut self, map: StepMap) {
        if !map.is_empty() {
            self.maps.push(map);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    #[must_use]
    pub fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }

    #[must_use]
    pub fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut deleted = false;
        let mut pos = pos;
        for map in &self.maps {
            let result = map.map_result(pos, assoc);
            deleted |= result.deleted;
            pos = result.pos;
        }
        MapResult { pos, deleted }
    }
}

impl From<StepMap> for Mapping {
    fn from(map: StepMap) -> Self {
        let mut mapping = Self::new();
        mapping.push(map);
        mapping
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn signed(n: usize) -> isize {
    n as isize
}

#[allow(clippy::cast_sign_loss)]
const fn shift(pos: usize, diff: isize) -> usize {
    let shifted = signed(pos) + diff;
    if shifted < 0 { 0 } else { shifted as usize }
}
