//! Decoration engine.
//!
//! Decorations are the renderable form of annotations: one span per
//! annotation covering the whole block its anchor resolves into. They are
//! never persisted. [`recompute`] rebuilds the full set from the store and
//! the current document; [`DecorationSet::map`] shifts an existing set
//! through a local edit without touching the store.

use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::anchor::DocumentView;
use crate::error::AnnotationError;
use crate::mapping::{Assoc, Mapping};
use crate::store::{AnnotationStore, AnnotationSummary};

/// Block-level span for one annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decoration {
    pub id: String,
    pub start: usize,
    pub end: usize,
    /// Resolved anchor position the span was derived from.
    pub anchor_pos: usize,
    pub data: Value,
}

/// Decorations ordered by `(start, anchor_pos, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecorationSet {
    decorations: Vec<Decoration>,
}

impl DecorationSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            decorations: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_vec(mut decorations: Vec<Decoration>) -> Self {
        decorations.sort_by(|a, b| {
            (a.start, a.anchor_pos, &a.id).cmp(&(b.start, b.anchor_pos, &b.id))
        });
        Self { decorations }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Decoration> {
        self.decorations.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decorations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decorations.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Decoration> {
        self.decorations.iter().find(|deco| deco.id == id)
    }

    /// Decorations touching `[from, to]`, boundaries included.
    #[must_use]
    pub fn find(&self, from: usize, to: usize) -> Vec<&Decoration> {
        self.decorations
            .iter()
            .filter(|deco| deco.start <= to && deco.end >= from)
            .collect()
    }

    /// `(start, end)` of every decoration in order.
    #[must_use]
    pub fn spans(&self) -> Vec<(usize, usize)> {
        self.decorations
            .iter()
            .map(|deco| (deco.start, deco.end))
            .collect()
    }

    /// Shift every decoration through `mapping`.
    ///
    /// Starts stick after inserted content and ends before it, so content
    /// inserted at a block boundary stays outside the span. Decorations that
    /// collapse are dropped.
    #[must_use]
    pub fn map(&self, mapping: &Mapping) -> Self {
        if mapping.is_empty() {
            return self.clone();
        }
        let mapped = self
            .decorations
            .iter()
            .filter_map(|deco| {
                let start = mapping.map(deco.start, Assoc::After);
                let end = mapping.map(deco.end, Assoc::Before);
                (start < end).then(|| Decoration {
                    start,
                    end,
                    anchor_pos: mapping.map(deco.anchor_pos, Assoc::After).clamp(start, end),
                    ..deco.clone()
                })
            })
            .collect();
        Self::from_vec(mapped)
    }
}

impl<'a> IntoIterator for &'a DecorationSet {
    type Item = &'a Decoration;
    type IntoIter = std::slice::Iter<'a, Decoration>;

    fn into_iter(self) -> Self::IntoIter {
        self.decorations.iter()
    }
}

/// Output of a full recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recomputed {
    pub set: DecorationSet,
    /// Annotations skipped because their anchor did not resolve.
    pub unresolved: Vec<String>,
    pub summaries: Vec<AnnotationSummary>,
}

/// Rebuild every decoration from `store` against the current `doc`.
///
/// Unresolved anchors are skipped, not reported as errors.
///
/// # Errors
///
/// [`AnnotationError::Layout`] if a resolved position has no enclosing
/// block.
pub fn recompute(
    doc: &dyn DocumentView,
    store: &AnnotationStore,
) -> Result<Recomputed, AnnotationError> {
    let blocks = doc.blocks();
    let mut decorations = Vec::with_capacity(store.len());
    let mut unresolved = Vec::new();
    for entry in store.entries() {
        let Some(pos) = doc.to_absolute(&entry.pos) else {
            trace!(id = %entry.id, "anchor unresolved");
            unresolved.push(entry.id.clone());
            continue;
        };
        let block = blocks
            .iter()
            .find(|block| block.start <= pos && pos < block.end)
            .or_else(|| blocks.iter().find(|block| block.end == pos))
            .ok_or_else(|| {
                AnnotationError::Layout(format!(
                    "annotation '{}' resolved to {pos}, outside every block",
                    entry.id
                ))
            })?;
        decorations.push(Decoration {
            id: entry.id.clone(),
            start: block.start,
            end: block.end,
            anchor_pos: pos,
            data: entry.data.clone(),
        });
    }
    Ok(Recomputed {
        set: DecorationSet::from_vec(decorations),
        unresolved,
        summaries: store.summarize(doc),
    })
}

/// Receives the decoration set every time it changes.
pub trait DecorationSink {
    fn decorations_changed(&mut self, set: &DecorationSet, annotations: &[AnnotationSummary]);
}

impl<F> DecorationSink for F
where
    F: FnMut(&DecorationSet, &[AnnotationSummary]),
{
    fn decorations_changed(&mut self, set: &DecorationSet, annotations: &[AnnotationSummary]) {
        self(set, annotations);
    }
}
