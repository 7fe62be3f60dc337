//! Transaction metadata: the action protocol and structural tags.
//!
//! Both serialize with a kebab-case `type` tag and camelCase fields, e.g.
//! `{"type":"move-many","toMove":[{"id":"c1","newPos":11}]}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::{Mapping, StepMap};
pub use crate::store::MoveInstruction;

/// Explicit request to change the annotation set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Add {
        id: String,
        pos: usize,
        data: Value,
    },
    Update {
        id: String,
        data: Value,
    },
    Delete {
        id: String,
    },
    Clear,
    #[serde(rename_all = "camelCase")]
    MoveMany {
        to_move: Vec<MoveInstruction>,
    },
    Refresh,
}

impl Action {
    /// Stable action name, as on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Clear => "clear",
            Self::MoveMany { .. } => "move-many",
            Self::Refresh => "refresh",
        }
    }
}

/// Marks a local structural edit whose decoration mapping is suppressed
/// because a relocation pass follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StructuralTag {
    SplitAtStart,
    #[serde(rename_all = "camelCase")]
    JoinBlock { current_pos: usize, new_pos: usize },
}

/// Where a transaction's authority came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Local,
    /// Replicated in from another participant.
    Remote,
}

/// How the undo stack records a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum History {
    /// Start a new undo entry.
    #[default]
    NewEntry,
    /// Fold the annotation log into the most recent entry.
    MergeWithLast,
    /// Do not touch the undo stack.
    Skip,
}

/// One unit of change flowing through the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub origin: Origin,
    pub action: Option<Action>,
    pub tag: Option<StructuralTag>,
    /// Position delta of the document edit, empty if the document did not
    /// change.
    pub mapping: Mapping,
    pub history: History,
}

impl Transaction {
    /// A local document edit.
    #[must_use]
    pub fn edit(step: StepMap) -> Self {
        Self {
            origin: Origin::Local,
            action: None,
            tag: None,
            mapping: Mapping::from(step),
            history: History::NewEntry,
        }
    }

    /// A local transaction carrying only an action.
    #[must_use]
    pub fn action(action: Action) -> Self {
        Self {
            origin: Origin::Local,
            action: Some(action),
            tag: None,
            mapping: Mapping::new(),
            history: History::NewEntry,
        }
    }

    /// A change replicated from another participant.
    #[must_use]
    pub fn remote(mapping: Mapping) -> Self {
        Self {
            origin: Origin::Remote,
            action: None,
            tag: None,
            mapping,
            history: History::Skip,
        }
    }

    #[must_use]
    pub const fn with_tag(mut self, tag: StructuralTag) -> Self {
        self.tag = Some(tag);
        self
    }

    #[must_use]
    pub const fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn doc_changed(&self) -> bool {
        !self.mapping.is_empty()
    }
}
