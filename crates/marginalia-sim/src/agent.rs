use anyhow::{Context, Result};
use marginalia_core::store::StoreSnapshot;
use marginalia_core::{BlockSpan, DecorationSet, DocumentView, Editor, MoveInstruction, SyncMessage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::rng::DeterministicRng;

/// Stable identifier for a simulated agent.
pub type AgentId = usize;

/// Replicated state of one agent at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentState {
    pub id: AgentId,
    pub html: String,
    pub doc_size: usize,
    pub store: StoreSnapshot,
    pub decorations: DecorationSet,
    /// Live annotations whose anchor does not resolve.
    pub unresolved: Vec<String>,
}

/// Counts observed right after a remote delivery.
///
/// Every live annotation must either be decorated or have an unresolved
/// anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonotonicitySample {
    pub agent: AgentId,
    pub round: u64,
    pub store_len: usize,
    pub decorations: usize,
    pub unresolved: usize,
}

impl MonotonicitySample {
    #[must_use]
    pub const fn holds(&self) -> bool {
        self.store_len == self.decorations + self.unresolved
    }
}

/// Random local change applied between barriers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum LocalOp {
    Type { pos: usize, text: String },
    DeleteChar { pos: usize },
    Annotate { pos: usize, id: String },
    Update { id: String },
    Remove { id: String },
    Move { id: String, pos: usize },
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructuralKey {
    Enter,
    Backspace,
    Delete,
}

/// Key press applied at a barrier round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralOp {
    pub key: StructuralKey,
    pub pos: usize,
    pub handled: bool,
    /// Relocation plans recorded by the key handler.
    pub relocations: u64,
}

const ALPHABET: &[char] = &['a', 'e', 'i', 'o', 'n', 's', 't', ' '];

/// An [`Editor`] replica driven by its own random stream.
pub struct SimAgent {
    id: AgentId,
    editor: Editor,
    rng: DeterministicRng,
    samples: Vec<MonotonicitySample>,
    edits: u64,
}

impl std::fmt::Debug for SimAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimAgent")
            .field("id", &self.id)
            .field("editor", &self.editor)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

impl SimAgent {
    #[must_use]
    pub fn new(id: AgentId, mut editor: Editor, mut rng: DeterministicRng) -> Self {
        editor.seed_ids(rng.next_u64());
        Self {
            id,
            editor,
            rng,
            samples: Vec::new(),
            edits: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn editor(&self) -> &Editor {
        &self.editor
    }

    #[must_use]
    pub fn samples(&self) -> &[MonotonicitySample] {
        &self.samples
    }

    fn random_block(&mut self) -> Option<BlockSpan> {
        let blocks = self.editor.document().blocks();
        self.rng.pick(&blocks).copied()
    }

    fn random_content_pos(&mut self) -> Option<usize> {
        let block = self.random_block()?;
        Some(self.rng.next_in(block.content_start(), block.content_end()))
    }

    fn random_live_id(&mut self) -> Option<String> {
        let ids = self.editor.store().ids();
        self.rng.pick(&ids).cloned()
    }

    /// Apply one random local change.
    ///
    /// # Errors
    ///
    /// Any editor error; the generated positions are always valid, so an
    /// error means a bug in the editor.
    pub fn local_step(&mut self) -> Result<LocalOp> {
        let roll = self.rng.next_bounded(100);
        let op = match roll {
            0..35 => self.type_text()?,
            35..55 => self.delete_char()?,
            55..70 => self.annotate()?,
            70..80 => self.update()?,
            80..85 => self.remove()?,
            85..95 => self.relocate()?,
            _ => LocalOp::Idle,
        };
        trace!(agent = self.id, ?op, "local step");
        Ok(op)
    }

    fn type_text(&mut self) -> Result<LocalOp> {
        let Some(pos) = self.random_content_pos() else {
            return Ok(LocalOp::Idle);
        };
        let len = self.rng.next_in(1, 3);
        let text: String = (0..len)
            .filter_map(|_| self.rng.pick(ALPHABET).copied())
            .collect();
        self.editor
            .insert_text(pos, &text)
            .with_context(|| format!("agent {} typing at {pos}", self.id))?;
        Ok(LocalOp::Type { pos, text })
    }

    fn delete_char(&mut self) -> Result<LocalOp> {
        let Some(block) = self.random_block() else {
            return Ok(LocalOp::Idle);
        };
        if block.is_empty() {
            return Ok(LocalOp::Idle);
        }
        let pos = self
            .rng
            .next_in(block.content_start(), block.content_end() - 1);
        self.editor
            .delete_range(pos, pos + 1)
            .with_context(|| format!("agent {} deleting at {pos}", self.id))?;
        Ok(LocalOp::DeleteChar { pos })
    }

    fn annotate(&mut self) -> Result<LocalOp> {
        let Some(pos) = self.random_content_pos() else {
            return Ok(LocalOp::Idle);
        };
        self.edits += 1;
        self.editor.set_cursor(pos)?;
        let id = self
            .editor
            .add_annotation(json!({ "by": self.id, "n": self.edits }))
            .with_context(|| format!("agent {} annotating at {pos}", self.id))?;
        Ok(LocalOp::Annotate { pos, id })
    }

    fn update(&mut self) -> Result<LocalOp> {
        let Some(id) = self.random_live_id() else {
            return Ok(LocalOp::Idle);
        };
        self.edits += 1;
        self.editor
            .update_annotation(&id, json!({ "by": self.id, "n": self.edits }))
            .with_context(|| format!("agent {} updating {id}", self.id))?;
        Ok(LocalOp::Update { id })
    }

    fn remove(&mut self) -> Result<LocalOp> {
        let Some(id) = self.random_live_id() else {
            return Ok(LocalOp::Idle);
        };
        self.editor.delete_annotation(&id)?;
        Ok(LocalOp::Remove { id })
    }

    fn relocate(&mut self) -> Result<LocalOp> {
        let (Some(id), Some(pos)) = (self.random_live_id(), self.random_content_pos()) else {
            return Ok(LocalOp::Idle);
        };
        self.editor
            .move_annotations(vec![MoveInstruction {
                id: id.clone(),
                new_pos: pos,
            }])
            .with_context(|| format!("agent {} moving {id} to {pos}", self.id))?;
        Ok(LocalOp::Move { id, pos })
    }

    /// Press Enter, Backspace or Delete somewhere and run the relocation it
    /// schedules. Only safe while no other replica is editing.
    ///
    /// # Errors
    ///
    /// Any editor error, including a relocation that misses its targets.
    pub fn structural_step(&mut self) -> Result<StructuralOp> {
        let Some(block) = self.random_block() else {
            return Ok(StructuralOp {
                key: StructuralKey::Enter,
                pos: 0,
                handled: false,
                relocations: 0,
            });
        };
        let at_boundary = self.rng.hit_rate_percent(70);
        let (key, pos) = match self.rng.next_bounded(3) {
            0 => (
                StructuralKey::Enter,
                self.rng.next_in(block.content_start(), block.content_end()),
            ),
            1 if at_boundary => (StructuralKey::Backspace, block.content_start()),
            1 => (
                StructuralKey::Backspace,
                self.rng.next_in(block.content_start(), block.content_end()),
            ),
            _ if at_boundary => (StructuralKey::Delete, block.content_end()),
            _ => (
                StructuralKey::Delete,
                self.rng.next_in(block.content_start(), block.content_end()),
            ),
        };

        let before = self.editor.telemetry().relocations;
        self.editor.set_cursor(pos)?;
        let handled = match key {
            StructuralKey::Enter => self.editor.press_enter(),
            StructuralKey::Backspace => self.editor.press_backspace(),
            StructuralKey::Delete => self.editor.press_delete(),
        }
        .with_context(|| format!("agent {} pressing {key:?} at {pos}", self.id))?;
        self.editor
            .run_deferred()
            .with_context(|| format!("agent {} relocating after {key:?}", self.id))?;

        Ok(StructuralOp {
            key,
            pos,
            handled,
            relocations: self.editor.telemetry().relocations - before,
        })
    }

    /// Local changes not yet sent.
    pub fn outgoing(&mut self) -> Option<SyncMessage> {
        self.editor.sync_message()
    }

    /// Full state, for anti-entropy repair.
    #[must_use]
    pub fn state_message(&self) -> SyncMessage {
        self.editor.state_message()
    }

    /// Apply a remote message and record a monotonicity sample.
    ///
    /// # Errors
    ///
    /// Editor errors from the remote transaction.
    pub fn deliver(&mut self, message: &SyncMessage, round: u64) -> Result<()> {
        self.editor
            .receive(message)
            .with_context(|| format!("agent {} receiving from {}", self.id, message.from))?;
        let unresolved = self.unresolved().len();
        self.samples.push(MonotonicitySample {
            agent: self.id,
            round,
            store_len: self.editor.store().len(),
            decorations: self.editor.decorations().len(),
            unresolved,
        });
        Ok(())
    }

    fn unresolved(&self) -> Vec<String> {
        self.editor
            .summaries()
            .into_iter()
            .filter(|summary| summary.pos.is_none())
            .map(|summary| summary.id)
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentState {
        AgentState {
            id: self.id,
            html: self.editor.html(),
            doc_size: self.editor.document().size(),
            store: self.editor.store().snapshot(),
            decorations: self.editor.decorations().clone(),
            unresolved: self.unresolved(),
        }
    }
}
