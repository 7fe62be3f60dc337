//! marginalia-core library.
//!
//! Block-level annotations over a replicated document. Annotations are
//! anchored to document items rather than absolute positions, so they follow
//! their text through concurrent local and remote edits, and are relocated
//! explicitly when block splits and joins recreate that text.
//!
//! The pieces, bottom-up:
//!
//! - [`replica`]: Lamport-stamped RGA document and last-writer-wins map.
//! - [`anchor`] and [`mapping`]: the position bridge and position deltas.
//! - [`store`]: the replicated annotation map with a reversible-operation log.
//! - [`decoration`]: block spans derived from the store.
//! - [`state`]: the transaction classifier that keeps decorations current.
//! - [`relocation`], [`undo`], [`keymap`]: structural edits and history.
//! - [`editor`]: a reference host tying one document to all of the above.
//!
//! # Conventions
//!
//! - **Errors**: [`AnnotationError`] for library operations, `anyhow::Result`
//!   for configuration loading.
//! - **Logging**: `tracing` macros; every record carries the editor
//!   `instance` field.

pub mod action;
pub mod anchor;
pub mod config;
pub mod decoration;
pub mod editor;
pub mod error;
pub mod keymap;
pub mod mapping;
pub mod relocation;
pub mod replica;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod undo;

pub use action::{Action, History, Origin, StructuralTag, Transaction};
pub use anchor::{Anchor, AnchorResolver, BlockSpan, DocumentView};
pub use config::{AnnotationConfig, load_config, load_user_config};
pub use decoration::{Decoration, DecorationSet, DecorationSink};
pub use editor::{Editor, Selection, SyncMessage};
pub use error::{AnnotationError, ErrorCode};
pub use mapping::{Assoc, Mapping, StepMap};
pub use replica::{BlockKind, ReplicaId, ReplicatedDocument};
pub use store::{AnnotationEntry, AnnotationStore, AnnotationSummary, MoveInstruction};
pub use telemetry::{AnnotationEvent, EventSubscriber, TelemetrySnapshot};
