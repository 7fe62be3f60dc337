use std::fmt;

/// Errors raised by annotation operations.
///
/// Only [`AnnotationError::MissingTarget`] and [`AnnotationError::MissingTargets`]
/// signal an invariant violation upstream. Unresolved anchors are never an
/// error; they are skipped during decoration recomputation.
#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    /// The document is not attached to a replica yet.
    #[error("document is not bound to a replica")]
    Unbound,

    /// An absolute position past the end of the current document.
    #[error("position {pos} is outside the document (size {size})")]
    PositionOutOfRange { pos: usize, size: usize },

    /// `move`/`update` addressed an id that is not live in the store.
    #[error("annotation '{id}' does not exist")]
    MissingTarget { id: String },

    /// A `move-many` batch contained ids that are not live in the store.
    ///
    /// Every other move in the batch has been applied.
    #[error("{} annotation(s) missing from move batch: {}", .ids.len(), .ids.join(", "))]
    MissingTargets { ids: Vec<String> },

    /// A document mutation that the block model cannot express.
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    /// The document layout is inconsistent with a resolved anchor.
    #[error("layout error: {0}")]
    Layout(String),

    /// Snapshot or wire payload failed to (de)serialize.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl AnnotationError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unbound => ErrorCode::Unbound,
            Self::PositionOutOfRange { .. } => ErrorCode::PositionOutOfRange,
            Self::MissingTarget { .. } | Self::MissingTargets { .. } => ErrorCode::MissingTarget,
            Self::InvalidEdit(_) => ErrorCode::InvalidEdit,
            Self::Layout(_) => ErrorCode::LayoutInconsistent,
            Self::Codec(_) => ErrorCode::CodecFailure,
        }
    }
}

/// Machine-readable error codes for hosts that surface failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unbound,
    PositionOutOfRange,
    MissingTarget,
    InvalidEdit,
    LayoutInconsistent,
    CodecFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unbound => "E1001",
            Self::PositionOutOfRange => "E2001",
            Self::MissingTarget => "E2002",
            Self::InvalidEdit => "E2003",
            Self::LayoutInconsistent => "E3001",
            Self::CodecFailure => "E4001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Unbound => "Document not bound to a replica",
            Self::PositionOutOfRange => "Position out of range",
            Self::MissingTarget => "Annotation not found",
            Self::InvalidEdit => "Invalid document edit",
            Self::LayoutInconsistent => "Inconsistent document layout",
            Self::CodecFailure => "Snapshot encode/decode failed",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::Unbound => Some("Attach the document to a replica before mutating annotations."),
            Self::PositionOutOfRange => None,
            Self::MissingTarget => {
                Some("A caller assumed an annotation id was live; check the action producer.")
            }
            Self::InvalidEdit => Some("Edits must stay inside one block or target a block boundary."),
            Self::LayoutInconsistent => {
                Some("Decorations rebuild on the next observed change; report if persistent.")
            }
            Self::CodecFailure => Some("Verify the snapshot was produced by a compatible version."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
