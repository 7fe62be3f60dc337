//! Structured annotation events and counters.
//!
//! Hosts observe the annotation state machine through [`EventSubscriber`]
//! instead of scraping logs. Every emitted event also bumps a counter in
//! [`Telemetry`], and when event tracing is on it is mirrored to a
//! `tracing` debug record carrying the editor's instance name.

use serde::Serialize;
use tracing::debug;

/// Something the annotation state machine did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AnnotationEvent {
    /// An explicit action was applied to the store.
    ActionApplied { action: &'static str },
    /// A remote-origin transaction forced a full rebuild.
    RemoteRecompute,
    RecomputeFinished { decorations: usize, unresolved: usize },
    /// Recompute failed; the previous decorations were kept.
    RecomputeFailed { error: String },
    AnchorUnresolved { id: String },
    /// A mutation was dropped because the document is unbound.
    UnboundSkip { action: &'static str },
    RelocationPlanned { edit: &'static str, moves: usize },
    MoveTargetMissing { id: String },
    HistoryRestored { direction: &'static str, ops: usize },
}

impl AnnotationEvent {
    /// Stable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ActionApplied { .. } => "action-applied",
            Self::RemoteRecompute => "remote-recompute",
            Self::RecomputeFinished { .. } => "recompute-finished",
            Self::RecomputeFailed { .. } => "recompute-failed",
            Self::AnchorUnresolved { .. } => "anchor-unresolved",
            Self::UnboundSkip { .. } => "unbound-skip",
            Self::RelocationPlanned { .. } => "relocation-planned",
            Self::MoveTargetMissing { .. } => "move-target-missing",
            Self::HistoryRestored { .. } => "history-restored",
        }
    }
}

/// Receives every event emitted by an editor.
pub trait EventSubscriber {
    fn on_event(&mut self, instance: &str, event: &AnnotationEvent);
}

impl<F> EventSubscriber for F
where
    F: FnMut(&str, &AnnotationEvent),
{
    fn on_event(&mut self, instance: &str, event: &AnnotationEvent) {
        self(instance, event);
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub recomputes: u64,
    pub recompute_failures: u64,
    pub unresolved_anchors: u64,
    pub actions_applied: u64,
    pub remote_recomputes: u64,
    pub relocations: u64,
    pub missing_move_targets: u64,
    pub unbound_skips: u64,
}

/// Event fan-out plus counters for one editor instance.
pub struct Telemetry {
    instance: String,
    trace_events: bool,
    counters: TelemetrySnapshot,
    subscribers: Vec<Box<dyn EventSubscriber>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("instance", &self.instance)
            .field("trace_events", &self.trace_events)
            .field("counters", &self.counters)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Telemetry {
    #[must_use]
    pub fn new(instance: impl Into<String>, trace_events: bool) -> Self {
        Self {
            instance: instance.into(),
            trace_events,
            counters: TelemetrySnapshot::default(),
            subscribers: Vec::new(),
        }
    }

    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn subscribe(&mut self, subscriber: impl EventSubscriber + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    #[must_use]
    pub const fn snapshot(&self) -> TelemetrySnapshot {
        self.counters
    }

    pub fn emit(&mut self, event: AnnotationEvent) {
        let counters = &mut self.counters;
        match &event {
            AnnotationEvent::ActionApplied { .. } => counters.actions_applied += 1,
            AnnotationEvent::RemoteRecompute => counters.remote_recomputes += 1,
            AnnotationEvent::RecomputeFinished { .. } => counters.recomputes += 1,
            AnnotationEvent::RecomputeFailed { .. } => counters.recompute_failures += 1,
            AnnotationEvent::AnchorUnresolved { .. } => counters.unresolved_anchors += 1,
            AnnotationEvent::UnboundSkip { .. } => counters.unbound_skips += 1,
            AnnotationEvent::RelocationPlanned { .. } => counters.relocations += 1,
            AnnotationEvent::MoveTargetMissing { .. } => counters.missing_move_targets += 1,
            AnnotationEvent::HistoryRestored { .. } => {}
        }
        if self.trace_events {
            debug!(instance = %self.instance, event = event.name(), ?event, "annotation event");
        }
        for subscriber in &mut self.subscribers {
            subscriber.on_event(&self.instance, &event);
        }
    }
}

/// Runtime toggle for per-event debug records.
///
/// Enabled when either:
/// - `MARGINALIA_TRACE=1|true|yes|on`
/// - `MARGINALIA_LOG` contains `debug` or `trace`
#[must_use]
pub fn event_tracing_enabled() -> bool {
    let explicit = std::env::var("MARGINALIA_TRACE")
        .ok()
        .is_some_and(|value| is_truthy(&value));
    if explicit {
        return true;
    }

    std::env::var("MARGINALIA_LOG").ok().is_some_and(|value| {
        let lowered = value.to_ascii_lowercase();
        lowered.contains("debug") || lowered.contains("trace")
    })
}

pub(crate) fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
