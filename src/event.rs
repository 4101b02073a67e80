//! Observability hook: a struct identifying what happened, and a trait
//! a host can implement to receive it. The default implementation just
//! logs through `tracing`.

use crate::error::EngineError;
use crate::ids::{ControlId, EntityId};

#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
}

impl Event {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self { kind }
    }
}

/// What sort of notable thing occurred. Extend, don't remove, if the
/// scheduler grows new paths worth logging.
#[derive(Debug)]
#[non_exhaustive]
pub enum EventKind {
    /// A record moved from `Unloaded` straight to `Ready` and an `update`
    /// batch item was emitted for it.
    EmittedUpdate { entity_id: EntityId },
    /// A record moved from `Unloaded` to `Upgrading` and an `upgrade`
    /// batch item was emitted for it.
    EmittedUpgrade { entity_id: EntityId },
    /// A `delete` batch item was emitted for a `PendingDelete` record.
    EmittedDelete { entity_id: EntityId },
    /// A `PendingDelete` record's weak handle was already dead at drain
    /// time; no delete was emitted. The module never learned of the
    /// entity in the first place, so there is nothing to tombstone.
    DeleteSkippedAlreadyReclaimed { entity_id: EntityId },
    /// An in-flight upgrade's replacement was handed to the owning
    /// control.
    AppliedUpgradeReplacement {
        entity_id: EntityId,
        control_id: ControlId,
    },
    /// An in-flight upgrade's replacement was discarded because the
    /// record was invalidated while the RPC was in flight.
    DiscardedStaleUpgradeReply { entity_id: EntityId },
    /// The upgrade batch's reply referenced a wrapper id that no longer
    /// matches the live record — the slot was replaced or forgotten
    /// mid-flight.
    IgnoredStaleWrapperId { entity_id: EntityId },
    /// A drain pass dispatched an `update` batch.
    DispatchedUpdateBatch { count: usize },
    /// A drain pass dispatched an `upgrade` batch.
    DispatchedUpgradeBatch { count: usize },
    /// Something failed; see the attached error for recovery semantics.
    /// A record's weak handle observed dead (outside the `PendingDelete`
    /// tombstone-skip case above) arrives here as `EngineErrorKind::Reclaimed`.
    Error(EngineErrorRef),
}

/// An owned copy of an [`EngineError`] suitable for embedding in an
/// [`EventKind`] without forcing `Event` to carry a lifetime.
#[derive(Debug)]
pub struct EngineErrorRef(pub String);

impl From<&EngineError> for EngineErrorRef {
    fn from(err: &EngineError) -> Self {
        Self(err.to_string())
    }
}

/// Receives engine events. The default logs at `debug`/`warn` through
/// `tracing`.
pub trait EventSink {
    fn on_event(&self, event: Event) {
        match &event.kind {
            EventKind::Error(EngineErrorRef(detail)) => {
                tracing::warn!(%detail, "entity-reconciler error")
            }
            EventKind::DeleteSkippedAlreadyReclaimed { entity_id } => {
                tracing::warn!(entity_id = ?entity_id, kind = ?event.kind, "entity reclaimed")
            }
            _ => tracing::debug!(kind = ?event.kind, "entity-reconciler event"),
        }
    }
}

/// The default, logging-only sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {}
