//! The public API: `track`, `forget`, `resend_feedbacks`,
//! `on_variables_changed`, `on_definitions_changed`, `start`, `destroy`.
//!
//! Every method here is synchronous and fire-and-forget: it edits the
//! record table, decides whether anything actually changed, and if so
//! pokes the debounced scheduler — no suspension point exists inside
//! any of these calls. The scheduler itself lives in
//! [`crate::scheduler`], implemented as further `impl Engine` blocks so
//! the drain logic can share `Inner` without a public seam between the
//! two halves.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Instant;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use tokio::task::JoinHandle;

use crate::config::{Debouncer, EngineConfig};
use crate::control::ControlStore;
use crate::definition::DefinitionStore;
use crate::entity::{BoxedWeakEntityHandle, EntityKind};
use crate::event::EventSink;
use crate::ids::{ControlId, EntityId, VariableId, WrapperIdSource};
use crate::parser::VariableParser;
use crate::record::EntityRecord;
use crate::transport::Transport;

pub(crate) struct Inner {
    pub(crate) records: IndexMap<EntityId, EntityRecord>,
    pub(crate) current_upgrade_index: Option<u32>,
    /// Gates emission, not tracking: records may accumulate before
    /// `start` and are drained on the first post-start tick.
    pub(crate) gate_open: bool,
    pub(crate) wrapper_ids: WrapperIdSource,
}

pub(crate) struct SchedulerState {
    pub(crate) debouncer: Debouncer,
    pub(crate) pending: Option<JoinHandle<()>>,
}

/// The reconciliation engine.
///
/// Cheap to clone — every clone shares the same underlying state (an
/// `Rc`, not an `Arc`: the engine is explicitly single-threaded). Must
/// be constructed and used from within a `tokio::task::LocalSet`, since
/// the debounced drain is spawned with `spawn_local`.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Rc<RefCell<Inner>>,
    pub(crate) scheduler: Rc<RefCell<SchedulerState>>,
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) definitions: Rc<dyn DefinitionStore>,
    pub(crate) controls: Rc<dyn ControlStore>,
    pub(crate) parser: Rc<dyn VariableParser>,
    pub(crate) events: Rc<dyn EventSink>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Rc<dyn Transport>,
        definitions: Rc<dyn DefinitionStore>,
        controls: Rc<dyn ControlStore>,
        parser: Rc<dyn VariableParser>,
        events: Rc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                records: IndexMap::new(),
                current_upgrade_index: None,
                gate_open: false,
                wrapper_ids: WrapperIdSource::default(),
            })),
            scheduler: Rc::new(RefCell::new(SchedulerState {
                debouncer: Debouncer::new(config),
                pending: None,
            })),
            transport,
            definitions,
            controls,
            parser,
            events,
        }
    }

    /// Insert-or-replace the record for `entity_id`. Always resets state
    /// to `Unloaded` and mints a fresh wrapper id, even if a record
    /// already existed.
    pub fn track(&self, entity_id: EntityId, control_id: ControlId, weak_handle: BoxedWeakEntityHandle) {
        {
            let mut inner = self.inner.borrow_mut();
            let wrapper_id = inner.wrapper_ids.next();
            inner
                .records
                .insert(entity_id, EntityRecord::new(wrapper_id, weak_handle, control_id));
        }
        self.poke();
    }

    /// Idempotent: unknown ids are a no-op, not an error.
    pub fn forget(&self, entity_id: &EntityId) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            match inner.records.get_mut(entity_id) {
                Some(record) => record.state.mark_pending_delete(),
                None => false,
            }
        };
        if changed {
            self.poke();
        }
    }

    /// Invalidates every tracked `Feedback` record, regardless of state.
    pub fn resend_feedbacks(&self) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            let mut any = false;
            for record in inner.records.values_mut() {
                if let Some(snapshot) = record.weak_handle.upgrade() {
                    if snapshot.kind == EntityKind::Feedback {
                        any |= record.state.invalidate();
                    }
                }
            }
            any
        };
        if changed {
            self.poke();
        }
    }

    /// Records currently `Ready` whose last parse touched one of
    /// `changed_ids` move back to `Unloaded`. Records in any other state
    /// are left alone — they will re-parse on their own next pass.
    pub fn on_variables_changed(&self, changed_ids: &HashSet<VariableId>) {
        if changed_ids.is_empty() {
            return;
        }
        let changed = {
            let mut inner = self.inner.borrow_mut();
            let mut any = false;
            for record in inner.records.values_mut() {
                if record.last_referenced_variables.is_empty() {
                    continue;
                }
                let intersects = record
                    .last_referenced_variables
                    .iter()
                    .any(|v| changed_ids.contains(v));
                if intersects {
                    any |= record.state.invalidate_for_variable_change();
                }
            }
            any
        };
        if changed {
            self.poke();
        }
    }

    /// Invalidates every tracked record of the given kind, regardless of
    /// state — used when a module redeploys a definition.
    pub fn on_definitions_changed(&self, kind: EntityKind) {
        let changed = {
            let mut inner = self.inner.borrow_mut();
            let mut any = false;
            for record in inner.records.values_mut() {
                if let Some(snapshot) = record.weak_handle.upgrade() {
                    if snapshot.kind == kind {
                        any |= record.state.invalidate();
                    }
                }
            }
            any
        };
        if changed {
            self.poke();
        }
    }

    /// Records the engine's current schema version and opens the
    /// emission gate. Records tracked before this call are drained on
    /// the very next tick.
    pub fn start(&self, current_upgrade_index: u32) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.current_upgrade_index = Some(current_upgrade_index);
            inner.gate_open = true;
        }
        self.poke();
    }

    /// Cancels any pending drain, clears every record, and closes the
    /// gate. No flush, no RPCs — an upgrade reply that was already in
    /// flight still arrives later, but its continuation finds the gate
    /// closed and discards it.
    pub fn destroy(&self) {
        let mut scheduler = self.scheduler.borrow_mut();
        if let Some(handle) = scheduler.pending.take() {
            handle.abort();
        }
        scheduler.debouncer.reset();
        drop(scheduler);

        let mut inner = self.inner.borrow_mut();
        inner.records.clear();
        inner.gate_open = false;
    }

    /// Arms (or re-arms) the debounced drain. Leading-false / trailing,
    /// `wait` after the most recent poke, capped at `max_wait` after the
    /// first poke of the burst.
    pub(crate) fn poke(&self) {
        let now = Instant::now();
        let fire_at = {
            let mut scheduler = self.scheduler.borrow_mut();
            let fire_at = scheduler.debouncer.poke(now);
            if let Some(handle) = scheduler.pending.take() {
                handle.abort();
            }
            fire_at
        };

        let engine = self.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep_until(fire_at.into()).await;
            engine.on_debounce_fired().await;
        });
        self.scheduler.borrow_mut().pending = Some(handle);
    }

    /// Runs when a debounce burst's trailing edge (or max-wait cap)
    /// arrives. Drains if the gate is open; reschedules itself if the
    /// drain reports more work remains — a poke observed while draining
    /// is not lost.
    async fn on_debounce_fired(&self) {
        {
            let mut scheduler = self.scheduler.borrow_mut();
            scheduler.debouncer.reset();
            scheduler.pending = None;
        }

        if !self.inner.borrow().gate_open {
            return;
        }

        if self.drain().await {
            self.poke();
        }
    }
}

/// Variable ids touched by the most recent parse of an entity's options,
/// exposed only for tests that want to assert on it without reaching
/// into crate-private state.
#[cfg(any(test, feature = "testutil"))]
impl Engine {
    pub fn last_referenced_variables_for_test(&self, entity_id: &EntityId) -> Option<FxHashSet<VariableId>> {
        self.inner
            .borrow()
            .records
            .get(entity_id)
            .map(|r| r.last_referenced_variables.clone())
    }

    pub fn state_for_test(&self, entity_id: &EntityId) -> Option<crate::state::EntityState> {
        self.inner.borrow().records.get(entity_id).map(|r| r.state)
    }

    pub fn is_tracked_for_test(&self, entity_id: &EntityId) -> bool {
        self.inner.borrow().records.contains_key(entity_id)
    }

    pub fn record_count_for_test(&self) -> usize {
        self.inner.borrow().records.len()
    }
}
