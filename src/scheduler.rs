//! The debounced drain pass: classify records, dispatch to the
//! transport, reconcile the upgrade reply against possibly-mutated
//! records.

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::{EngineError, EngineErrorKind};
use crate::event::{Event, EventKind};
use crate::ids::{ControlId, EntityId, WrapperId};
use crate::parser::parse_options;
use crate::state::{EntityState, UnloadedOutcome, UpgradeResolution};
use crate::transport::{EntityUpdate, ReplacementModel, UpdateItem, UpgradeItem};

impl Engine {
    /// One drain pass. Returns whether more work is known to remain and
    /// another drain should be scheduled.
    pub(crate) async fn drain(&self) -> bool {
        let (updates, upgrades, batch_ids) = self.classify();

        if !updates.is_empty() {
            let count = updates.len();
            if let Err(err) = self.transport.update_entities(updates).await {
                self.emit(EventKind::Error((&err).into()));
            } else {
                self.emit(EventKind::DispatchedUpdateBatch { count });
            }
        }

        if upgrades.is_empty() {
            return false;
        }

        let count = upgrades.len();
        self.emit(EventKind::DispatchedUpgradeBatch { count });
        let current_upgrade_index = self
            .inner
            .borrow()
            .current_upgrade_index
            .unwrap_or_default();

        match self.transport.upgrade_entities(upgrades, current_upgrade_index).await {
            Ok(replacements) => self.reconcile_upgrade_success(batch_ids, replacements),
            Err(err) => {
                self.emit(EventKind::Error((&err).into()));
                self.reconcile_upgrade_failure(batch_ids)
            }
        }
    }

    /// Scans the record table, transitioning `Unloaded` records forward
    /// and removing records whose weak handle is dead or which are
    /// `PendingDelete`. Synchronous: no suspension point, so the map is
    /// never observed half-updated by a concurrent call.
    fn classify(&self) -> (Vec<UpdateItem>, Vec<UpgradeItem>, HashMap<EntityId, WrapperId>) {
        let mut inner = self.inner.borrow_mut();
        let current_upgrade_index = inner.current_upgrade_index;

        let mut updates = Vec::new();
        let mut upgrades = Vec::new();
        let mut batch_ids = HashMap::new();
        let mut to_remove = Vec::new();
        let mut deferred_events = Vec::new();

        for (id, record) in inner.records.iter_mut() {
            match record.state {
                EntityState::Unloaded => {
                    let Some(snapshot) = record.weak_handle.upgrade() else {
                        let err = EngineError::new(EngineErrorKind::Reclaimed {
                            entity_id: id.clone(),
                        });
                        deferred_events.push(EventKind::Error((&err).into()));
                        to_remove.push(id.clone());
                        continue;
                    };

                    let is_stale = match (snapshot.upgrade_index, current_upgrade_index) {
                        (Some(entity_index), Some(current)) => entity_index != current,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };

                    match record.state.drain_unloaded(is_stale) {
                        Some(UnloadedOutcome::BecameReady) => {
                            let definition =
                                self.definitions.get_entity_definition(&snapshot.definition_id);
                            match &definition {
                                Some(def) if def.has_lifecycle_functions => {
                                    let (options, variable_ids) =
                                        parse_options(Some(def), &snapshot.options, self.parser.as_ref());
                                    record.last_referenced_variables = variable_ids;
                                    updates.push(UpdateItem::Upsert(EntityUpdate {
                                        id: id.clone(),
                                        kind: snapshot.kind,
                                        control_id: record.control_id.clone(),
                                        definition_id: snapshot.definition_id.clone(),
                                        options,
                                        upgrade_index: snapshot.upgrade_index,
                                        disabled: snapshot.disabled,
                                        is_inverted: snapshot.is_inverted,
                                    }));
                                    deferred_events.push(EventKind::EmittedUpdate {
                                        entity_id: id.clone(),
                                    });
                                }
                                Some(_) => {
                                    // has_lifecycle_functions = false: the module
                                    // doesn't need to know about this entity at all.
                                }
                                None => {
                                    let err = EngineError::new(EngineErrorKind::UnknownDefinition {
                                        entity_id: id.clone(),
                                        definition_id: snapshot.definition_id.clone(),
                                    });
                                    deferred_events.push(EventKind::Error((&err).into()));
                                }
                            }
                        }
                        Some(UnloadedOutcome::BeganUpgrade) => {
                            upgrades.push(UpgradeItem {
                                id: id.clone(),
                                kind: snapshot.kind,
                                control_id: record.control_id.clone(),
                                definition_id: snapshot.definition_id.clone(),
                                options: snapshot.options.clone(),
                                disabled: snapshot.disabled,
                                is_inverted: snapshot.is_inverted,
                            });
                            batch_ids.insert(id.clone(), record.wrapper_id);
                            deferred_events.push(EventKind::EmittedUpgrade {
                                entity_id: id.clone(),
                            });
                        }
                        None => unreachable!("record.state was just matched as Unloaded"),
                    }
                }
                EntityState::PendingDelete => {
                    to_remove.push(id.clone());
                    match record.weak_handle.upgrade() {
                        Some(snapshot) => {
                            updates.push(UpdateItem::Delete {
                                id: id.clone(),
                                kind: snapshot.kind,
                            });
                            deferred_events.push(EventKind::EmittedDelete {
                                entity_id: id.clone(),
                            });
                        }
                        None => {
                            deferred_events.push(EventKind::DeleteSkippedAlreadyReclaimed {
                                entity_id: id.clone(),
                            });
                        }
                    }
                }
                EntityState::Upgrading | EntityState::UpgradingInvalidated | EntityState::Ready => {
                    // Already in flight or already reconciled; ignored this pass.
                }
            }
        }

        for id in to_remove {
            inner.records.shift_remove(&id);
        }
        drop(inner);

        for kind in deferred_events {
            self.emit(kind);
        }

        (updates, upgrades, batch_ids)
    }

    /// `upgrade_entities` succeeded. Re-checks the gate (it may have
    /// closed while the RPC was in flight) and, for every record the
    /// batch referred to, applies or discards the replacement depending
    /// on what the record's wrapper id and state look like *now* —
    /// which may differ from when the batch was dispatched.
    fn reconcile_upgrade_success(
        &self,
        batch_ids: HashMap<EntityId, WrapperId>,
        mut replacements: HashMap<EntityId, ReplacementModel>,
    ) -> bool {
        if !self.inner.borrow().gate_open {
            return false;
        }

        let mut more_work = false;
        let mut deferred_events = Vec::new();
        // `handle.replace_entity` below is specified to synchronously
        // `track` the resulting entity (spec.md §5, §9 "Replacement
        // reentrancy"), which itself needs to borrow `self.inner` mutably.
        // Collect what to apply while `inner` is borrowed, then apply it
        // only after the borrow is dropped, so a reentrant `track` never
        // races this one.
        let mut pending_replacements: Vec<(EntityId, ControlId, ReplacementModel)> = Vec::new();

        {
            let mut inner = self.inner.borrow_mut();
            for (id, wrapper_id) in &batch_ids {
                let Some(record) = inner.records.get_mut(id) else {
                    continue;
                };
                if record.wrapper_id != *wrapper_id {
                    deferred_events.push(EventKind::IgnoredStaleWrapperId {
                        entity_id: id.clone(),
                    });
                    continue;
                }

                if record.weak_handle.upgrade().is_none() {
                    let err = EngineError::new(EngineErrorKind::Reclaimed {
                        entity_id: id.clone(),
                    });
                    deferred_events.push(EventKind::Error((&err).into()));
                    inner.records.shift_remove(id);
                    continue;
                }

                match record.state.upgrade_succeeded() {
                    UpgradeResolution::Apply => {
                        more_work = true;
                        if let Some(replacement) = replacements.remove(id) {
                            pending_replacements.push((id.clone(), record.control_id.clone(), replacement));
                        }
                    }
                    UpgradeResolution::Discard => {
                        more_work = true;
                        deferred_events.push(EventKind::DiscardedStaleUpgradeReply {
                            entity_id: id.clone(),
                        });
                    }
                    UpgradeResolution::PretendSuccess | UpgradeResolution::Tolerate => {
                        // PendingDelete, Ready, or Unloaded here is impossible in
                        // principle; tolerate silently.
                    }
                }
            }
        }

        for (id, control_id, replacement) in pending_replacements {
            match self.controls.get_control(&control_id) {
                Some(handle) => {
                    if let Err(err) = handle.replace_entity(replacement) {
                        deferred_events.push(EventKind::Error((&err).into()));
                    } else {
                        deferred_events.push(EventKind::AppliedUpgradeReplacement { entity_id: id, control_id });
                    }
                }
                None => {
                    let err = EngineError::new(EngineErrorKind::UnknownControl { entity_id: id, control_id });
                    deferred_events.push(EventKind::Error((&err).into()));
                }
            }
        }

        for kind in deferred_events {
            self.emit(kind);
        }

        more_work
    }

    /// `upgrade_entities` failed outright. `Upgrading` records pretend
    /// success, avoiding wedging the pipeline on a module that
    /// permanently rejects an upgrade; `UpgradingInvalidated` records
    /// retry from scratch.
    fn reconcile_upgrade_failure(&self, batch_ids: HashMap<EntityId, WrapperId>) -> bool {
        let mut more_work = false;
        let mut inner = self.inner.borrow_mut();
        for (id, wrapper_id) in &batch_ids {
            let Some(record) = inner.records.get_mut(id) else {
                continue;
            };
            if record.wrapper_id != *wrapper_id {
                continue;
            }
            match record.state.upgrade_failed() {
                UpgradeResolution::PretendSuccess | UpgradeResolution::Discard => {
                    more_work = true;
                }
                UpgradeResolution::Apply | UpgradeResolution::Tolerate => {}
            }
        }
        more_work
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.events.on_event(Event::new(kind));
    }
}
