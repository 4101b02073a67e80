//! Integration tests against the public API, exercising the scenarios
//! and invariants around the per-entity state machine and the debounced
//! batch scheduler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use entity_reconciler::testutil::{
    snapshot, EchoVariableParser, FakeEntity, FakeTransport, InMemoryControlStore, InMemoryDefinitionStore,
    ReentrantControlStore, RecordingEventSink, UpgradeScript,
};
use entity_reconciler::{
    ControlId, DefinitionId, Engine, EngineConfig, EntityDefinition, EntityId, EntityKind, EntityState, FieldDefinition,
    FieldId, OptionMap, OptionValue, ReplacementModel, VariableId,
};

fn small_config() -> EngineConfig {
    EngineConfig {
        wait: Duration::from_millis(5),
        max_wait: Duration::from_millis(20),
    }
}

/// Lets any local tasks spawned by a drain catch up with the test
/// driver. Needed because `spawn_local` tasks only progress when
/// something inside the `LocalSet` yields.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn advance_and_settle(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

struct Harness {
    engine: Engine,
    transport: Rc<FakeTransport>,
    controls: Rc<InMemoryControlStore>,
    events: RecordingEventSink,
}

fn harness(definitions: InMemoryDefinitionStore, control_id: &ControlId) -> Harness {
    let transport = Rc::new(FakeTransport::new());
    let controls = Rc::new(InMemoryControlStore::new().with_control(control_id.clone(), None));
    let events = RecordingEventSink::new();
    let engine = Engine::new(
        small_config(),
        transport.clone(),
        Rc::new(definitions),
        controls.clone(),
        Rc::new(EchoVariableParser::new()),
        Rc::new(events.clone()),
    );
    Harness {
        engine,
        transport,
        controls,
        events,
    }
}

#[test_log::test(tokio::test)]
async fn s1_upgrade_happy_path() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("a");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);

            h.engine.start(3);

            let mut snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            snap.upgrade_index = Some(1);
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());

            let mut options = OptionMap::new();
            options.insert(FieldId::new("k"), OptionValue::Number(1.0));
            let mut replacements = HashMap::new();
            replacements.insert(
                entity_id.clone(),
                ReplacementModel {
                    id: entity_id.clone(),
                    definition_id: DefinitionId::new("X"),
                    options,
                    style: None,
                    is_inverted: None,
                    upgrade_index: 3,
                },
            );
            h.transport.push_upgrade_script(UpgradeScript::Succeed(replacements));

            advance_and_settle(Duration::from_millis(10)).await;

            assert_eq!(h.transport.upgrade_batch_count(), 1);
            assert_eq!(h.transport.update_batch_count(), 0);
            assert_eq!(
                h.controls.replacement_log().calls(),
                vec![entity_id.clone()]
            );
            assert_eq!(h.engine.state_for_test(&entity_id), Some(EntityState::Ready));
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn s2_invalidation_during_upgrade_discards_reply() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("a");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);

            h.engine.start(3);

            let mut snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            snap.upgrade_index = Some(1);
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());

            let notify = Rc::new(tokio::sync::Notify::new());
            h.transport.arm_reply_gate(notify.clone());
            h.transport.push_upgrade_script(UpgradeScript::Succeed(HashMap::new()));

            tokio::time::advance(Duration::from_millis(10)).await;
            settle().await;

            assert_eq!(h.transport.upgrade_batch_count(), 1);
            assert_eq!(
                h.engine.state_for_test(&entity_id),
                Some(EntityState::Upgrading)
            );

            h.engine.on_definitions_changed(EntityKind::Action);
            assert_eq!(
                h.engine.state_for_test(&entity_id),
                Some(EntityState::UpgradingInvalidated)
            );

            notify.notify_one();
            settle().await;
            advance_and_settle(Duration::from_millis(10)).await;

            assert!(h.controls.replacement_log().calls().is_empty());
            assert_eq!(h.transport.upgrade_batch_count(), 2);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn s3_variable_change_narrows_reparse() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e2");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");

            let label_field = FieldId::new("label");
            let id_field = FieldId::new("id");
            let definition = EntityDefinition {
                id: definition_id.clone(),
                fields: vec![
                    FieldDefinition {
                        id: label_field.clone(),
                        use_variables: true,
                    },
                    FieldDefinition {
                        id: id_field.clone(),
                        use_variables: true,
                    },
                ],
                ignored_for_subscribe: [id_field.clone()].into_iter().collect(),
                has_lifecycle_functions: true,
            };
            let definitions = InMemoryDefinitionStore::new().with(definition);
            let h = harness(definitions, &control_id);
            h.engine.start(3);

            let mut options = OptionMap::new();
            options.insert(label_field.clone(), OptionValue::String("$(v1) $(v2)".into()));
            options.insert(id_field.clone(), OptionValue::String("$(v3)".into()));
            let snap = snapshot(&entity_id, EntityKind::Feedback, &definition_id, options);
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());

            advance_and_settle(Duration::from_millis(10)).await;
            assert_eq!(h.transport.update_batch_count(), 1);
            assert_eq!(h.engine.state_for_test(&entity_id), Some(EntityState::Ready));

            let v3 = VariableId::new("v3");
            let v2 = VariableId::new("v2");

            h.engine
                .on_variables_changed(&[v3].into_iter().collect());
            assert_eq!(h.engine.state_for_test(&entity_id), Some(EntityState::Ready));

            h.engine
                .on_variables_changed(&[v2].into_iter().collect());
            assert_eq!(h.engine.state_for_test(&entity_id), Some(EntityState::Unloaded));

            advance_and_settle(Duration::from_millis(10)).await;
            assert_eq!(h.transport.update_batch_count(), 2);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn s4_weak_reclamation_mid_track_drops_silently() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e3");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);
            h.engine.start(3);

            let snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());
            entity.kill();

            advance_and_settle(Duration::from_millis(10)).await;

            assert!(!h.engine.is_tracked_for_test(&entity_id));
            assert_eq!(h.transport.update_batch_count(), 0);
            assert_eq!(h.transport.upgrade_batch_count(), 0);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn s5_forget_before_first_emission_sends_tombstone() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e4");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);
            h.engine.start(3);

            let snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());
            h.engine.forget(&entity_id);

            advance_and_settle(Duration::from_millis(10)).await;

            assert_eq!(h.transport.update_batch_count(), 1);
            assert_eq!(h.transport.last_update_batch_ids(), vec![entity_id.clone()]);
            assert_eq!(h.transport.upgrade_batch_count(), 0);
            assert!(!h.engine.is_tracked_for_test(&entity_id));
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn s6_upgrade_rpc_failure_pretends_success() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e5");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);
            h.engine.start(3);

            let mut snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            snap.upgrade_index = Some(1);
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());
            h.transport.push_upgrade_script(UpgradeScript::Fail);

            advance_and_settle(Duration::from_millis(10)).await;

            assert_eq!(h.engine.state_for_test(&entity_id), Some(EntityState::Ready));
            assert!(h.controls.replacement_log().calls().is_empty());
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn no_rpc_emitted_before_start() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e6");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);

            let snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());

            advance_and_settle(Duration::from_millis(50)).await;

            assert_eq!(h.transport.update_batch_count(), 0);
            assert_eq!(h.transport.upgrade_batch_count(), 0);
            assert!(h.engine.is_tracked_for_test(&entity_id));

            h.engine.start(0);
            advance_and_settle(Duration::from_millis(10)).await;
            assert_eq!(h.transport.update_batch_count(), 1);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn forget_is_idempotent_and_empty_variable_change_is_a_noop() {
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("e7");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &control_id);
            h.engine.start(0);

            let snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), control_id.clone(), entity.handle());
            advance_and_settle(Duration::from_millis(10)).await;
            assert_eq!(h.transport.update_batch_count(), 1);

            h.engine.forget(&entity_id);
            h.engine.forget(&entity_id);
            h.engine.forget(&EntityId::new("never-tracked"));

            h.engine.on_variables_changed(&Default::default());

            advance_and_settle(Duration::from_millis(10)).await;
            assert_eq!(h.transport.update_batch_count(), 2);
            assert!(!h.engine.is_tracked_for_test(&entity_id));
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn unknown_control_id_is_rejected_gracefully() {
    // Not part of the named scenarios, but exercises the `UnknownControl`
    // error path: the control vanished between tracking and the upgrade
    // reply. get_control returns None for an id the store never saw.
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("a");
            let missing_control = ControlId::new("ghost");
            let definition_id = DefinitionId::new("defA");
            let h = harness(InMemoryDefinitionStore::new(), &ControlId::new("c1"));
            h.engine.start(3);

            let mut snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            snap.upgrade_index = Some(1);
            let entity = FakeEntity::new(snap);
            h.engine.track(entity_id.clone(), missing_control, entity.handle());

            let mut replacements = HashMap::new();
            replacements.insert(
                entity_id.clone(),
                ReplacementModel {
                    id: entity_id.clone(),
                    definition_id: DefinitionId::new("X"),
                    options: OptionMap::new(),
                    style: None,
                    is_inverted: None,
                    upgrade_index: 3,
                },
            );
            h.transport.push_upgrade_script(UpgradeScript::Succeed(replacements));

            advance_and_settle(Duration::from_millis(10)).await;

            assert!(h.controls.replacement_log().calls().is_empty());
            assert!(h
                .events
                .events()
                .iter()
                .any(|e| e.contains("UnknownControl")));
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn replace_entity_reentrantly_tracking_does_not_deadlock() {
    // spec.md §5/§9 "Replacement reentrancy": a correct host's
    // `ControlHandle::replace_entity` synchronously calls back into
    // `Engine::track`. That must not race the borrow the reconciliation
    // pass is still holding on `Inner`.
    tokio::time::pause();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let entity_id = EntityId::new("a");
            let control_id = ControlId::new("c1");
            let definition_id = DefinitionId::new("defA");

            let transport = Rc::new(FakeTransport::new());
            let events = RecordingEventSink::new();
            let reentered = FakeEntity::default();

            // `Engine::new` needs the control store before the engine
            // exists, but the store's reentrant callback needs the engine —
            // break the cycle with a slot the callback reads lazily, filled
            // in immediately after construction, before `start`/`track` ever
            // run (so the callback never observes it empty).
            let engine_slot: Rc<RefCell<Option<Engine>>> = Rc::new(RefCell::new(None));

            let controls = Rc::new(ReentrantControlStore::new(control_id.clone(), {
                let entity_id = entity_id.clone();
                let control_id = control_id.clone();
                let reentered = reentered.clone();
                let engine_slot = engine_slot.clone();
                move |replacement: ReplacementModel| {
                    reentered.set(snapshot(
                        &entity_id,
                        EntityKind::Action,
                        &replacement.definition_id,
                        replacement.options,
                    ));
                    let engine = engine_slot
                        .borrow()
                        .clone()
                        .expect("engine is set before any drain can run");
                    engine.track(entity_id.clone(), control_id.clone(), reentered.handle());
                }
            }));

            let engine = Engine::new(
                small_config(),
                transport.clone(),
                Rc::new(InMemoryDefinitionStore::new()),
                controls,
                Rc::new(EchoVariableParser::new()),
                Rc::new(events.clone()),
            );
            *engine_slot.borrow_mut() = Some(engine.clone());

            engine.start(3);

            let mut snap = snapshot(&entity_id, EntityKind::Action, &definition_id, OptionMap::new());
            snap.upgrade_index = Some(1);
            let entity = FakeEntity::new(snap);
            engine.track(entity_id.clone(), control_id.clone(), entity.handle());

            let mut replacements = HashMap::new();
            replacements.insert(
                entity_id.clone(),
                ReplacementModel {
                    id: entity_id.clone(),
                    definition_id: DefinitionId::new("X"),
                    options: OptionMap::new(),
                    style: None,
                    is_inverted: None,
                    upgrade_index: 3,
                },
            );
            transport.push_upgrade_script(UpgradeScript::Succeed(replacements));

            advance_and_settle(Duration::from_millis(10)).await;
            advance_and_settle(Duration::from_millis(10)).await;

            // The reentrant `track` must have gone through (not panicked on
            // a double mutable borrow) and its fresh record must have been
            // drained into a `Ready` update.
            assert!(engine.is_tracked_for_test(&entity_id));
            assert_eq!(engine.state_for_test(&entity_id), Some(EntityState::Ready));
            assert!(transport.update_batch_count() >= 1);
            assert!(transport.last_update_batch_ids().contains(&entity_id));
        })
        .await;
}
