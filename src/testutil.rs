//! In-memory collaborator fakes, shared by the crate's own tests and by
//! any downstream integration test (`#[cfg(feature = "testutil")]`).
//! Mirrors the pack's standard practice of testing a reconciler against
//! in-memory stand-ins for its external dependencies rather than mocking
//! each call individually.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;

use crate::control::{BitmapSize, ControlHandle, ControlStore};
use crate::definition::{DefinitionStore, EntityDefinition};
use crate::entity::{EntityKind, EntitySnapshot, OptionMap, WeakEntityHandle};
use crate::error::EngineError;
use crate::event::{Event, EventKind, EventSink};
use crate::ids::{ControlId, DefinitionId, EntityId};
use crate::parser::{ParsedText, VariableParser};
use crate::transport::{ReplacementModel, Transport, UpdateItem, UpgradeItem};

/// A cell the test holds onto to mutate or kill an entity whose
/// [`FakeWeakHandle`] was handed to the engine.
#[derive(Clone, Default)]
pub struct FakeEntity(Rc<RefCell<Option<EntitySnapshot>>>);

impl FakeEntity {
    pub fn new(snapshot: EntitySnapshot) -> Self {
        Self(Rc::new(RefCell::new(Some(snapshot))))
    }

    pub fn handle(&self) -> Box<dyn WeakEntityHandle> {
        Box::new(FakeWeakHandle(self.0.clone()))
    }

    /// Simulates the owning control dropping this entity.
    pub fn kill(&self) {
        *self.0.borrow_mut() = None;
    }

    pub fn set(&self, snapshot: EntitySnapshot) {
        *self.0.borrow_mut() = Some(snapshot);
    }

    pub fn is_alive(&self) -> bool {
        self.0.borrow().is_some()
    }
}

#[derive(Debug)]
struct FakeWeakHandle(Rc<RefCell<Option<EntitySnapshot>>>);

impl WeakEntityHandle for FakeWeakHandle {
    fn upgrade(&self) -> Option<EntitySnapshot> {
        self.0.borrow().clone()
    }
}

/// A fixed table of definitions, set up once per test.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: HashMap<DefinitionId, EntityDefinition>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: EntityDefinition) -> Self {
        self.definitions.insert(definition.id.clone(), definition);
        self
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn get_entity_definition(&self, id: &DefinitionId) -> Option<EntityDefinition> {
        self.definitions.get(id).cloned()
    }
}

/// Every call to [`ControlHandle::replace_entity`] observed through this
/// store, in order.
#[derive(Clone, Default)]
pub struct ReplacementLog(Rc<RefCell<Vec<ReplacementModel>>>);

impl ReplacementLog {
    pub fn calls(&self) -> Vec<EntityId> {
        self.0.borrow().iter().map(|r| r.id.clone()).collect()
    }

    pub fn take(&self) -> Vec<ReplacementModel> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

struct FakeControlHandle {
    log: ReplacementLog,
}

impl ControlHandle for FakeControlHandle {
    fn supports_entities(&self) -> bool {
        true
    }

    fn replace_entity(&self, replacement: ReplacementModel) -> Result<(), EngineError> {
        self.log.0.borrow_mut().push(replacement);
        Ok(())
    }
}

/// A [`ControlStore`] with a single control whose `replace_entity` calls
/// back into a closure instead of just logging — used to exercise the
/// reentrant `track`-from-`replace_entity` path spec.md §5/§9 document
/// ("Replacement reentrancy"): a correct host synchronously re-`track`s
/// the replacement's resulting entity from inside `replace_entity`.
pub struct ReentrantControlStore<F> {
    control_id: ControlId,
    on_replace: Rc<F>,
}

impl<F> ReentrantControlStore<F>
where
    F: Fn(ReplacementModel),
{
    pub fn new(control_id: ControlId, on_replace: F) -> Self {
        Self {
            control_id,
            on_replace: Rc::new(on_replace),
        }
    }
}

struct ReentrantControlHandle<F> {
    on_replace: Rc<F>,
}

impl<F> ControlHandle for ReentrantControlHandle<F>
where
    F: Fn(ReplacementModel),
{
    fn supports_entities(&self) -> bool {
        true
    }

    fn replace_entity(&self, replacement: ReplacementModel) -> Result<(), EngineError> {
        (self.on_replace)(replacement);
        Ok(())
    }
}

impl<F> ControlStore for ReentrantControlStore<F>
where
    F: Fn(ReplacementModel) + 'static,
{
    fn get_control(&self, control_id: &ControlId) -> Option<Box<dyn ControlHandle>> {
        if *control_id == self.control_id {
            Some(Box::new(ReentrantControlHandle {
                on_replace: self.on_replace.clone(),
            }))
        } else {
            None
        }
    }

    fn bitmap_size(&self, _control_id: &ControlId) -> Option<BitmapSize> {
        None
    }
}

/// An in-memory control store. Every registered control accepts
/// replacements and records them to a shared [`ReplacementLog`].
#[derive(Default)]
pub struct InMemoryControlStore {
    controls: HashMap<ControlId, Option<BitmapSize>>,
    log: ReplacementLog,
}

impl InMemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control(mut self, control_id: ControlId, bitmap_size: Option<BitmapSize>) -> Self {
        self.controls.insert(control_id, bitmap_size);
        self
    }

    pub fn replacement_log(&self) -> ReplacementLog {
        self.log.clone()
    }
}

impl ControlStore for InMemoryControlStore {
    fn get_control(&self, control_id: &ControlId) -> Option<Box<dyn ControlHandle>> {
        self.controls.get(control_id).map(|_| {
            Box::new(FakeControlHandle {
                log: self.log.clone(),
            }) as Box<dyn ControlHandle>
        })
    }

    fn bitmap_size(&self, control_id: &ControlId) -> Option<BitmapSize> {
        self.controls.get(control_id).copied().flatten()
    }
}

/// Treats every `$(name)` token as a reference to variable `name`,
/// substituting in its placeholder value (or leaving the token in place
/// if the variable is unknown to the test).
#[derive(Default)]
pub struct EchoVariableParser {
    values: HashMap<String, String>,
}

impl EchoVariableParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl VariableParser for EchoVariableParser {
    fn parse_variables(&self, text: &str) -> ParsedText {
        let mut variable_ids = rustc_hash::FxHashSet::default();
        let mut out = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find(')').unwrap_or(after.len());
            let name = &after[..end];
            variable_ids.insert(crate::ids::VariableId::new(name));
            out.push_str(self.values.get(name).map(String::as_str).unwrap_or(""));
            rest = after.get(end..).unwrap_or("");
            rest = rest.strip_prefix(')').unwrap_or(rest);
        }
        out.push_str(rest);
        ParsedText {
            text: out,
            variable_ids,
        }
    }
}

/// Script describing how the fake transport should answer the next
/// `upgrade_entities` call.
pub enum UpgradeScript {
    Succeed(HashMap<EntityId, ReplacementModel>),
    Fail,
}

/// Records every batch it is asked to dispatch and answers
/// `upgrade_entities` from a pre-loaded queue of [`UpgradeScript`]s (FIFO;
/// `Succeed(empty)` once the queue runs dry).
#[derive(Default)]
pub struct FakeTransport {
    update_batches: RefCell<Vec<Vec<UpdateItem>>>,
    upgrade_batches: RefCell<Vec<Vec<UpgradeItem>>>,
    upgrade_scripts: RefCell<std::collections::VecDeque<UpgradeScript>>,
    reply_gate: RefCell<Option<Rc<tokio::sync::Notify>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_upgrade_script(&self, script: UpgradeScript) {
        self.upgrade_scripts.borrow_mut().push_back(script);
    }

    /// The next `upgrade_entities` call waits on `notify` after recording
    /// its batch and before popping a reply script off the queue — lets a
    /// test land a call between dispatch and reply.
    pub fn arm_reply_gate(&self, notify: Rc<tokio::sync::Notify>) {
        *self.reply_gate.borrow_mut() = Some(notify);
    }

    pub fn update_batch_count(&self) -> usize {
        self.update_batches.borrow().len()
    }

    pub fn last_update_batch_ids(&self) -> Vec<EntityId> {
        self.update_batches
            .borrow()
            .last()
            .map(|batch| {
                batch
                    .iter()
                    .map(|item| match item {
                        UpdateItem::Upsert(u) => u.id.clone(),
                        UpdateItem::Delete { id, .. } => id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn upgrade_batch_count(&self) -> usize {
        self.upgrade_batches.borrow().len()
    }
}

#[async_trait(?Send)]
impl Transport for FakeTransport {
    async fn update_entities(&self, items: Vec<UpdateItem>) -> Result<(), EngineError> {
        self.update_batches.borrow_mut().push(items);
        Ok(())
    }

    async fn upgrade_entities(
        &self,
        items: Vec<UpgradeItem>,
        _current_upgrade_index: u32,
    ) -> Result<HashMap<EntityId, ReplacementModel>, EngineError> {
        self.upgrade_batches.borrow_mut().push(items);

        let gate = self.reply_gate.borrow_mut().take();
        if let Some(notify) = gate {
            notify.notified().await;
        }

        match self.upgrade_scripts.borrow_mut().pop_front() {
            Some(UpgradeScript::Succeed(replacements)) => Ok(replacements),
            Some(UpgradeScript::Fail) => Err(crate::transport::transport_error("scripted failure")),
            None => Ok(HashMap::new()),
        }
    }
}

/// An [`EventSink`] that records every event instead of logging it, so
/// tests can assert on the sequence of notable things that happened.
#[derive(Clone, Default)]
pub struct RecordingEventSink(Rc<RefCell<Vec<EventKind>>>);

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.0.borrow().iter().map(|kind| format!("{kind:?}")).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn on_event(&self, event: Event) {
        self.0.borrow_mut().push(event.kind);
    }
}

/// A minimal helper for constructing test snapshots without naming every
/// field at every call site.
pub fn snapshot(
    id: &EntityId,
    kind: EntityKind,
    definition_id: &DefinitionId,
    options: OptionMap,
) -> EntitySnapshot {
    EntitySnapshot {
        id: id.clone(),
        kind,
        definition_id: definition_id.clone(),
        options,
        upgrade_index: None,
        disabled: false,
        is_inverted: false,
    }
}
