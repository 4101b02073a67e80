//! The entity the engine observes but never owns.
//!
//! The control surface is the sole owner of entity instances; the
//! engine only ever sees a snapshot through a [`WeakEntityHandle`]. This
//! mirrors spec'd behavior: the engine must be able to notice that the
//! owning control reclaimed an entity without the engine itself keeping
//! it alive.

use std::collections::HashMap;

use crate::ids::{DefinitionId, EntityId};

/// An action runs a side effect; a feedback reports state back onto a
/// control's visual appearance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Action,
    Feedback,
}

/// A raw option value as stored on the entity, before parsing.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl OptionValue {
    /// The stringified form used as input to variable parsing. Non-string
    /// values are rendered textually so a field can still contain e.g.
    /// `$(internal:foo)` inside a numeric-looking default.
    pub fn as_parse_input(&self) -> String {
        match self {
            OptionValue::String(s) => s.clone(),
            OptionValue::Number(n) => n.to_string(),
            OptionValue::Bool(b) => b.to_string(),
            OptionValue::Null => String::new(),
        }
    }
}

/// Unordered bag of raw or parsed option values, keyed by field id.
pub type OptionMap = HashMap<crate::ids::FieldId, OptionValue>;

/// A read-only snapshot of everything the engine needs to know about an
/// entity at a point in time. Obtained by upgrading a [`WeakEntityHandle`].
#[derive(Clone, Debug)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub kind: EntityKind,
    pub definition_id: DefinitionId,
    pub options: OptionMap,
    pub upgrade_index: Option<u32>,
    pub disabled: bool,
    /// Only meaningful for `EntityKind::Feedback`.
    pub is_inverted: bool,
}

/// A weak, non-owning observer of a live entity.
///
/// Implementations typically wrap `std::rc::Weak`/`std::sync::Weak`. A
/// host environment without a weak-pointer primitive for its entity type
/// can implement this with a registration + epoch scheme instead: keep a
/// generation counter alongside the entity and have the owning control
/// notify the engine (by removing the record via [`crate::Engine::forget`])
/// when the entity is destroyed. Either way, `upgrade` must return `None`
/// once the owning control has dropped the entity, and never keep it
/// alive on the engine's behalf.
pub trait WeakEntityHandle: std::fmt::Debug {
    fn upgrade(&self) -> Option<EntitySnapshot>;
}

/// A boxed, object-safe weak handle, the form the engine stores.
pub type BoxedWeakEntityHandle = Box<dyn WeakEntityHandle>;
