//! The per-entity tracking cell.

use rustc_hash::FxHashSet;

use crate::entity::BoxedWeakEntityHandle;
use crate::ids::{ControlId, VariableId, WrapperId};
use crate::state::EntityState;

/// Everything the engine keeps about one tracked entity.
///
/// Invariants: the owning map is keyed uniquely by entity id; `track`
/// always replaces the whole record (fresh `wrapper_id`, state reset to
/// `Unloaded`); `last_referenced_variables` is only meaningful while
/// `state == Ready`, stale-but-safe otherwise.
#[derive(Debug)]
pub struct EntityRecord {
    pub wrapper_id: WrapperId,
    pub weak_handle: BoxedWeakEntityHandle,
    pub control_id: ControlId,
    pub state: EntityState,
    pub last_referenced_variables: FxHashSet<VariableId>,
}

impl EntityRecord {
    pub fn new(wrapper_id: WrapperId, weak_handle: BoxedWeakEntityHandle, control_id: ControlId) -> Self {
        Self {
            wrapper_id,
            weak_handle,
            control_id,
            state: EntityState::Unloaded,
            last_referenced_variables: FxHashSet::default(),
        }
    }
}
