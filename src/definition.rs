//! Entity definitions: the module-side schema an entity's raw options
//! are validated and parsed against.

use rustc_hash::FxHashSet;

use crate::ids::{DefinitionId, FieldId};

/// One declared option field of an [`EntityDefinition`].
#[derive(Clone, Debug)]
pub struct FieldDefinition {
    pub id: FieldId,
    /// Whether this field is a textual input with variable substitution
    /// enabled. Non-textual fields (checkboxes, dropdowns, numbers without
    /// variable support) are copied through unparsed.
    pub use_variables: bool,
}

/// Describes the options a given entity type accepts, and whether the
/// module needs to hear about entities of this type at all.
#[derive(Clone, Debug)]
pub struct EntityDefinition {
    pub id: DefinitionId,
    pub fields: Vec<FieldDefinition>,
    /// Fields whose variable references must not be added to the
    /// returned variable set — touching them must not trigger a re-parse
    /// when the variable changes later.
    pub ignored_for_subscribe: FxHashSet<FieldId>,
    /// If false, the module has no lifecycle functions for this entity
    /// type and does not need to be told about instances of it at all.
    pub has_lifecycle_functions: bool,
}

impl EntityDefinition {
    pub fn field(&self, id: &FieldId) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| &f.id == id)
    }
}

/// Looks up entity definitions by id. Read-only from the engine's
/// perspective.
pub trait DefinitionStore {
    fn get_entity_definition(&self, id: &DefinitionId) -> Option<EntityDefinition>;
}
