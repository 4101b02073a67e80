//! The control object store: owns entity instances. Read-only from the
//! engine's perspective except for handing an upgrade replacement back
//! via [`ControlHandle::replace_entity`] (spec.md §5, §6).

use crate::error::EngineError;
use crate::ids::ControlId;
use crate::transport::ReplacementModel;

/// Per-control rendering hint consulted for feedback updates (spec.md
/// §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapSize {
    pub width: u32,
    pub height: u32,
}

/// A live control, as seen by the engine at the moment it needs one.
pub trait ControlHandle {
    fn supports_entities(&self) -> bool;

    /// Hands an upgrade's replacement model to the control. The control
    /// is expected to persist the new model and re-`track` the resulting
    /// entity, generating a fresh record (spec.md §4.4, §5) — that
    /// re-`track` is specified to be reentrancy-safe with respect to the
    /// engine.
    fn replace_entity(&self, replacement: ReplacementModel) -> Result<(), EngineError>;
}

/// Looks controls up by id. Never owned by the engine.
pub trait ControlStore {
    fn get_control(&self, control_id: &ControlId) -> Option<Box<dyn ControlHandle>>;

    /// The bitmap size a feedback on this control should render into,
    /// if the control has one.
    fn bitmap_size(&self, control_id: &ControlId) -> Option<BitmapSize>;
}
