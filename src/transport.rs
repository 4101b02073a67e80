//! Maps the engine's abstract "update entities" / "upgrade entities"
//! calls onto the external RPC. The wire format and the actual RPC
//! client are named collaborators, out of this crate's scope —
//! [`ModuleRpc`] is the seam a host implements.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::control::{BitmapSize, ControlStore};
use crate::entity::{EntityKind, OptionMap};
use crate::error::{EngineError, EngineErrorKind};
use crate::ids::{ControlId, DefinitionId, EntityId};

/// One entity's parsed state, ready to hand to the module, or a
/// tombstone for an entity the module should forget.
pub enum UpdateItem {
    Upsert(EntityUpdate),
    Delete { id: EntityId, kind: EntityKind },
}

/// The parsed, module-facing view of a `Ready` entity.
pub struct EntityUpdate {
    pub id: EntityId,
    pub kind: EntityKind,
    pub control_id: ControlId,
    pub definition_id: DefinitionId,
    pub options: OptionMap,
    pub upgrade_index: Option<u32>,
    pub disabled: bool,
    /// Only meaningful for `EntityKind::Feedback`.
    pub is_inverted: bool,
}

/// A raw, unparsed entity queued for the module's migration pipeline.
pub struct UpgradeItem {
    pub id: EntityId,
    pub kind: EntityKind,
    pub control_id: ControlId,
    pub definition_id: DefinitionId,
    pub options: OptionMap,
    pub disabled: bool,
    pub is_inverted: bool,
}

/// What the module's migration pipeline handed back for one entity.
/// Entries absent from the reply mean "unchanged" and are not produced
/// here at all — callers only see ids actually present in the reply.
pub struct ReplacementModel {
    pub id: EntityId,
    pub definition_id: DefinitionId,
    pub options: OptionMap,
    /// Only present for `EntityKind::Feedback`.
    pub style: Option<OptionMap>,
    pub is_inverted: Option<bool>,
    pub upgrade_index: u32,
}

/// The engine's abstract view of the module connection. Implemented by
/// [`TransportAdapter`] on top of a concrete [`ModuleRpc`].
#[async_trait(?Send)]
pub trait Transport {
    /// Fire-and-forget: the return value exists only so the caller can
    /// log failure, never to drive further engine state.
    async fn update_entities(&self, items: Vec<UpdateItem>) -> Result<(), EngineError>;

    async fn upgrade_entities(
        &self,
        items: Vec<UpgradeItem>,
        current_upgrade_index: u32,
    ) -> Result<HashMap<EntityId, ReplacementModel>, EngineError>;
}

/// The actual RPC surface to the module process. Entirely out of this
/// crate's scope — a host wires this up to its real transport
/// (WebSocket, IPC, whatever it uses).
#[async_trait(?Send)]
pub trait ModuleRpc {
    async fn update_actions(
        &self,
        actions: HashMap<EntityId, Option<EntityUpdate>>,
    ) -> Result<(), EngineError>;

    async fn update_feedbacks(
        &self,
        feedbacks: HashMap<EntityId, Option<(EntityUpdate, Option<BitmapSize>)>>,
    ) -> Result<(), EngineError>;

    async fn upgrade_actions_and_feedbacks(
        &self,
        actions: Vec<UpgradeItem>,
        feedbacks: Vec<UpgradeItem>,
        default_upgrade_index: u32,
    ) -> Result<HashMap<EntityId, ReplacementModel>, EngineError>;
}

/// Splits batches by entity kind, resolves per-control bitmap hints for
/// feedback updates (caching them for the duration of one batch so
/// multiple feedbacks on the same control only look the control up
/// once), and forwards to a [`ModuleRpc`].
pub struct TransportAdapter<R, C> {
    rpc: R,
    controls: C,
}

impl<R, C> TransportAdapter<R, C>
where
    R: ModuleRpc,
    C: ControlStore,
{
    pub fn new(rpc: R, controls: C) -> Self {
        Self { rpc, controls }
    }

    fn bitmap_size_cached(&self, cache: &mut HashMap<ControlId, Option<BitmapSize>>, control_id: &ControlId) -> Option<BitmapSize> {
        *cache
            .entry(control_id.clone())
            .or_insert_with(|| self.controls.bitmap_size(control_id))
    }
}

#[async_trait(?Send)]
impl<R, C> Transport for TransportAdapter<R, C>
where
    R: ModuleRpc,
    C: ControlStore,
{
    async fn update_entities(&self, items: Vec<UpdateItem>) -> Result<(), EngineError> {
        let mut actions: HashMap<EntityId, Option<EntityUpdate>> = HashMap::new();
        let mut feedbacks: HashMap<EntityId, Option<(EntityUpdate, Option<BitmapSize>)>> = HashMap::new();
        let mut bitmap_cache: HashMap<ControlId, Option<BitmapSize>> = HashMap::new();

        for item in items {
            match item {
                UpdateItem::Upsert(update) if update.kind == EntityKind::Action => {
                    actions.insert(update.id.clone(), Some(update));
                }
                UpdateItem::Upsert(update) => {
                    let bitmap = self.bitmap_size_cached(&mut bitmap_cache, &update.control_id);
                    feedbacks.insert(update.id.clone(), Some((update, bitmap)));
                }
                UpdateItem::Delete { id, kind } if kind == EntityKind::Action => {
                    actions.insert(id, None);
                }
                UpdateItem::Delete { id, .. } => {
                    feedbacks.insert(id, None);
                }
            }
        }

        if !actions.is_empty() {
            self.rpc.update_actions(actions).await?;
        }
        if !feedbacks.is_empty() {
            self.rpc.update_feedbacks(feedbacks).await?;
        }
        Ok(())
    }

    async fn upgrade_entities(
        &self,
        items: Vec<UpgradeItem>,
        current_upgrade_index: u32,
    ) -> Result<HashMap<EntityId, ReplacementModel>, EngineError> {
        let (actions, feedbacks): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| item.kind == EntityKind::Action);

        self.rpc
            .upgrade_actions_and_feedbacks(actions, feedbacks, current_upgrade_index)
            .await
    }
}

pub(crate) fn transport_error(detail: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorKind::Transport {
        detail: detail.into(),
    })
}
