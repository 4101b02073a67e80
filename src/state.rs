//! The five-state machine every [`crate::record::EntityRecord`] moves
//! through. Transition methods are pure (no I/O, no RPCs) and report
//! whether anything actually changed, which the public API uses to
//! decide whether a poke is warranted.

/// The lifecycle of one tracked entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityState {
    /// Needs a fresh pass: either newly tracked, or invalidated and
    /// waiting to be re-parsed/re-upgraded.
    Unloaded,
    /// An upgrade RPC is in flight for this record.
    Upgrading,
    /// An upgrade RPC is in flight, but the record was invalidated while
    /// it was; the eventual reply must be discarded.
    UpgradingInvalidated,
    /// The module has been told the entity's current options.
    Ready,
    /// `forget` was called; the record is removed on the next drain.
    PendingDelete,
}

/// What a drain should do with a record currently in `Unloaded`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnloadedOutcome {
    /// `upgrade_index` is current (or absent): move straight to `Ready`
    /// and emit an update.
    BecameReady,
    /// `upgrade_index` is stale: move to `Upgrading` and emit an upgrade
    /// request.
    BeganUpgrade,
}

/// What happened to a record whose in-flight upgrade just resolved
/// (reply arrived, or the RPC failed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeResolution {
    /// The record was `Upgrading` and the RPC succeeded: the replacement
    /// (if any) should be applied, and the record moves to `Ready`.
    Apply,
    /// The record was `Upgrading` but the RPC failed: move to `Ready`
    /// anyway ("pretend succeeded") without applying anything — there
    /// is nothing to apply.
    PretendSuccess,
    /// The record was `UpgradingInvalidated`: whatever the RPC outcome,
    /// any replacement is discarded and the record moves to `Unloaded`
    /// for a fresh pass.
    Discard,
    /// The record was in some other state when the resolution arrived
    /// (impossible in principle) — tolerated, no-op.
    Tolerate,
}

impl EntityState {
    /// Drain tick observes an `Unloaded` record with a live weak handle.
    /// Returns `None` if `self` isn't `Unloaded` (caller should not have
    /// called this; defensively a no-op).
    pub fn drain_unloaded(&mut self, upgrade_index_is_stale: bool) -> Option<UnloadedOutcome> {
        if *self != EntityState::Unloaded {
            return None;
        }
        if upgrade_index_is_stale {
            *self = EntityState::Upgrading;
            Some(UnloadedOutcome::BeganUpgrade)
        } else {
            *self = EntityState::Ready;
            Some(UnloadedOutcome::BecameReady)
        }
    }

    /// An upgrade reply arrived, or the upgrade RPC failed. `on_failure`
    /// selects the "pretend success" / "retry from scratch" policy vs.
    /// the success-path apply/discard policy.
    fn resolve_upgrade(&mut self, on_failure: bool) -> UpgradeResolution {
        match *self {
            EntityState::Upgrading => {
                *self = EntityState::Ready;
                if on_failure {
                    UpgradeResolution::PretendSuccess
                } else {
                    UpgradeResolution::Apply
                }
            }
            EntityState::UpgradingInvalidated => {
                *self = EntityState::Unloaded;
                UpgradeResolution::Discard
            }
            _ => UpgradeResolution::Tolerate,
        }
    }

    /// A successful `upgrade_entities` reply was received for this record.
    pub fn upgrade_succeeded(&mut self) -> UpgradeResolution {
        self.resolve_upgrade(false)
    }

    /// The `upgrade_entities` RPC itself failed (transport error).
    pub fn upgrade_failed(&mut self) -> UpgradeResolution {
        self.resolve_upgrade(true)
    }

    /// Definition change or `resend_feedbacks`: unconditional invalidation.
    /// Returns whether the state actually changed.
    pub fn invalidate(&mut self) -> bool {
        match *self {
            EntityState::Upgrading => {
                *self = EntityState::UpgradingInvalidated;
                true
            }
            EntityState::Ready => {
                *self = EntityState::Unloaded;
                true
            }
            EntityState::Unloaded | EntityState::UpgradingInvalidated | EntityState::PendingDelete => {
                false
            }
        }
    }

    /// A variable change invalidation: only `Ready` records react, and
    /// only when the caller has already determined the change intersects
    /// `last_referenced_variables`.
    pub fn invalidate_for_variable_change(&mut self) -> bool {
        if *self == EntityState::Ready {
            *self = EntityState::Unloaded;
            true
        } else {
            false
        }
    }

    /// `forget`: idempotent move to `PendingDelete`.
    pub fn mark_pending_delete(&mut self) -> bool {
        if *self == EntityState::PendingDelete {
            false
        } else {
            *self = EntityState::PendingDelete;
            true
        }
    }
}
