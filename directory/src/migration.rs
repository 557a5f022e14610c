//! Per-realm migration state and its transition rules.
//!
//! Both strategies share one skeleton:
//!
//! ```text
//! page reload:  Preparing -> DbCommitted -> Invalidating -> Stable(new)
//! transparent:  Preparing -> CreatingOnNew -> DbCommitted -> DrainingOld -> Paused
//!               -> Serializing -> MergingOnNew -> Resumed -> Stable(new)
//! ```
//!
//! A transparent move that fails after the database commit falls back to
//! `Invalidating`. A move that fails before the commit is aborted and the realm
//! stays on its old shard. `Stable` is not a phase: a realm is stable exactly when
//! it has no migration entry.

use crate::types::{RealmId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    PageReload,
    Transparent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preparing,
    CreatingOnNew,
    DbCommitted,
    DrainingOld,
    Paused,
    Serializing,
    MergingOnNew,
    Resumed,
    Invalidating,
}

impl MigrationPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Preparing => "preparing",
            MigrationPhase::CreatingOnNew => "creating_on_new",
            MigrationPhase::DbCommitted => "db_committed",
            MigrationPhase::DrainingOld => "draining_old",
            MigrationPhase::Paused => "paused",
            MigrationPhase::Serializing => "serializing",
            MigrationPhase::MergingOnNew => "merging_on_new",
            MigrationPhase::Resumed => "resumed",
            MigrationPhase::Invalidating => "invalidating",
        }
    }

    /// Phases in which the database still points at the old shard. A failure here
    /// aborts the move instead of invalidating clients.
    pub const fn is_pre_commit(&self) -> bool {
        matches!(self, MigrationPhase::Preparing | MigrationPhase::CreatingOnNew)
    }

    pub fn can_transition_to(&self, next: MigrationPhase, strategy: Strategy) -> bool {
        use MigrationPhase::*;

        match strategy {
            Strategy::PageReload => matches!(
                (self, next),
                (Preparing, DbCommitted) | (DbCommitted, Invalidating)
            ),
            Strategy::Transparent => matches!(
                (self, next),
                (Preparing, CreatingOnNew)
                    | (CreatingOnNew, DbCommitted)
                    | (DbCommitted, DrainingOld)
                    | (DrainingOld, Paused)
                    | (Paused, Serializing)
                    | (Serializing, MergingOnNew)
                    | (MergingOnNew, Resumed)
                    | (DbCommitted, Invalidating)
                    | (DrainingOld, Invalidating)
                    | (Paused, Invalidating)
                    | (Serializing, Invalidating)
                    | (MergingOnNew, Invalidating)
            ),
        }
    }

    /// Phases from which the migration may finish with the realm on its new shard.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Resumed | MigrationPhase::Invalidating)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    pub realm: RealmId,
    pub old: ShardId,
    pub old_epoch: u64,
    pub new: ShardId,
    /// Epoch the realm's assignment carries once committed to `new`.
    pub epoch: u64,
    pub strategy: Strategy,
    pub phase: MigrationPhase,
    /// Users whose queues have been merged onto `new`. The store cannot address
    /// individual queues, so progress is tracked per user and a resumed migration
    /// skips users already present here.
    pub completed_users: BTreeSet<String>,
    /// Every phase this migration has entered, in order.
    pub history: Vec<MigrationPhase>,
    pub started_at_ms: u64,
}

impl MigrationState {
    pub fn new(
        realm: RealmId,
        old: ShardId,
        old_epoch: u64,
        new: ShardId,
        epoch: u64,
        strategy: Strategy,
        started_at_ms: u64,
    ) -> Self {
        MigrationState {
            realm,
            old,
            old_epoch,
            new,
            epoch,
            strategy,
            phase: MigrationPhase::Preparing,
            completed_users: BTreeSet::new(),
            history: vec![MigrationPhase::Preparing],
            started_at_ms,
        }
    }

    pub fn has_visited(&self, phase: MigrationPhase) -> bool {
        self.history.contains(&phase)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MigrationStateError {
    #[error("realm {realm} is already migrating ({phase})")]
    Conflict { realm: RealmId, phase: MigrationPhase },

    #[error("realm {0} has no migration in progress")]
    NotMigrating(RealmId),

    #[error("realm {realm} is in {actual}, expected {expected}")]
    OutOfOrder {
        realm: RealmId,
        expected: MigrationPhase,
        actual: MigrationPhase,
    },

    #[error("transition {from} -> {to} is not allowed for a {strategy:?} move")]
    InvalidTransition {
        from: MigrationPhase,
        to: MigrationPhase,
        strategy: Strategy,
    },

    #[error("realm {realm} cannot be aborted after the database commit ({phase})")]
    AlreadyCommitted { realm: RealmId, phase: MigrationPhase },
}
