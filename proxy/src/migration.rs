//! Drives realm moves between shards.
//!
//! Each migrating realm has one driver task. The driver reads the realm's current
//! phase from the directory, performs that phase's work against the shards, and
//! advances the phase with a compare-and-set. Because the phase lives in the
//! directory, a driver can stop at any phase boundary and a new one (in this
//! process after a failed handoff, or in the successor) picks up where it left off.

use crate::metrics_defs::MIGRATIONS;
use crate::shard_ops::{ShardOperations, ShardOpsError};
use directory::migration::{MigrationPhase, MigrationState, MigrationStateError, Strategy};
use directory::store::StoreError;
use directory::types::{RealmId, RouteSource, ShardId, unix_millis};
use directory::{Directory, DirectoryError, Resolution};
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("realm {0} is already migrating")]
    Conflict(RealmId),
    #[error("realm {0} is pinned")]
    Pinned(RealmId),
    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),
    #[error("realm {realm} is already on {shard}")]
    AlreadyOnShard { realm: RealmId, shard: ShardId },
    #[error("migrations are frozen for a restart")]
    Frozen,
    #[error("shard operation failed: {0}")]
    ShardOps(#[from] ShardOpsError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(DirectoryError),
}

impl From<DirectoryError> for MigrationError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Migration(MigrationStateError::Conflict { realm, .. }) => {
                MigrationError::Conflict(realm)
            }
            DirectoryError::Pinned(realm) => MigrationError::Pinned(realm),
            DirectoryError::UnknownShard(shard) => MigrationError::UnknownShard(shard),
            other => MigrationError::Directory(other),
        }
    }
}

enum Step {
    Continue,
    Done,
    Frozen,
}

struct Inner {
    directory: Directory,
    ops: Arc<dyn ShardOperations>,
    invalidation_window: Duration,
    frozen: watch::Sender<bool>,
    drivers: Mutex<HashMap<RealmId, JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct MigrationCoordinator {
    inner: Arc<Inner>,
}

impl MigrationCoordinator {
    pub fn new(
        directory: Directory,
        ops: Arc<dyn ShardOperations>,
        invalidation_window: Duration,
    ) -> Self {
        let (frozen, _) = watch::channel(false);
        MigrationCoordinator {
            inner: Arc::new(Inner {
                directory,
                ops,
                invalidation_window,
                frozen,
                drivers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts moving `realm` to `target`. At most one move per realm runs at a
    /// time; a second attempt fails with `Conflict` and leaves the first alone.
    pub async fn start(
        &self,
        realm: &str,
        target: &str,
        strategy: Strategy,
    ) -> Result<MigrationState, MigrationError> {
        if *self.inner.frozen.borrow() {
            return Err(MigrationError::Frozen);
        }
        let directory = &self.inner.directory;
        if !directory.has_shard(target) {
            return Err(MigrationError::UnknownShard(target.to_string()));
        }

        let current = match directory.resolve(realm).await? {
            Resolution::Migrating(_) => return Err(MigrationError::Conflict(realm.to_string())),
            Resolution::Shard(target) if target.source == RouteSource::Pinned => {
                return Err(MigrationError::Pinned(realm.to_string()));
            }
            Resolution::Shard(target) => target,
        };
        if current.shard == target {
            return Err(MigrationError::AlreadyOnShard {
                realm: realm.to_string(),
                shard: current.shard,
            });
        }

        let state = MigrationState::new(
            realm.to_string(),
            current.shard,
            current.epoch,
            target.to_string(),
            directory.next_epoch(realm),
            strategy,
            unix_millis(),
        );
        directory.begin_migration(state.clone())?;
        self.spawn_driver(realm);
        Ok(state)
    }

    fn spawn_driver(&self, realm: &str) {
        let mut drivers = self.inner.drivers.lock();
        if drivers.get(realm).is_some_and(|driver| !driver.is_finished()) {
            return;
        }
        let coordinator = self.clone();
        let owned = realm.to_string();
        drivers.insert(
            realm.to_string(),
            tokio::spawn(async move { coordinator.drive(owned).await }),
        );
    }

    /// Stops every driver at its next phase boundary. Drivers still busy after
    /// `deadline` are aborted; their phase is re-run when driving resumes.
    pub async fn freeze(&self, deadline: Duration) {
        self.inner.frozen.send_replace(true);
        let drivers: Vec<(RealmId, JoinHandle<()>)> = self.inner.drivers.lock().drain().collect();

        for (realm, mut driver) in drivers {
            if tokio::time::timeout(deadline, &mut driver).await.is_err() {
                tracing::warn!(realm = %realm, "Migration driver did not stop in time, aborting it");
                driver.abort();
            }
        }
        tracing::info!("Migrations frozen");
    }

    /// Undoes `freeze` after a failed handoff.
    pub fn thaw(&self) {
        self.inner.frozen.send_replace(false);
        tracing::info!("Migrations thawed");
        self.resume_all();
    }

    /// Starts a driver for every migration in the directory that lacks one, such
    /// as the ones received in a handoff snapshot.
    pub fn resume_all(&self) {
        for migration in self.inner.directory.migrations() {
            tracing::info!(
                realm = %migration.realm,
                phase = %migration.phase,
                "Resuming migration"
            );
            self.spawn_driver(&migration.realm);
        }
    }

    async fn drive(self, realm: RealmId) {
        let mut frozen = self.inner.frozen.subscribe();
        // Exported queue state, kept between Serializing and MergingOnNew.
        let mut exports: HashMap<String, Vec<u8>> = HashMap::new();

        loop {
            if *frozen.borrow_and_update() {
                tracing::info!(realm = %realm, "Migration driver stopped for handoff");
                return;
            }
            let Some(state) = self.inner.directory.migration(&realm) else {
                return;
            };

            let step = match self.step(&state, &mut exports, &mut frozen).await {
                Ok(step) => step,
                Err(err) => self.fail(&state, err),
            };
            match step {
                Step::Continue => {}
                Step::Done | Step::Frozen => return,
            }
        }
    }

    async fn step(
        &self,
        state: &MigrationState,
        exports: &mut HashMap<String, Vec<u8>>,
        frozen: &mut watch::Receiver<bool>,
    ) -> Result<Step, MigrationError> {
        use MigrationPhase::*;

        let directory = &self.inner.directory;
        let ops = &self.inner.ops;
        let realm = state.realm.as_str();

        match (state.strategy, state.phase) {
            (Strategy::PageReload, Preparing) => {
                self.commit_to_store(state).await?;
                directory.advance_migration(realm, Preparing, DbCommitted)?;
            }
            (Strategy::PageReload, DbCommitted) => {
                directory.advance_migration(realm, DbCommitted, Invalidating)?;
            }
            (Strategy::Transparent, Preparing) => {
                let users = ops.list_users(&state.old, realm).await?;
                ops.provision(&state.new, realm, &users).await?;
                directory.advance_migration(realm, Preparing, CreatingOnNew)?;
            }
            (Strategy::Transparent, CreatingOnNew) => {
                self.commit_to_store(state).await?;
                directory.advance_migration(realm, CreatingOnNew, DbCommitted)?;
            }
            (Strategy::Transparent, DbCommitted) => {
                directory.advance_migration(realm, DbCommitted, DrainingOld)?;
            }
            (Strategy::Transparent, DrainingOld) => {
                ops.drain(&state.old, realm).await?;
                directory.advance_migration(realm, DrainingOld, Paused)?;
            }
            (Strategy::Transparent, Paused) => {
                directory.advance_migration(realm, Paused, Serializing)?;
            }
            (Strategy::Transparent, Serializing) => {
                for user in ops.list_users(&state.old, realm).await? {
                    if state.completed_users.contains(&user) || exports.contains_key(&user) {
                        continue;
                    }
                    let exported = ops.export(&state.old, realm, &user).await?;
                    exports.insert(user, exported);
                }
                directory.advance_migration(realm, Serializing, MergingOnNew)?;
            }
            (Strategy::Transparent, MergingOnNew) => {
                for user in ops.list_users(&state.old, realm).await? {
                    if state.completed_users.contains(&user) {
                        continue;
                    }
                    let exported = match exports.remove(&user) {
                        Some(exported) => exported,
                        None => ops.export(&state.old, realm, &user).await?,
                    };
                    ops.merge(&state.new, realm, &user, exported).await?;
                    directory.record_user_migrated(realm, &user)?;
                }
                directory.advance_migration(realm, MergingOnNew, Resumed)?;
            }
            (_, phase) if phase.is_terminal() => {
                // Old queues keep being refused by the new shard for the window.
                if phase == Invalidating {
                    tokio::select! {
                        _ = tokio::time::sleep(self.inner.invalidation_window) => {}
                        _ = until_frozen(frozen) => return Ok(Step::Frozen),
                    }
                }
                directory.commit_assignment(realm, &state.new, state.epoch);
                let outcome = match (state.strategy, phase) {
                    (Strategy::Transparent, Invalidating) => "invalidated",
                    _ => "completed",
                };
                self.finished(state, outcome);
                return Ok(Step::Done);
            }
            (strategy, phase) => {
                tracing::error!(realm, phase = %phase, ?strategy, "Migration in a phase its strategy never enters");
                directory.advance_migration(realm, phase, Invalidating)?;
            }
        }
        Ok(Step::Continue)
    }

    async fn commit_to_store(&self, state: &MigrationState) -> Result<(), MigrationError> {
        self.inner
            .directory
            .store()
            .commit(&state.realm, &state.new, state.epoch)
            .await?;
        tracing::info!(
            realm = %state.realm,
            shard = %state.new,
            epoch = state.epoch,
            "Assignment written to store"
        );
        Ok(())
    }

    /// Before the store commit a failed move is abandoned; after it, clients are
    /// invalidated instead of being served possibly inconsistent queues.
    fn fail(&self, state: &MigrationState, err: MigrationError) -> Step {
        let realm = state.realm.as_str();
        if state.phase.is_pre_commit() {
            tracing::warn!(realm, phase = %state.phase, error = %err, "Migration failed, aborting");
            if let Err(err) = self.inner.directory.abort_migration(realm) {
                tracing::error!(realm, error = %err, "Could not abort migration");
            }
            counter!(MIGRATIONS, "strategy" => strategy_name(state.strategy), "outcome" => "aborted")
                .increment(1);
            return Step::Done;
        }

        tracing::warn!(
            realm,
            phase = %state.phase,
            error = %err,
            "Migration failed after commit, falling back to invalidation"
        );
        match self
            .inner
            .directory
            .advance_migration(realm, state.phase, MigrationPhase::Invalidating)
        {
            Ok(_) => Step::Continue,
            Err(err) => {
                tracing::error!(realm, error = %err, "Could not fall back to invalidation");
                Step::Done
            }
        }
    }

    fn finished(&self, state: &MigrationState, outcome: &'static str) {
        tracing::info!(
            realm = %state.realm,
            shard = %state.new,
            outcome,
            users = state.completed_users.len(),
            "Migration finished"
        );
        counter!(MIGRATIONS, "strategy" => strategy_name(state.strategy), "outcome" => outcome)
            .increment(1);
    }
}

async fn until_frozen(frozen: &mut watch::Receiver<bool>) {
    while !*frozen.borrow_and_update() {
        if frozen.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::PageReload => "page_reload",
        Strategy::Transparent => "transparent",
    }
}
