use crate::backup::{BackupError, BackupStore};
use crate::metrics_defs::{
    COLD_MISS, MIGRATION_TRANSITIONS, STORE_LOAD_DURATION, STORE_LOAD_ROWS,
};
use crate::migration::{MigrationPhase, MigrationState, MigrationStateError};
use crate::negative_cache::{LookupFailure, NegativeCache};
use crate::ring::HashRing;
use crate::store::{AssignmentStore, StoreError};
use crate::types::{
    Assignment, RealmId, RouteSource, RouteTarget, ShardId, ShardSpec, StoredAssignment,
    unix_millis,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::{counter, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("no shard is available for hash-derived realms")]
    NoShards,

    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),

    #[error("realm {0} is pinned")]
    Pinned(RealmId),

    #[error(transparent)]
    Migration(#[from] MigrationStateError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),
}

/// Result of resolving a realm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Shard(RouteTarget),
    /// The realm has an active migration; the router applies the phase policy.
    Migrating(MigrationState),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum CachedRoute {
    Explicit(Assignment),
    /// The store has no row for the realm, it follows the ring.
    Hashed,
}

#[derive(Default)]
struct DirectoryState {
    routes: HashMap<RealmId, CachedRoute>,
    pins: HashMap<RealmId, ShardId>,
    // Realms whose pin is being written to the store.
    pinning: HashSet<RealmId>,
    migrations: HashMap<RealmId, MigrationState>,
    draining: HashSet<ShardId>,
}

/// Point-in-time copy of the directory, carried across a restart handoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub assignments: Vec<(RealmId, Assignment)>,
    pub hashed: Vec<RealmId>,
    pub pins: Vec<(RealmId, ShardId)>,
    pub migrations: Vec<MigrationState>,
    pub draining: Vec<ShardId>,
}

pub struct DirectoryOptions {
    pub virtual_nodes: usize,
    pub cold_miss_timeout: Duration,
    pub negative_cache_ttl: Duration,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryOptions {
            virtual_nodes: 160,
            cold_miss_timeout: Duration::from_millis(500),
            negative_cache_ttl: Duration::from_secs(5),
        }
    }
}

struct DirectoryInner {
    shards: HashMap<ShardId, ShardSpec>,
    state: RwLock<DirectoryState>,
    ring: RwLock<HashRing>,
    store: Arc<dyn AssignmentStore>,
    backup: Arc<dyn BackupStore>,
    negative_cache: NegativeCache,
    options: DirectoryOptions,
    // Used by the readiness probe. Initially false and set to true once the initial
    // load has been attempted.
    ready: AtomicBool,
    // Bumped on every migration transition so held requests can re-resolve.
    changes: watch::Sender<u64>,
}

/// Cache of realm to shard assignments backed by the assignment store.
///
/// The directory is the only owner of the in-memory mapping. Reads take a shared
/// lock; writes (commits, pins, migration transitions) take the exclusive lock
/// briefly and never across an await point.
#[derive(Clone)]
pub struct Directory {
    inner: Arc<DirectoryInner>,
}

impl Directory {
    pub fn new(
        shards: Vec<ShardSpec>,
        store: Arc<dyn AssignmentStore>,
        backup: Arc<dyn BackupStore>,
        options: DirectoryOptions,
    ) -> Self {
        let shards: HashMap<ShardId, ShardSpec> =
            shards.into_iter().map(|s| (s.id.clone(), s)).collect();
        let (changes, _) = watch::channel(0);

        let directory = Directory {
            inner: Arc::new(DirectoryInner {
                shards,
                state: RwLock::new(DirectoryState::default()),
                ring: RwLock::new(HashRing::new(options.virtual_nodes)),
                store,
                backup,
                negative_cache: NegativeCache::new(options.negative_cache_ttl),
                options,
                ready: AtomicBool::new(false),
                changes,
            }),
        };
        directory.rebuild_ring(&directory.inner.state.read().draining);
        directory
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> Arc<dyn AssignmentStore> {
        self.inner.store.clone()
    }

    pub fn has_shard(&self, shard: &str) -> bool {
        self.inner.shards.contains_key(shard)
    }

    /// Loads every assignment from the store, falling back to the backup copy when
    /// the store is unreachable. A successful store load refreshes the backup.
    pub async fn load(&self) -> Result<usize, LoadError> {
        let start = Instant::now();
        let rows = match self.inner.store.load_all().await {
            Ok(rows) => {
                histogram!(STORE_LOAD_DURATION).record(start.elapsed().as_secs_f64());
                histogram!(STORE_LOAD_ROWS).record(rows.len() as f64);
                if let Err(err) = self.inner.backup.store(&rows) {
                    tracing::warn!(error = %err, "Failed to refresh backup assignments");
                }
                rows
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "Error loading from store, falling back to backup assignments"
                );
                self.inner.backup.load()?
            }
        };

        let count = rows.len();
        self.apply_rows(rows);
        self.inner.ready.store(true, Ordering::Relaxed);
        Ok(count)
    }

    /// Marks the directory ready without data, leaving every realm to cold misses.
    pub fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::Relaxed);
    }

    fn apply_rows(&self, rows: Vec<StoredAssignment>) {
        let now = unix_millis();
        let mut state = self.inner.state.write();
        for row in rows {
            if row.pinned {
                state.pins.insert(row.realm.clone(), row.shard.clone());
            }
            state.routes.insert(
                row.realm,
                CachedRoute::Explicit(Assignment {
                    shard: row.shard,
                    epoch: row.epoch,
                    since_ms: now,
                }),
            );
        }
    }

    /// Resolves a realm to a shard, or to its active migration.
    ///
    /// Order: pin, active migration, cached assignment, store lookup on a cold miss,
    /// consistent hash. A failing store degrades to the hash ring and is never
    /// waited on longer than the cold-miss timeout.
    pub async fn resolve(&self, realm: &str) -> Result<Resolution, DirectoryError> {
        if let Some(resolution) = self.resolve_cached(realm)? {
            return Ok(resolution);
        }

        if let Some(failure) = self.inner.negative_cache.recent_failure(realm) {
            tracing::debug!(realm, failure = failure.as_str(), "Store lookup failed recently");
            return self.hashed(realm).map(Resolution::Shard);
        }

        let lookup =
            tokio::time::timeout(self.inner.options.cold_miss_timeout, self.inner.store.fetch(realm))
                .await;

        match lookup {
            Ok(Ok(Some(row))) => {
                counter!(COLD_MISS, "outcome" => "assigned").increment(1);
                let mut state = self.inner.state.write();
                if row.pinned {
                    state
                        .pins
                        .entry(row.realm.clone())
                        .or_insert_with(|| row.shard.clone());
                }
                // A commit may have landed while the lookup was in flight; it wins.
                state
                    .routes
                    .entry(row.realm.clone())
                    .or_insert_with(|| {
                        CachedRoute::Explicit(Assignment {
                            shard: row.shard.clone(),
                            epoch: row.epoch,
                            since_ms: unix_millis(),
                        })
                    });
            }
            Ok(Ok(None)) => {
                counter!(COLD_MISS, "outcome" => "hashed").increment(1);
                self.inner
                    .state
                    .write()
                    .routes
                    .entry(realm.to_string())
                    .or_insert(CachedRoute::Hashed);
            }
            Ok(Err(err)) => {
                counter!(COLD_MISS, "outcome" => "degraded").increment(1);
                tracing::warn!(realm, error = %err, "Store lookup failed, using hash default");
                self.inner.negative_cache.record(realm, LookupFailure::Error);
                return self.hashed(realm).map(Resolution::Shard);
            }
            Err(_) => {
                counter!(COLD_MISS, "outcome" => "degraded").increment(1);
                tracing::warn!(realm, "Store lookup timed out, using hash default");
                self.inner.negative_cache.record(realm, LookupFailure::Timeout);
                return self.hashed(realm).map(Resolution::Shard);
            }
        }

        match self.resolve_cached(realm)? {
            Some(resolution) => Ok(resolution),
            None => self.hashed(realm).map(Resolution::Shard),
        }
    }

    /// Resolution without touching the store. `None` means a cold miss.
    pub fn resolve_cached(&self, realm: &str) -> Result<Option<Resolution>, DirectoryError> {
        let state = self.inner.state.read();

        if let Some(shard) = state.pins.get(realm) {
            // An assignment's epoch only fences the shard it was issued for.
            let epoch = match state.routes.get(realm) {
                Some(CachedRoute::Explicit(a)) if &a.shard == shard => a.epoch,
                _ => 0,
            };
            return Ok(Some(Resolution::Shard(RouteTarget {
                shard: shard.clone(),
                epoch,
                source: RouteSource::Pinned,
            })));
        }

        if let Some(migration) = state.migrations.get(realm) {
            return Ok(Some(Resolution::Migrating(migration.clone())));
        }

        match state.routes.get(realm) {
            Some(CachedRoute::Explicit(assignment)) => Ok(Some(Resolution::Shard(RouteTarget {
                shard: assignment.shard.clone(),
                epoch: assignment.epoch,
                source: RouteSource::Assigned,
            }))),
            Some(CachedRoute::Hashed) => {
                drop(state);
                self.hashed(realm).map(|t| Some(Resolution::Shard(t)))
            }
            None => Ok(None),
        }
    }

    fn hashed(&self, realm: &str) -> Result<RouteTarget, DirectoryError> {
        let ring = self.inner.ring.read();
        let shard = ring.lookup(realm).ok_or(DirectoryError::NoShards)?;
        Ok(RouteTarget {
            shard: shard.clone(),
            epoch: 0,
            source: RouteSource::Hashed,
        })
    }

    /// Ring members: configured shards that are neither dedicated nor draining.
    fn rebuild_ring(&self, draining: &HashSet<ShardId>) {
        let members: Vec<&ShardId> = self
            .inner
            .shards
            .values()
            .filter(|s| !s.dedicated && !draining.contains(&s.id))
            .map(|s| &s.id)
            .collect();
        *self.inner.ring.write() = HashRing::with_shards(self.inner.options.virtual_nodes, members);
    }

    /// Takes a shard out of (or back into) the hash ring. Explicit assignments to it
    /// keep resolving; only hash-derived realms move.
    pub fn set_draining(&self, shard: &str, draining: bool) -> Result<(), DirectoryError> {
        if !self.has_shard(shard) {
            return Err(DirectoryError::UnknownShard(shard.to_string()));
        }
        let mut state = self.inner.state.write();
        let changed = if draining {
            state.draining.insert(shard.to_string())
        } else {
            state.draining.remove(shard)
        };
        if changed {
            tracing::info!(shard, draining, "Shard ring membership changed");
            self.rebuild_ring(&state.draining);
        }
        Ok(())
    }

    pub fn is_draining(&self, shard: &str) -> bool {
        self.inner.state.read().draining.contains(shard)
    }

    pub async fn set_pin(&self, realm: &str, shard: Option<&str>) -> Result<(), DirectoryError> {
        if let Some(shard) = shard
            && !self.has_shard(shard)
        {
            return Err(DirectoryError::UnknownShard(shard.to_string()));
        }
        {
            let mut state = self.inner.state.write();
            if let Some(migration) = state.migrations.get(realm) {
                return Err(MigrationStateError::Conflict {
                    realm: realm.to_string(),
                    phase: migration.phase,
                }
                .into());
            }
            // Keeps migrations from starting while the store write is in flight.
            state.pinning.insert(realm.to_string());
        }
        let written = self.inner.store.set_pin(realm, shard).await;

        let mut state = self.inner.state.write();
        state.pinning.remove(realm);
        written?;
        match shard {
            Some(shard) => {
                tracing::info!(realm, shard, "Realm pinned");
                state.pins.insert(realm.to_string(), shard.to_string());
            }
            None => {
                tracing::info!(realm, "Realm unpinned");
                state.pins.remove(realm);
            }
        }
        Ok(())
    }

    /// Epoch to use for the next assignment of this realm.
    pub fn next_epoch(&self, realm: &str) -> u64 {
        match self.inner.state.read().routes.get(realm) {
            Some(CachedRoute::Explicit(a)) => a.epoch + 1,
            _ => 1,
        }
    }

    /// Swaps the cached mapping to `shard` and clears the realm's migration entry.
    /// Called once the database write has succeeded.
    pub fn commit_assignment(&self, realm: &str, shard: &str, epoch: u64) {
        let mut state = self.inner.state.write();
        let keep_newer = matches!(
            state.routes.get(realm),
            Some(CachedRoute::Explicit(a)) if a.epoch > epoch
        );
        if !keep_newer {
            state.routes.insert(
                realm.to_string(),
                CachedRoute::Explicit(Assignment {
                    shard: shard.to_string(),
                    epoch,
                    since_ms: unix_millis(),
                }),
            );
        }
        state.migrations.remove(realm);
        drop(state);

        self.inner.negative_cache.forget(realm);
        tracing::info!(realm, shard, epoch, "Assignment committed");
        self.notify_changed();
    }

    pub fn begin_migration(&self, migration: MigrationState) -> Result<(), DirectoryError> {
        let mut state = self.inner.state.write();
        if state.pins.contains_key(&migration.realm) || state.pinning.contains(&migration.realm) {
            return Err(DirectoryError::Pinned(migration.realm));
        }
        if let Some(existing) = state.migrations.get(&migration.realm) {
            return Err(MigrationStateError::Conflict {
                realm: migration.realm,
                phase: existing.phase,
            }
            .into());
        }
        tracing::info!(
            realm = %migration.realm,
            old = %migration.old,
            new = %migration.new,
            strategy = ?migration.strategy,
            "Migration started"
        );
        counter!(MIGRATION_TRANSITIONS, "phase" => migration.phase.as_str()).increment(1);
        state.migrations.insert(migration.realm.clone(), migration);
        drop(state);
        self.notify_changed();
        Ok(())
    }

    /// Compare-and-set transition: applies `from -> to` only when the realm is
    /// currently in `from` and the transition is allowed for its strategy.
    pub fn advance_migration(
        &self,
        realm: &str,
        from: MigrationPhase,
        to: MigrationPhase,
    ) -> Result<MigrationState, DirectoryError> {
        let mut state = self.inner.state.write();
        let migration = state
            .migrations
            .get_mut(realm)
            .ok_or_else(|| MigrationStateError::NotMigrating(realm.to_string()))?;

        if migration.phase != from {
            return Err(MigrationStateError::OutOfOrder {
                realm: realm.to_string(),
                expected: from,
                actual: migration.phase,
            }
            .into());
        }
        if !from.can_transition_to(to, migration.strategy) {
            return Err(MigrationStateError::InvalidTransition {
                from,
                to,
                strategy: migration.strategy,
            }
            .into());
        }

        migration.phase = to;
        migration.history.push(to);
        let updated = migration.clone();
        drop(state);

        tracing::info!(realm, from = %from, to = %to, "Migration phase changed");
        counter!(MIGRATION_TRANSITIONS, "phase" => to.as_str()).increment(1);
        self.notify_changed();
        Ok(updated)
    }

    /// Drops a migration that has not reached the database commit. The realm stays
    /// on its old shard.
    pub fn abort_migration(&self, realm: &str) -> Result<MigrationState, DirectoryError> {
        let mut state = self.inner.state.write();
        let phase = state
            .migrations
            .get(realm)
            .map(|m| m.phase)
            .ok_or_else(|| MigrationStateError::NotMigrating(realm.to_string()))?;
        if !phase.is_pre_commit() {
            return Err(MigrationStateError::AlreadyCommitted {
                realm: realm.to_string(),
                phase,
            }
            .into());
        }
        let removed = state
            .migrations
            .remove(realm)
            .ok_or_else(|| MigrationStateError::NotMigrating(realm.to_string()))?;
        drop(state);

        tracing::warn!(realm, phase = %phase, "Migration aborted, realm stays on its old shard");
        self.notify_changed();
        Ok(removed)
    }

    pub fn record_user_migrated(&self, realm: &str, user: &str) -> Result<(), DirectoryError> {
        let mut state = self.inner.state.write();
        let migration = state
            .migrations
            .get_mut(realm)
            .ok_or_else(|| MigrationStateError::NotMigrating(realm.to_string()))?;
        migration.completed_users.insert(user.to_string());
        Ok(())
    }

    pub fn migration(&self, realm: &str) -> Option<MigrationState> {
        self.inner.state.read().migrations.get(realm).cloned()
    }

    pub fn migrations(&self) -> Vec<MigrationState> {
        self.inner.state.read().migrations.values().cloned().collect()
    }

    /// Receiver notified on every migration change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    fn notify_changed(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }

    /// Consistent point-in-time copy, taken under the shared lock.
    pub fn snapshot(&self) -> DirectorySnapshot {
        let state = self.inner.state.read();
        let mut assignments = Vec::new();
        let mut hashed = Vec::new();
        for (realm, route) in &state.routes {
            match route {
                CachedRoute::Explicit(a) => assignments.push((realm.clone(), a.clone())),
                CachedRoute::Hashed => hashed.push(realm.clone()),
            }
        }
        DirectorySnapshot {
            assignments,
            hashed,
            pins: state
                .pins
                .iter()
                .map(|(r, s)| (r.clone(), s.clone()))
                .collect(),
            migrations: state.migrations.values().cloned().collect(),
            draining: state.draining.iter().cloned().collect(),
        }
    }

    /// Merges a predecessor's snapshot over our own state. The snapshot is newer than
    /// anything loaded from the store during startup, so its entries win.
    pub fn merge_snapshot(&self, snapshot: DirectorySnapshot) {
        let mut state = self.inner.state.write();
        for (realm, assignment) in snapshot.assignments {
            state.routes.insert(realm, CachedRoute::Explicit(assignment));
        }
        for realm in snapshot.hashed {
            state.routes.entry(realm).or_insert(CachedRoute::Hashed);
        }
        for (realm, shard) in snapshot.pins {
            state.pins.insert(realm, shard);
        }
        for migration in snapshot.migrations {
            state.migrations.insert(migration.realm.clone(), migration);
        }
        let mut ring_changed = false;
        for shard in snapshot.draining {
            if self.inner.shards.contains_key(&shard) {
                ring_changed |= state.draining.insert(shard);
            }
        }
        if ring_changed {
            self.rebuild_ring(&state.draining);
        }
        drop(state);

        self.inner.ready.store(true, Ordering::Relaxed);
        self.notify_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{Compression, FilesystemBackupStore, NoopBackupStore};
    use crate::migration::Strategy;
    use crate::store::MemoryAssignmentStore;

    fn shards() -> Vec<ShardSpec> {
        vec![
            ShardSpec::new("shard-a"),
            ShardSpec::new("shard-b"),
            ShardSpec::new("shard-c"),
            ShardSpec {
                id: "shard-vip".into(),
                dedicated: true,
            },
        ]
    }

    fn directory_with(store: Arc<MemoryAssignmentStore>) -> Directory {
        Directory::new(
            shards(),
            store,
            Arc::new(NoopBackupStore),
            DirectoryOptions::default(),
        )
    }

    fn shard_of(resolution: Resolution) -> RouteTarget {
        match resolution {
            Resolution::Shard(target) => target,
            Resolution::Migrating(m) => panic!("unexpected migration {m:?}"),
        }
    }

    #[tokio::test]
    async fn test_hash_resolution_is_stable() {
        let directory = directory_with(Arc::new(MemoryAssignmentStore::new()));
        for i in 0..50 {
            let realm = format!("realm-{i}");
            let first = shard_of(directory.resolve(&realm).await.unwrap());
            assert_eq!(first.source, RouteSource::Hashed);
            assert_ne!(first.shard, "shard-vip");
            for _ in 0..3 {
                assert_eq!(shard_of(directory.resolve(&realm).await.unwrap()), first);
            }
        }
    }

    #[tokio::test]
    async fn test_cold_miss_is_cached() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
            "zulip", "shard-vip",
        )]));
        let directory = directory_with(store.clone());

        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-vip");
        assert_eq!(target.source, RouteSource::Assigned);

        // The default path no longer needs the store.
        store.set_unavailable(true);
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-vip");
    }

    #[tokio::test]
    async fn test_store_down_degrades_to_hash() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
            "zulip", "shard-vip",
        )]));
        store.set_unavailable(true);
        let directory = directory_with(store.clone());

        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.source, RouteSource::Hashed);

        // The negative cache keeps answering from the ring until it expires.
        store.set_unavailable(false);
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.source, RouteSource::Hashed);
    }

    #[tokio::test]
    async fn test_pin_overrides_everything() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
            "zulip", "shard-a",
        )]));
        let directory = directory_with(store.clone());
        directory.load().await.unwrap();

        directory.set_pin("zulip", Some("shard-vip")).await.unwrap();
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-vip");
        assert_eq!(target.source, RouteSource::Pinned);
        assert!(store.get("zulip").unwrap().pinned);

        directory.set_pin("zulip", None).await.unwrap();
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-a");

        assert!(matches!(
            directory.set_pin("zulip", Some("nope")).await,
            Err(DirectoryError::UnknownShard(_))
        ));
    }

    #[tokio::test]
    async fn test_pin_carries_epoch_of_its_own_shard_only() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment {
            epoch: 4,
            ..StoredAssignment::new("zulip", "shard-a")
        }]));
        let directory = directory_with(store);
        directory.load().await.unwrap();

        directory.set_pin("zulip", Some("shard-b")).await.unwrap();
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-b");
        assert_eq!(target.epoch, 0);

        directory.set_pin("zulip", Some("shard-a")).await.unwrap();
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.epoch, 4);
    }

    #[tokio::test]
    async fn test_pin_rejected_while_migrating() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
            "zulip", "shard-a",
        )]));
        let directory = directory_with(store.clone());
        directory.load().await.unwrap();
        directory
            .begin_migration(MigrationState::new(
                "zulip".into(),
                "shard-a".into(),
                0,
                "shard-b".into(),
                1,
                Strategy::Transparent,
                unix_millis(),
            ))
            .unwrap();
        directory
            .advance_migration("zulip", MigrationPhase::Preparing, MigrationPhase::CreatingOnNew)
            .unwrap();

        assert!(matches!(
            directory.set_pin("zulip", Some("shard-a")).await,
            Err(DirectoryError::Migration(MigrationStateError::Conflict {
                phase: MigrationPhase::CreatingOnNew,
                ..
            }))
        ));
        assert!(!store.get("zulip").unwrap().pinned);
        assert!(matches!(
            directory.resolve("zulip").await.unwrap(),
            Resolution::Migrating(_)
        ));
    }

    #[tokio::test]
    async fn test_draining_only_moves_hashed_realms() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
            "zulip", "shard-a",
        )]));
        let directory = directory_with(store);
        directory.load().await.unwrap();

        directory.set_draining("shard-a", true).unwrap();
        assert_eq!(shard_of(directory.resolve("zulip").await.unwrap()).shard, "shard-a");
        for i in 0..100 {
            let target = shard_of(directory.resolve(&format!("realm-{i}")).await.unwrap());
            assert_ne!(target.shard, "shard-a");
        }
    }

    #[tokio::test]
    async fn test_migration_conflict_and_ordering() {
        let directory = directory_with(Arc::new(MemoryAssignmentStore::new()));
        let migration = MigrationState::new(
            "zulip".into(),
            "shard-a".into(),
            0,
            "shard-b".into(),
            1,
            Strategy::Transparent,
            unix_millis(),
        );
        directory.begin_migration(migration.clone()).unwrap();
        assert!(matches!(
            directory.begin_migration(migration),
            Err(DirectoryError::Migration(MigrationStateError::Conflict { .. }))
        ));

        assert!(matches!(
            directory.resolve("zulip").await.unwrap(),
            Resolution::Migrating(_)
        ));

        // Out of order transitions are rejected.
        assert!(matches!(
            directory.advance_migration(
                "zulip",
                MigrationPhase::DbCommitted,
                MigrationPhase::DrainingOld
            ),
            Err(DirectoryError::Migration(MigrationStateError::OutOfOrder { .. }))
        ));
        directory
            .advance_migration("zulip", MigrationPhase::Preparing, MigrationPhase::CreatingOnNew)
            .unwrap();

        let mut changes = directory.subscribe();
        directory.commit_assignment("zulip", "shard-b", 1);
        assert!(changes.has_changed().unwrap());
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-b");
        assert_eq!(target.epoch, 1);
        assert_eq!(directory.next_epoch("zulip"), 2);
    }

    #[tokio::test]
    async fn test_abort_only_before_commit() {
        let directory = directory_with(Arc::new(MemoryAssignmentStore::new()));
        let migration = MigrationState::new(
            "zulip".into(),
            "shard-a".into(),
            0,
            "shard-b".into(),
            1,
            Strategy::PageReload,
            unix_millis(),
        );
        directory.begin_migration(migration).unwrap();
        directory
            .advance_migration("zulip", MigrationPhase::Preparing, MigrationPhase::DbCommitted)
            .unwrap();
        assert!(directory.abort_migration("zulip").is_err());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = Arc::new(MemoryAssignmentStore::with_rows([
            StoredAssignment::new("zulip", "shard-a"),
            StoredAssignment {
                realm: "lear".into(),
                shard: "shard-vip".into(),
                pinned: true,
                epoch: 3,
            },
        ]));
        let old = directory_with(store);
        old.load().await.unwrap();
        old.resolve("hashed-realm").await.unwrap();
        old.set_draining("shard-c", true).unwrap();
        old.begin_migration(MigrationState::new(
            "migrating".into(),
            "shard-a".into(),
            0,
            "shard-b".into(),
            1,
            Strategy::Transparent,
            unix_millis(),
        ))
        .unwrap();

        let snapshot = old.snapshot();

        let new = directory_with(Arc::new(MemoryAssignmentStore::new()));
        assert!(!new.is_ready());
        new.merge_snapshot(snapshot.clone());
        assert!(new.is_ready());

        for realm in ["zulip", "lear", "hashed-realm", "migrating", "unseen"] {
            assert_eq!(
                old.resolve_cached(realm).unwrap(),
                new.resolve_cached(realm).unwrap(),
                "{realm} differs after handoff"
            );
        }
        assert!(new.is_draining("shard-c"));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(FilesystemBackupStore::new(
            dir.path().to_str().unwrap(),
            "backup.bin",
            Compression::Zstd1,
        ));
        backup
            .store(&[StoredAssignment::new("zulip", "shard-c")])
            .unwrap();

        let store = Arc::new(MemoryAssignmentStore::new());
        store.set_unavailable(true);
        let directory = Directory::new(shards(), store, backup, DirectoryOptions::default());

        assert_eq!(directory.load().await.unwrap(), 1);
        assert!(directory.is_ready());
        let target = shard_of(directory.resolve("zulip").await.unwrap());
        assert_eq!(target.shard, "shard-c");
    }
}
