use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type RealmId = String;
pub type ShardId = String;

/// Where a route came from. Only `Assigned` and `Pinned` routes are backed by a
/// row in the assignment store; `Hashed` routes are derived from the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSource {
    Pinned,
    Assigned,
    Hashed,
}

impl RouteSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteSource::Pinned => "pinned",
            RouteSource::Assigned => "assigned",
            RouteSource::Hashed => "hashed",
        }
    }
}

/// A fully resolved destination for one realm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    pub shard: ShardId,
    /// Fencing token of the assignment. Zero for hash-derived routes.
    pub epoch: u64,
    pub source: RouteSource,
}

/// An explicit realm to shard assignment, as cached from the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub shard: ShardId,
    pub epoch: u64,
    /// Unix milliseconds at which the assignment took effect.
    pub since_ms: u64,
}

/// One row of the assignment store: realm id to shard id plus the pin flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAssignment {
    pub realm: RealmId,
    pub shard: ShardId,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub epoch: u64,
}

impl StoredAssignment {
    pub fn new<R, S>(realm: R, shard: S) -> Self
    where
        R: Into<RealmId>,
        S: Into<ShardId>,
    {
        StoredAssignment {
            realm: realm.into(),
            shard: shard.into(),
            pinned: false,
            epoch: 0,
        }
    }
}

/// Shard membership as seen by the directory. Health is tracked elsewhere; the
/// directory only needs to know which shards may own hash-derived realms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSpec {
    pub id: ShardId,
    /// Dedicated shards only serve pinned or explicitly assigned realms.
    pub dedicated: bool,
}

impl ShardSpec {
    pub fn new<I: Into<ShardId>>(id: I) -> Self {
        ShardSpec {
            id: id.into(),
            dedicated: false,
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
