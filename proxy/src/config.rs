use directory::config::{AssignmentStoreConfig, DirectoryConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("No shards configured")]
    NoShards,

    #[error("Every shard is dedicated, hash-derived realms have nowhere to go")]
    NoRingShards,

    #[error("Empty shard id")]
    EmptyShardId,

    #[error("Duplicate shard id: {0}")]
    DuplicateShard(String),

    #[error("Assignment references unknown shard: {0}")]
    UnknownShard(String),

    #[error("unreachable_after ({unreachable}) must be greater than degraded_after ({degraded})")]
    InvalidThresholds { degraded: u32, unreachable: u32 },

    #[error("Buffer drain rate must be greater than 0")]
    InvalidDrainRate,
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Client-facing listener
    #[serde(default = "default_listener")]
    pub listener: Listener,
    /// Admin listener for health probes and operator endpoints
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    /// Path of the local control socket used for restart handoff
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub realm: RealmConfig,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
}

fn default_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 9799,
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 9798,
    }
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/tmp/shardgate/control.sock")
}

impl Config {
    /// Validates the proxy configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.shards.is_empty() {
            return Err(ValidationError::NoShards);
        }

        let mut shard_ids = HashSet::new();
        for shard in &self.shards {
            if shard.id.is_empty() {
                return Err(ValidationError::EmptyShardId);
            }
            if !shard_ids.insert(shard.id.as_str()) {
                return Err(ValidationError::DuplicateShard(shard.id.clone()));
            }
        }

        if self.shards.iter().all(|s| s.dedicated) {
            return Err(ValidationError::NoRingShards);
        }

        if let AssignmentStoreConfig::Memory { assignments } = &self.directory.store {
            for assignment in assignments {
                if !shard_ids.contains(assignment.shard.as_str()) {
                    return Err(ValidationError::UnknownShard(assignment.shard.clone()));
                }
            }
        }

        if self.health.unreachable_after <= self.health.degraded_after {
            return Err(ValidationError::InvalidThresholds {
                degraded: self.health.degraded_after,
                unreachable: self.health.unreachable_after,
            });
        }

        if self.buffer.drain_rate_per_sec == 0 {
            return Err(ValidationError::InvalidDrainRate);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Backend shard configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ShardConfig {
    pub id: String,
    /// Base URL of the shard. Invalid URLs are rejected during deserialization.
    pub url: Url,
    /// Dedicated shards only serve pinned or explicitly assigned realms and are
    /// kept out of the hash ring.
    #[serde(default)]
    pub dedicated: bool,
}

/// How the realm is derived from a request
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RealmConfig {
    /// Header carrying the realm, set by the load balancer in front of us
    #[serde(default = "default_realm_header")]
    pub header: String,
    /// Requests for `<realm>.<root_domain>` belong to `<realm>`. The bare root
    /// domain is the default realm.
    pub root_domain: Option<String>,
}

fn default_realm_header() -> String {
    "x-shardgate-realm".into()
}

impl Default for RealmConfig {
    fn default() -> Self {
        RealmConfig {
            header: default_realm_header(),
            root_domain: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Connect timeout for proxied requests and total timeout for health checks
    pub liveness_timeout_ms: u64,
    pub check_interval_ms: u64,
    pub check_path: String,
    /// Consecutive failures before a shard is considered degraded
    pub degraded_after: u32,
    /// Consecutive failures before a shard is considered unreachable
    pub unreachable_after: u32,
    /// Failures further apart than this do not count as consecutive
    pub failure_window_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            liveness_timeout_ms: 1000,
            check_interval_ms: 1000,
            check_path: "/health".into(),
            degraded_after: 3,
            unreachable_after: 6,
            failure_window_ms: 10_000,
        }
    }
}

impl HealthConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// How long a held request may wait for its shard, counted from arrival
    pub deadline_secs: u64,
    /// Held requests released per second per shard once it recovers
    pub drain_rate_per_sec: u32,
}

impl BufferConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            deadline_secs: 50,
            drain_rate_per_sec: 100,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    /// Time allowed for a shard to produce response headers
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 64,
            request_timeout_secs: 90,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Maximum time a request is held while its realm is paused
    pub pause_timeout_ms: u64,
    /// How long a page-reload move keeps invalidating old queues before the realm
    /// is considered stable on its new shard
    pub invalidation_window_secs: u64,
    /// Timeout for calls to the shards' migration endpoints
    pub operation_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            pause_timeout_ms: 2000,
            invalidation_window_secs: 600,
            operation_timeout_secs: 30,
        }
    }
}

impl MigrationConfig {
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn invalidation_window(&self) -> Duration {
        Duration::from_secs(self.invalidation_window_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandoffConfig {
    /// How long the predecessor waits for the successor's ready signal
    pub ready_timeout_secs: u64,
    /// How long the predecessor waits for the snapshot to be acknowledged
    pub snapshot_timeout_secs: u64,
    /// Upper bound on draining in-flight connections before exit
    pub drain_deadline_secs: u64,
}

impl HandoffConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        HandoffConfig {
            ready_timeout_secs: 30,
            snapshot_timeout_secs: 10,
            drain_deadline_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory::types::StoredAssignment;

    const VALID: &str = r#"
listener:
    host: "0.0.0.0"
    port: 9799
shards:
    - id: shard-a
      url: "http://10.0.0.1:9993"
    - id: shard-b
      url: "http://10.0.0.2:9993"
    - id: shard-vip
      url: "http://10.0.0.3:9993"
      dedicated: true
realm:
    root_domain: zulipchat.com
directory:
    store:
        type: http
        url: "http://127.0.0.1:9000/api/0"
health:
    degraded_after: 2
    unreachable_after: 4
"#;

    #[test]
    fn test_parse_valid_config() {
        let config: Config = serde_yaml::from_str(VALID).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 9799);
        assert_eq!(config.admin_listener.addr(), "127.0.0.1:9798");
        assert_eq!(config.shards.len(), 3);
        assert!(config.shards[2].dedicated);
        assert_eq!(config.realm.header, "x-shardgate-realm");
        assert_eq!(config.realm.root_domain.as_deref(), Some("zulipchat.com"));
        assert_eq!(config.health.degraded_after, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.health.check_path, "/health");
        assert_eq!(config.buffer.deadline_secs, 50);
        assert_eq!(config.handoff.drain_deadline_secs, 60);
    }

    #[test]
    fn test_validation_errors() {
        let base_config: Config = serde_yaml::from_str(VALID).unwrap();

        let mut config = base_config.clone();
        config.listener.port = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidPort
        ));

        let mut config = base_config.clone();
        config.shards.push(config.shards[0].clone());
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::DuplicateShard(_)
        ));

        let mut config = base_config.clone();
        for shard in &mut config.shards {
            shard.dedicated = true;
        }
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::NoRingShards
        ));

        let mut config = base_config.clone();
        config.health.unreachable_after = config.health.degraded_after;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidThresholds { .. }
        ));

        let mut config = base_config.clone();
        config.directory.store = AssignmentStoreConfig::Memory {
            assignments: vec![StoredAssignment::new("zulip", "shard-z")],
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::UnknownShard(_)
        ));

        let mut config = base_config;
        config.shards.clear();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::NoShards
        ));
    }

    #[test]
    fn test_deserialization_errors() {
        // Invalid shard URL
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
shards: [{id: shard-a, url: "not-a-url"}]
directory: {store: {type: memory}}
"#
            )
            .is_err()
        );

        // Missing directory section
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
shards: [{id: shard-a, url: "http://10.0.0.1:9993"}]
"#
            )
            .is_err()
        );
    }
}
