use crate::backup::{BackupStore, Compression, FilesystemBackupStore, NoopBackupStore};
use crate::directory::{Directory, DirectoryOptions};
use crate::store::{AssignmentStore, HttpAssignmentStore, MemoryAssignmentStore, StoreError};
use crate::types::{ShardSpec, StoredAssignment};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum AssignmentStoreConfig {
    Http {
        url: String,
        #[serde(default = "default_store_timeout_secs")]
        timeout_secs: u64,
    },
    /// Assignments listed inline. Useful for single-node setups.
    Memory {
        #[serde(default)]
        assignments: Vec<StoredAssignment>,
    },
}

fn default_store_timeout_secs() -> u64 {
    5
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum BackupConfig {
    Filesystem {
        base_dir: String,
        filename: String,
        #[serde(default)]
        compression: Compression,
    },
    None,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DirectoryConfig {
    pub store: AssignmentStoreConfig,
    #[serde(default = "default_backup")]
    pub backup: BackupConfig,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_cold_miss_timeout_ms")]
    pub cold_miss_timeout_ms: u64,
    #[serde(default = "default_negative_cache_ttl_secs")]
    pub negative_cache_ttl_secs: u64,
}

fn default_backup() -> BackupConfig {
    BackupConfig::None
}

fn default_virtual_nodes() -> usize {
    160
}

fn default_cold_miss_timeout_ms() -> u64 {
    500
}

fn default_negative_cache_ttl_secs() -> u64 {
    5
}

impl DirectoryConfig {
    /// Builds the directory. Assignments are not loaded yet; call `Directory::load`.
    pub fn build(&self, shards: Vec<ShardSpec>) -> Result<Directory, StoreError> {
        let store: Arc<dyn AssignmentStore> = match &self.store {
            AssignmentStoreConfig::Http { url, timeout_secs } => Arc::new(
                HttpAssignmentStore::new(url, Duration::from_secs(*timeout_secs))?,
            ),
            AssignmentStoreConfig::Memory { assignments } => Arc::new(
                MemoryAssignmentStore::with_rows(assignments.iter().cloned()),
            ),
        };

        let backup: Arc<dyn BackupStore> = match &self.backup {
            BackupConfig::Filesystem {
                base_dir,
                filename,
                compression,
            } => Arc::new(FilesystemBackupStore::new(
                base_dir,
                filename,
                *compression,
            )),
            BackupConfig::None => Arc::new(NoopBackupStore),
        };

        Ok(Directory::new(
            shards,
            store,
            backup,
            DirectoryOptions {
                virtual_nodes: self.virtual_nodes,
                cold_miss_timeout: Duration::from_millis(self.cold_miss_timeout_ms),
                negative_cache_ttl: Duration::from_secs(self.negative_cache_ttl_secs),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = r#"
store:
  type: http
  url: http://127.0.0.1:9000/api/0
"#;
        let config: DirectoryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backup, BackupConfig::None);
        assert_eq!(config.virtual_nodes, 160);
        assert_eq!(config.cold_miss_timeout_ms, 500);
        assert_eq!(
            config.store,
            AssignmentStoreConfig::Http {
                url: "http://127.0.0.1:9000/api/0".into(),
                timeout_secs: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_memory_store_config() {
        let yaml = r#"
store:
  type: memory
  assignments:
    - realm: zulip
      shard: shard-b
backup:
  type: filesystem
  base_dir: /tmp
  filename: assignments.bin
  compression: zstd3
"#;
        let config: DirectoryConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.backup,
            BackupConfig::Filesystem {
                compression: Compression::Zstd3,
                ..
            }
        ));

        let directory = config
            .build(vec![ShardSpec::new("shard-a"), ShardSpec::new("shard-b")])
            .unwrap();
        assert_eq!(directory.store().fetch("zulip").await.unwrap().unwrap().shard, "shard-b");
    }
}
