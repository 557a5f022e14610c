//! Consistent hash ring mapping realms onto the shards that accept hash-derived
//! realms. Every shard owns `virtual_nodes` points on the ring so that removing a
//! shard only moves the realms that hashed onto its points.

use crate::types::ShardId;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, ShardId>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        HashRing {
            ring: BTreeMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn with_shards<'a, I>(virtual_nodes: usize, shards: I) -> Self
    where
        I: IntoIterator<Item = &'a ShardId>,
    {
        let mut ring = HashRing::new(virtual_nodes);
        for shard in shards {
            ring.add_shard(shard);
        }
        ring
    }

    /// Returns the shard owning the first ring point at or after the realm's hash.
    pub fn lookup(&self, realm: &str) -> Option<&ShardId> {
        let hash = hash_key(realm.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| shard)
    }

    pub fn add_shard(&mut self, shard: &ShardId) {
        for replica in 0..self.virtual_nodes {
            let hash = hash_key(format!("{shard}#{replica}").as_bytes());
            // On the (astronomically unlikely) collision the lexically smaller id wins,
            // so the ring does not depend on insertion order.
            match self.ring.get(&hash) {
                Some(existing) if existing <= shard => {}
                _ => {
                    self.ring.insert(hash, shard.clone());
                }
            }
        }
    }

    pub fn remove_shard(&mut self, shard: &str) {
        self.ring.retain(|_, s| s != shard);
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn shard_count(&self) -> usize {
        let mut shards: Vec<&ShardId> = self.ring.values().collect();
        shards.sort();
        shards.dedup();
        shards.len()
    }
}

// Stable across processes and releases, unlike `DefaultHasher`, so that a predecessor
// and its successor place realms identically.
fn hash_key(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
