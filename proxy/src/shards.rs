use crate::config::ShardConfig;
use directory::types::{ShardId, ShardSpec};
use std::collections::HashMap;
use url::Url;

#[derive(Clone, Debug, PartialEq)]
pub struct Shard {
    pub id: ShardId,
    pub url: Url,
    pub dedicated: bool,
}

impl From<ShardConfig> for Shard {
    fn from(config: ShardConfig) -> Self {
        Shard {
            id: config.id,
            url: config.url,
            dedicated: config.dedicated,
        }
    }
}

impl Shard {
    /// URL of `path_and_query` on this shard.
    pub fn url_for(&self, path_and_query: &str) -> Url {
        let mut url = self.url.clone();
        if let Some((path, query)) = path_and_query.split_once('?') {
            url.set_path(path);
            url.set_query(Some(query));
        } else {
            url.set_path(path_and_query);
            url.set_query(None);
        }
        url
    }
}

/// Configured backend shards, keyed by id.
#[derive(Debug)]
pub struct Shards {
    map: HashMap<ShardId, Shard>,
}

impl Shards {
    pub fn new(config: Vec<ShardConfig>) -> Self {
        let map = config
            .into_iter()
            .map(|s| (s.id.clone(), Shard::from(s)))
            .collect();
        Shards { map }
    }

    pub fn get(&self, shard: &str) -> Option<&Shard> {
        self.map.get(shard)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.map.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ShardId> {
        self.map.keys()
    }

    /// Membership as the directory sees it.
    pub fn specs(&self) -> Vec<ShardSpec> {
        self.map
            .values()
            .map(|s| ShardSpec {
                id: s.id.clone(),
                dedicated: s.dedicated,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards() {
        let shards = Shards::new(vec![
            ShardConfig {
                id: "shard-a".into(),
                url: Url::parse("http://10.0.0.1:9993").unwrap(),
                dedicated: false,
            },
            ShardConfig {
                id: "shard-vip".into(),
                url: Url::parse("http://10.0.0.2:9993/").unwrap(),
                dedicated: true,
            },
        ]);

        let shard = shards.get("shard-a").expect("configured shard");
        assert_eq!(
            shard.url_for("/json/events?queue_id=abc").as_str(),
            "http://10.0.0.1:9993/json/events?queue_id=abc"
        );
        assert_eq!(
            shard.url_for("/health").as_str(),
            "http://10.0.0.1:9993/health"
        );
        assert!(shards.get("shard-b").is_none());

        let mut specs = shards.specs();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(specs[1].id, "shard-vip");
        assert!(specs[1].dedicated);
    }
}
