//! Realms whose store lookup recently failed. While a realm is listed here it is
//! routed by hash without asking the store again, which keeps a struggling
//! database from being hit on every request.
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

const MAX_REALMS: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupFailure {
    Error,
    Timeout,
}

impl LookupFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupFailure::Error => "error",
            LookupFailure::Timeout => "timeout",
        }
    }
}

pub struct NegativeCache {
    failures: Cache<String, LookupFailure>,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        NegativeCache {
            failures: Cache::builder()
                .max_capacity(MAX_REALMS)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn record(&self, realm: &str, failure: LookupFailure) {
        self.failures.insert(realm.to_string(), failure);
    }

    /// Called once the realm has an authoritative assignment again.
    pub fn forget(&self, realm: &str) {
        self.failures.invalidate(realm);
    }

    pub fn recent_failure(&self, realm: &str) -> Option<LookupFailure> {
        let failure = self.failures.get(realm);
        match failure {
            Some(failure) => {
                counter!(NEGATIVE_CACHE_HIT, "failure" => failure.as_str()).increment(1)
            }
            None => counter!(NEGATIVE_CACHE_MISS).increment(1),
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let cache = NegativeCache::new(Duration::from_millis(50));
        cache.record("zulip", LookupFailure::Timeout);
        assert_eq!(cache.recent_failure("zulip"), Some(LookupFailure::Timeout));
        assert_eq!(cache.recent_failure("lear"), None);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.recent_failure("zulip"), None);
    }

    #[test]
    fn test_forget() {
        let cache = NegativeCache::new(Duration::from_secs(5));
        cache.record("zulip", LookupFailure::Error);
        cache.forget("zulip");
        assert_eq!(cache.recent_failure("zulip"), None);
    }
}
