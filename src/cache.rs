//! Boundary to the persistent flag cache.
//!
//! The cache is an external collaborator: this crate only defines the capability it consumes.
//! Eviction (oldest `last_updated` first, bounded by [`CacheConfig::max_cached_identities`]) is
//! the implementation's job.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::feature_flag::{FeatureFlag, FlagKey, Timestamp};

/// Default bound on the number of identities a cache implementation retains.
pub const DEFAULT_MAX_CACHED_IDENTITIES: usize = 5;

/// One identity's cached flag snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFlags {
    /// The flag set as of `last_updated`.
    pub flags: HashMap<FlagKey, FeatureFlag>,
    /// When this snapshot was stored; implementations evict oldest-first.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: Timestamp,
}

/// Persistent storage for per-identity flag snapshots.
pub trait FlagCache: Send + Sync {
    /// The snapshot last stored for `identity_key`, if any.
    fn get(&self, identity_key: &str) -> Option<CachedFlags>;

    /// Store `flags` as the snapshot for `identity_key`, replacing any previous one.
    fn put(&self, identity_key: &str, flags: CachedFlags);
}

/// Configuration handed to cache implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of identities to retain before evicting the stalest.
    pub max_cached_identities: usize,
}

impl CacheConfig {
    /// Create a configuration with the default identity bound.
    pub fn new() -> CacheConfig {
        CacheConfig {
            max_cached_identities: DEFAULT_MAX_CACHED_IDENTITIES,
        }
    }

    /// Override the identity bound.
    pub fn with_max_cached_identities(mut self, max_cached_identities: usize) -> CacheConfig {
        self.max_cached_identities = max_cached_identities;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::{CacheConfig, CachedFlags, FlagCache};

    struct InMemoryCache {
        snapshots: Mutex<HashMap<String, CachedFlags>>,
    }

    impl FlagCache for InMemoryCache {
        fn get(&self, identity_key: &str) -> Option<CachedFlags> {
            self.snapshots.lock().unwrap().get(identity_key).cloned()
        }

        fn put(&self, identity_key: &str, flags: CachedFlags) {
            self.snapshots
                .lock()
                .unwrap()
                .insert(identity_key.to_owned(), flags);
        }
    }

    #[test]
    fn round_trips_a_snapshot_through_the_boundary() {
        let cache = InMemoryCache {
            snapshots: Mutex::new(HashMap::new()),
        };
        assert!(cache.get("user-1").is_none());

        cache.put(
            "user-1",
            CachedFlags {
                flags: HashMap::new(),
                last_updated: Utc::now(),
            },
        );
        assert!(cache.get("user-1").is_some());
        assert!(cache.get("user-2").is_none());
    }

    #[test]
    fn default_config_allows_five_identities() {
        assert_eq!(CacheConfig::default().max_cached_identities, 5);
        assert_eq!(
            CacheConfig::new().with_max_cached_identities(2).max_cached_identities,
            2
        );
    }
}
