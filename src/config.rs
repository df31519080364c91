//! Engine configuration.
//!
//! The surrounding application constructs a [`CacheConfig`] however it
//! likes (CLI, config file, hardcoded defaults); the engine only consumes
//! the resolved value.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many builders are elected on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPolicy {
    /// One builder for the whole process group. The result is distributed
    /// to every other node group's root, which republishes it locally.
    Root,
    /// One builder per node group; the other members of the group wait on
    /// the shared directory.
    Node,
    /// Every process builds independently. Requires per-process cache
    /// directories; a detected shared directory is a configuration error.
    Process,
}

/// What happens to generated source once the build is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStorage {
    /// Retain the source as written.
    Keep,
    /// Retain the source gzip-compressed.
    Compress,
    /// Discard the source; only the binary and log are kept.
    Delete,
}

/// Engine configuration, constructed by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the on-disk cache.
    pub cache_root: PathBuf,
    /// Builder election policy.
    pub policy: BuildPolicy,
    /// Source retention mode.
    pub source_storage: SourceStorage,
    /// Maximum time a builder waits to acquire the per-key build lock.
    pub lock_timeout: Duration,
    /// Age beyond which a lock whose owner cannot be verified alive is
    /// considered abandoned and may be reclaimed. Lower values recover
    /// faster from crashed builders; higher values are safer when builds
    /// legitimately run long on hosts where the owner's liveness cannot
    /// be probed directly.
    pub stale_lock_timeout: Duration,
    /// Maximum time a non-builder waits for a peer's build to appear.
    pub wait_timeout: Duration,
    /// Internal retry attempts after a lock timeout before surfacing it.
    pub lock_retries: u32,
    /// Whether a previously failed entry is retried as if missing (true)
    /// or surfaced as an error (false).
    pub retry_failed: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(".kiln"),
            policy: BuildPolicy::Node,
            source_storage: SourceStorage::Compress,
            lock_timeout: Duration::from_secs(60),
            stale_lock_timeout: Duration::from_secs(300),
            wait_timeout: Duration::from_secs(300),
            lock_retries: 3,
            retry_failed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&BuildPolicy::Root).unwrap(),
            "\"root\""
        );
        assert_eq!(
            serde_json::from_str::<BuildPolicy>("\"node\"").unwrap(),
            BuildPolicy::Node
        );
        assert_eq!(
            serde_json::from_str::<BuildPolicy>("\"process\"").unwrap(),
            BuildPolicy::Process
        );
    }

    #[test]
    fn test_config_round_trips() {
        let config = CacheConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.policy, config.policy);
        assert_eq!(back.lock_timeout, config.lock_timeout);
        assert_eq!(back.cache_root, config.cache_root);
    }
}
