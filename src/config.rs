//! Repository configuration, loadable from JSON and swappable at runtime.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::error::{RepoError, RepoResult};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Smallest accepted `size_calc_max_load`.
pub const MIN_SIZE_CALC_LOAD: f32 = 0.01;
const DEFAULT_NODE_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => panic!("zero cache size"),
};

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Directory holding the `cache/` tree of AU directories.
    pub repository_root: PathBuf,

    /// Bound on the owned tier of each repository's node cache.
    pub node_cache_size: NonZeroUsize,

    /// How long an unsealed version may sit before another caller can
    /// reclaim it.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub version_timeout: Duration,

    /// Largest share of wall-clock time the size calculator may use.
    pub size_calc_max_load: f32,

    /// How long the idle size calculator waits before re-checking its queue.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub size_calc_idle_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub size_calc_watchdog_interval: Duration,

    /// Probes made looking for an unused AU directory name.
    pub max_unused_dir_search: usize,

    /// Deactivate nodes whose on-disk state can't be loaded.
    pub deactivate_node_on_error: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            repository_root: PathBuf::from("/cache"),
            node_cache_size: DEFAULT_NODE_CACHE_SIZE,
            version_timeout: 5 * HOUR,
            size_calc_max_load: 0.5,
            size_calc_idle_timeout: HOUR,
            size_calc_watchdog_interval: DAY,
            max_unused_dir_search: 30000,
            deactivate_node_on_error: true,
        }
    }
}

impl RepositoryConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            repository_root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> RepoResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RepoError::MalformedInput(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RepoResult<()> {
        if !(self.size_calc_max_load >= MIN_SIZE_CALC_LOAD && self.size_calc_max_load <= 1.0) {
            return Err(RepoError::MalformedInput(format!(
                "size_calc_max_load must be in [{MIN_SIZE_CALC_LOAD}, 1], got {}",
                self.size_calc_max_load
            )));
        }
        if self.max_unused_dir_search == 0 {
            return Err(RepoError::MalformedInput(
                "max_unused_dir_search must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Shared, live-reloadable view of the current configuration.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<RepositoryConfig>>,
}

impl ConfigHandle {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn current(&self) -> Arc<RepositoryConfig> {
        self.current.read().clone()
    }

    /// Swaps in a new configuration, returning the one it replaced.
    pub fn replace(&self, config: RepositoryConfig) -> Arc<RepositoryConfig> {
        std::mem::replace(&mut *self.current.write(), Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RepositoryConfig::from_json_str(
            r#"{"repository_root": "/tmp/repo", "version_timeout": 60}"#,
        )
        .unwrap();
        assert_eq!(config.repository_root, PathBuf::from("/tmp/repo"));
        assert_eq!(config.version_timeout, Duration::from_secs(60));
        assert_eq!(config.node_cache_size.get(), 10);
        assert_eq!(config.size_calc_max_load, 0.5);
    }

    #[test]
    fn test_rejects_bad_load() {
        let err = RepositoryConfig::from_json_str(r#"{"size_calc_max_load": 0.0}"#).unwrap_err();
        assert!(matches!(err, RepoError::MalformedInput(_)));
    }

    #[test]
    fn test_rejects_tiny_load() {
        for load in ["1e-40", "0.001"] {
            let json = format!(r#"{{"size_calc_max_load": {load}}}"#);
            let err = RepositoryConfig::from_json_str(&json).unwrap_err();
            assert!(matches!(err, RepoError::MalformedInput(_)));
        }
        assert!(RepositoryConfig::from_json_str(r#"{"size_calc_max_load": 0.01}"#).is_ok());
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(RepositoryConfig::from_json_str(r#"{"cache_size": 3}"#).is_err());
    }

    #[test]
    fn test_handle_replace() {
        let handle = ConfigHandle::new(RepositoryConfig::default());
        let mut next = RepositoryConfig::default();
        next.size_calc_max_load = 0.25;
        let old = handle.replace(next);
        assert_eq!(old.size_calc_max_load, 0.5);
        assert_eq!(handle.current().size_calc_max_load, 0.25);
    }
}
