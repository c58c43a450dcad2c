//! Entry point for an embedding daemon: owns configuration, the AU
//! directory maps, the open repositories and the size calculator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::au_dirs::AuDirectoryMap;
use crate::backend::{ArchivalUnit, LoggingWatchdog, Watchdog};
use crate::config::{ConfigHandle, RepositoryConfig};
use crate::error::RepoResult;
use crate::repository::{LocalRepository, RepositoryNode};
use crate::size_calc::BackgroundSizeCalculator;

pub struct RepositoryManager {
    config: Arc<ConfigHandle>,
    dir_maps: Mutex<HashMap<PathBuf, Arc<AuDirectoryMap>>>,
    repos: Mutex<HashMap<String, LocalRepository>>,
    size_calc: Arc<BackgroundSizeCalculator>,
}

impl std::fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryManager")
            .field("repository_root", &self.config.current().repository_root)
            .field("open_repositories", &self.repos.lock().len())
            .finish_non_exhaustive()
    }
}

impl RepositoryManager {
    pub fn new(config: RepositoryConfig) -> RepoResult<Self> {
        Self::with_watchdog(config, Arc::new(LoggingWatchdog::new("size_calc")))
    }

    /// Like [`RepositoryManager::new`], reporting size calculator liveness
    /// to `watchdog`.
    pub fn with_watchdog(config: RepositoryConfig, watchdog: Arc<dyn Watchdog>) -> RepoResult<Self> {
        config.validate()?;
        let config = Arc::new(ConfigHandle::new(config));
        let size_calc = Arc::new(BackgroundSizeCalculator::new(config.clone(), watchdog));
        Ok(Self {
            config,
            dir_maps: Mutex::new(HashMap::new()),
            repos: Mutex::new(HashMap::new()),
            size_calc,
        })
    }

    pub fn config(&self) -> Arc<RepositoryConfig> {
        self.config.current()
    }

    /// Installs a new configuration. Open repositories pick up the new node
    /// cache size immediately; a new repository root only affects AUs
    /// opened afterwards.
    pub fn set_config(&self, config: RepositoryConfig) -> RepoResult<()> {
        config.validate()?;
        let cache_size = config.node_cache_size;
        let old = self.config.replace(config);
        if old.node_cache_size != cache_size {
            info!(cache_size = cache_size.get(), "resizing node caches");
            for repo in self.repos.lock().values() {
                repo.set_cache_size(cache_size);
            }
        }
        Ok(())
    }

    fn dir_map(&self, repository_root: &Path) -> RepoResult<Arc<AuDirectoryMap>> {
        let mut maps = self.dir_maps.lock();
        if let Some(map) = maps.get(repository_root) {
            return Ok(map.clone());
        }
        let map = Arc::new(AuDirectoryMap::open(repository_root)?);
        debug!(root = %repository_root.display(), au_count = map.len(), "opened au directory map");
        maps.insert(repository_root.to_path_buf(), map.clone());
        Ok(map)
    }

    /// The directory holding `au`'s repository, allocated on first request.
    pub fn au_directory(&self, au: &dyn ArchivalUnit) -> RepoResult<PathBuf> {
        let config = self.config();
        let map = self.dir_map(&config.repository_root)?;
        let short = map.assign(au.au_id(), au.plugin_id(), config.max_unused_dir_search)?;
        Ok(map.location(&short))
    }

    /// `au`'s directory if one was ever allocated, without allocating.
    pub fn existing_au_directory(&self, au: &dyn ArchivalUnit) -> RepoResult<Option<PathBuf>> {
        let map = self.dir_map(&self.config().repository_root)?;
        Ok(map.lookup(au.au_id()).map(|short| map.location(&short)))
    }

    /// The repository for `au`, opening it on first request. Repeated calls
    /// share one node cache.
    #[instrument(level = "debug", skip_all, fields(au.id = %au.au_id()))]
    pub fn repository_for_au(&self, au: &dyn ArchivalUnit) -> RepoResult<LocalRepository> {
        let mut repos = self.repos.lock();
        if let Some(repo) = repos.get(au.au_id()) {
            return Ok(repo.clone());
        }
        let dir = self.au_directory(au)?;
        let repo = LocalRepository::open(&dir, self.config.clone(), Some(self.size_calc.clone()))?;
        info!(au.dir = %dir.display(), "opened au repository");
        repos.insert(au.au_id().to_string(), repo.clone());
        Ok(repo)
    }

    /// Closes `au`'s repository and forgets its directory mapping. Files on
    /// disk are untouched.
    pub fn forget_au(&self, au: &dyn ArchivalUnit) -> RepoResult<bool> {
        let closed = self.repos.lock().remove(au.au_id()).is_some();
        let map = self.dir_map(&self.config().repository_root)?;
        Ok(map.remove(au.au_id()) || closed)
    }

    pub fn open_repositories(&self) -> usize {
        self.repos.lock().len()
    }

    /// Queues `node`'s cached sizes for background recalculation.
    pub fn queue_size_calc(&self, node: Arc<RepositoryNode>) -> bool {
        self.size_calc.enqueue(node)
    }

    pub fn size_calculator(&self) -> &Arc<BackgroundSizeCalculator> {
        &self.size_calc
    }

    /// Stops the size calculator. Repositories stay usable, but unknown
    /// sizes are no longer calculated in the background.
    pub fn shutdown(&self) {
        info!("shutting down repository manager");
        self.size_calc.shutdown();
    }
}

impl Drop for RepositoryManager {
    fn drop(&mut self) {
        self.size_calc.shutdown();
    }
}
