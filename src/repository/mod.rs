//! Per-AU repository: node lookup through the node cache, node lifecycle
//! and consistency checking.

pub(crate) mod files;
mod listing;
mod node;
mod version;


use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::backend::NodeStore;
use crate::cache::{CacheStats, NodeCache};
use crate::config::{ConfigHandle, RepositoryConfig};
use crate::error::{RepoError, RepoResult};
use crate::path_mapper::{canonicalize, map_url_to_location};
use crate::size_calc::{BackgroundSizeCalculator, SizeCalcTarget};
use crate::suspect::{SUSPECT_VERSIONS_FILE, SuspectVersionTracker};
use crate::types::{CanonicalUrl, NodeKind};

pub use files::{CONTENT_NAME, LEAF_SENTINEL, NODE_PROPS_FILE, WAS_INACTIVE_KEY};
pub use node::{ContentState, NodeContents, NodeVersion, RepositoryNode};

use files::NodeFiles;

pub(crate) struct RepoShared {
    au_root: PathBuf,
    pub(crate) config: Arc<ConfigHandle>,
    cache: Mutex<NodeCache<RepositoryNode>>,
    suspects: SuspectVersionTracker,
    size_calc: Option<Arc<BackgroundSizeCalculator>>,
}

impl RepoShared {
    /// Cache lookup, then construct from disk. `create` makes a missing
    /// node (and promotes an existing internal node) a leaf.
    pub(crate) fn get(
        self: &Arc<Self>,
        url: &CanonicalUrl,
        create: bool,
    ) -> RepoResult<Arc<RepositoryNode>> {
        let cached = self.cache.lock().get(url);
        let node = match cached {
            Some(node) => node,
            None => {
                let Some(node) = self.load(url, create)? else {
                    return Err(RepoError::NotFound(url.to_string()));
                };
                self.cache.lock().put_if_new(url.clone(), node)
            }
        };
        if create {
            if node.kind() == NodeKind::Internal {
                return self.reclassify_as_leaf(url);
            }
            node.create_node_location()?;
        }
        Ok(node)
    }

    fn load(
        self: &Arc<Self>,
        url: &CanonicalUrl,
        create: bool,
    ) -> RepoResult<Option<Arc<RepositoryNode>>> {
        let location = map_url_to_location(&self.au_root, url)?;
        let files = NodeFiles::new(&location);
        let mut created = false;
        let kind = if url.is_au_url() {
            NodeKind::Au
        } else if files.leaf_sentinel().is_file() {
            NodeKind::Leaf
        } else if location.is_dir() {
            NodeKind::Internal
        } else if create {
            files::ensure_dir(&location)?;
            write_leaf_sentinel(&files)?;
            created = true;
            NodeKind::Leaf
        } else {
            return Ok(None);
        };
        debug!(node.url = %url, ?kind, "constructed node");
        let node = RepositoryNode::new_arc(url.clone(), location, kind, Arc::downgrade(self));
        if created {
            // new child, so cached counts above are stale
            node.invalidate_cached_values();
        }
        Ok(Some(node))
    }

    fn reclassify_as_leaf(self: &Arc<Self>, url: &CanonicalUrl) -> RepoResult<Arc<RepositoryNode>> {
        let location = map_url_to_location(&self.au_root, url)?;
        write_leaf_sentinel(&NodeFiles::new(&location))?;
        info!(node.url = %url, "reclassified internal node as leaf");
        self.cache.lock().invalidate(url);
        self.get(url, false)
    }

    pub(crate) fn queue_size_calc(&self, node: Arc<RepositoryNode>) {
        match &self.size_calc {
            Some(calc) => {
                calc.enqueue(node);
            }
            None => debug!(node.url = %node.url(), "no size calculator, not queueing"),
        }
    }
}

fn write_leaf_sentinel(files: &NodeFiles) -> RepoResult<()> {
    let sentinel = files.leaf_sentinel();
    File::create(&sentinel)
        .map_err(|e| RepoError::fault(format!("couldn't create {}", sentinel.display()), e))?;
    Ok(())
}

impl SizeCalcTarget for RepositoryNode {
    fn location(&self) -> &Path {
        RepositoryNode::location(self)
    }

    fn recalculate(&self) -> RepoResult<()> {
        self.tree_content_size(None, true)?;
        if self.kind().is_au() {
            self.disk_usage(true)?;
        }
        Ok(())
    }
}

/// The repository of one AU, rooted at its short-named directory.
#[derive(Clone)]
pub struct LocalRepository {
    shared: Arc<RepoShared>,
}

impl std::fmt::Debug for LocalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRepository")
            .field("au_root", &self.shared.au_root)
            .finish_non_exhaustive()
    }
}

impl LocalRepository {
    /// Opens the repository rooted at `au_root`, creating the directory if
    /// needed. Without a size calculator, unknown sizes are never queued.
    pub fn open(
        au_root: impl Into<PathBuf>,
        config: Arc<ConfigHandle>,
        size_calc: Option<Arc<BackgroundSizeCalculator>>,
    ) -> RepoResult<Self> {
        let au_root = au_root.into();
        files::ensure_dir(&au_root)?;
        let cache_size = config.current().node_cache_size;
        let suspects = SuspectVersionTracker::load(au_root.join(SUSPECT_VERSIONS_FILE));
        debug!(au.dir = %au_root.display(), "opened repository");
        Ok(Self {
            shared: Arc::new(RepoShared {
                au_root,
                config,
                cache: Mutex::new(NodeCache::new(cache_size)),
                suspects,
                size_calc,
            }),
        })
    }

    /// Opens a standalone repository with its own configuration.
    pub fn with_config(au_root: impl Into<PathBuf>, config: RepositoryConfig) -> RepoResult<Self> {
        Self::open(au_root, Arc::new(ConfigHandle::new(config)), None)
    }

    pub fn au_root(&self) -> &Path {
        &self.shared.au_root
    }

    /// The node for `url`, creating it as a leaf when `create_if_absent`.
    #[instrument(level = "debug", skip(self))]
    pub fn get(&self, url: &str, create_if_absent: bool) -> RepoResult<Arc<RepositoryNode>> {
        let url = canonicalize(url)?;
        self.shared.get(&url, create_if_absent)
    }

    /// The AU root node.
    pub fn au_node(&self) -> RepoResult<Arc<RepositoryNode>> {
        self.shared.get(&CanonicalUrl::au_url(), false)
    }

    /// Turns an existing internal node into a leaf. Holders of the old
    /// node object keep seeing it as internal.
    pub fn reclassify_as_leaf(&self, url: &str) -> RepoResult<Arc<RepositoryNode>> {
        let url = canonicalize(url)?;
        self.shared.reclassify_as_leaf(&url)
    }

    /// Drops `url` from the node cache; the next lookup rebuilds it from disk.
    pub fn invalidate_node(&self, url: &str) -> RepoResult<()> {
        let url = canonicalize(url)?;
        self.shared.cache.lock().invalidate(&url);
        Ok(())
    }

    pub fn suspect_versions(&self) -> &SuspectVersionTracker {
        &self.shared.suspects
    }

    pub fn queue_size_calc(&self, node: Arc<RepositoryNode>) {
        self.shared.queue_size_calc(node);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.lock().stats()
    }

    pub fn set_cache_size(&self, size: std::num::NonZeroUsize) {
        self.shared.cache.lock().set_max_size(size);
    }

    /// Walks the tree from the AU root, repairing what it can and
    /// deactivating nodes it can't. Returns the deactivated nodes' URLs.
    #[instrument(level = "debug", skip(self), fields(au.dir = %self.shared.au_root.display()))]
    pub fn node_consistency_check(&self) -> RepoResult<Vec<CanonicalUrl>> {
        let mut deactivated = Vec::new();
        let mut pending = vec![self.au_node()?];
        while let Some(node) = pending.pop() {
            if node.check_consistency()? {
                let mut children = node.list_children(None, false)?;
                children.reverse();
                pending.extend(children);
            } else {
                self.deactivate_inconsistent_node(&node);
                deactivated.push(node.url().clone());
            }
        }
        info!(count = deactivated.len(), "consistency check done");
        Ok(deactivated)
    }

    fn deactivate_inconsistent_node(&self, node: &RepositoryNode) {
        warn!(node.url = %node.url(), "deactivating inconsistent node");
        if let Err(e) = node.create_node_location() {
            warn!(node.url = %node.url(), error = %e, "couldn't recreate node location");
        }
        if let Err(e) = node.deactivate_content() {
            warn!(node.url = %node.url(), error = %e, "couldn't deactivate");
        }
    }
}

impl NodeStore for LocalRepository {
    fn get_node(&self, url: &str) -> RepoResult<Arc<RepositoryNode>> {
        self.get(url, false)
    }

    fn create_node(&self, url: &str) -> RepoResult<Arc<RepositoryNode>> {
        self.get(url, true)
    }

    fn delete_node(&self, url: &str) -> RepoResult<()> {
        self.get(url, false)?.mark_as_deleted()
    }

    fn deactivate_node(&self, url: &str) -> RepoResult<()> {
        self.get(url, false)?.deactivate_content()
    }
}
