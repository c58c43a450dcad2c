//! Repository nodes: one directory on disk per canonical URL.
//!
//! A node's variant is fixed when the object is built. Content state and
//! node properties are loaded lazily on first use and guarded by the
//! node's own lock; nothing here takes another node's lock while holding
//! that one.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::RepositoryConfig;
use crate::error::{RepoError, RepoResult};
use crate::path_mapper::parent_url;
use crate::types::{CanonicalUrl, NodeKind, Properties};

use super::RepoShared;
use super::files::{self, NodeFiles, NodeProps};
use super::version::Transaction;

/// Content state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentState {
    /// Version 0. Also what a crash between seal renames reads as.
    NoContent,
    Current(u32),
    /// Content moved aside, recoverable with `restore_last_version`.
    Inactive,
    /// Marked deleted; content is kept inactive.
    Deleted,
}

impl ContentState {
    pub fn has_content(&self) -> bool {
        matches!(self, ContentState::Current(_))
    }
}

#[derive(Debug, Default)]
pub(super) struct NodeState {
    /// `None` until loaded from disk.
    pub content: Option<ContentState>,
    pub current_props: Option<Properties>,
    pub node_props: NodeProps,
    pub txn: Option<Transaction>,
}

pub struct RepositoryNode {
    url: CanonicalUrl,
    pub(super) files: NodeFiles,
    kind: NodeKind,
    repo: Weak<RepoShared>,
    this: Weak<RepositoryNode>,
    pub(super) state: Mutex<NodeState>,
    pub(super) tree_size_lock: Mutex<()>,
}

impl fmt::Debug for RepositoryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryNode")
            .field("url", &self.url)
            .field("location", &self.files.dir())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl RepositoryNode {
    pub(super) fn new_arc(
        url: CanonicalUrl,
        location: PathBuf,
        kind: NodeKind,
        repo: Weak<RepoShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            url,
            files: NodeFiles::new(location),
            kind,
            repo,
            this: this.clone(),
            state: Mutex::new(NodeState::default()),
            tree_size_lock: Mutex::new(()),
        })
    }

    pub fn url(&self) -> &CanonicalUrl {
        &self.url
    }

    pub fn location(&self) -> &Path {
        self.files.dir()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    pub(super) fn repo(&self) -> RepoResult<Arc<RepoShared>> {
        self.repo
            .upgrade()
            .ok_or_else(|| RepoError::IllegalState(format!("repository closed: {}", self.url)))
    }

    pub(super) fn arc(&self) -> Option<Arc<RepositoryNode>> {
        self.this.upgrade()
    }

    pub(super) fn config(&self) -> Arc<RepositoryConfig> {
        self.repo
            .upgrade()
            .map(|repo| repo.config.current())
            .unwrap_or_default()
    }

    pub(super) fn require_leaf(&self, op: &str) -> RepoResult<()> {
        if self.kind.is_leaf() {
            Ok(())
        } else {
            Err(RepoError::UnsupportedOperation(format!(
                "{op} on {:?} node {}",
                self.kind, self.url
            )))
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    /// Loads node properties and the current version if not yet loaded.
    pub(super) fn ensure_loaded(&self, st: &mut NodeState) -> RepoResult<ContentState> {
        if let Some(content) = st.content {
            return Ok(content);
        }
        st.node_props = NodeProps::load(&self.files.node_props());
        let content = if self.kind.is_au() {
            ContentState::NoContent
        } else if st.node_props.deleted {
            ContentState::Deleted
        } else if st.node_props.inactive {
            ContentState::Inactive
        } else if self.kind.is_leaf() {
            self.load_current(st)?
        } else {
            ContentState::NoContent
        };
        st.content = Some(content);
        Ok(content)
    }

    fn load_current(&self, st: &mut NodeState) -> RepoResult<ContentState> {
        st.current_props = None;
        let content_path = self.files.current_content();
        let props_path = self.files.current_props();
        if !content_path.exists() || !props_path.exists() {
            if !content_path.exists() && self.files.inactive_content().exists() {
                return Ok(ContentState::Inactive);
            }
            return Ok(ContentState::NoContent);
        }

        match files::read_props(&props_path) {
            Ok(props) => {
                let version = files::version_from_props(&props, &props_path);
                if version == 0 {
                    return Ok(ContentState::NoContent);
                }
                st.current_props = Some(props);
                Ok(ContentState::Current(version))
            }
            Err(e) => {
                self.maybe_deactivate_inconsistent(st);
                Err(e)
            }
        }
    }

    fn maybe_deactivate_inconsistent(&self, st: &mut NodeState) {
        if !self.config().deactivate_node_on_error {
            debug!(node.url = %self.url, "not deactivating inconsistent node");
            return;
        }
        warn!(node.url = %self.url, "deactivating inconsistent node");
        if let Err(e) = self.move_current_to_inactive(st) {
            error!(node.url = %self.url, error = %e, "couldn't deactivate inconsistent node");
        }
    }

    /// Moves the current files aside and flags the node inactive.
    pub(super) fn move_current_to_inactive(&self, st: &mut NodeState) -> RepoResult<()> {
        files::ensure_dir(self.files.dir())?;
        let current_content = self.files.current_content();
        if current_content.exists() {
            files::rename(
                &current_content,
                &self.files.inactive_content(),
                "current content",
            )?;
        }
        let current_props = self.files.current_props();
        if current_props.exists() {
            files::rename(
                &current_props,
                &self.files.inactive_props(),
                "current properties",
            )?;
        }
        st.node_props.inactive = true;
        st.node_props.invalidate();
        st.node_props.store(&self.files.node_props())?;
        st.content = Some(ContentState::Inactive);
        st.current_props = None;
        Ok(())
    }

    pub fn content_state(&self) -> RepoResult<ContentState> {
        let mut st = self.lock();
        self.ensure_loaded(&mut st)
    }

    pub fn has_content(&self) -> RepoResult<bool> {
        Ok(self.content_state()?.has_content())
    }

    pub fn is_content_inactive(&self) -> RepoResult<bool> {
        Ok(self.content_state()? == ContentState::Inactive)
    }

    pub fn is_deleted(&self) -> RepoResult<bool> {
        Ok(self.content_state()? == ContentState::Deleted)
    }

    pub fn get_current_version(&self) -> RepoResult<u32> {
        self.require_leaf("get_current_version")?;
        match self.content_state()? {
            ContentState::Current(version) => Ok(version),
            _ => Err(RepoError::IllegalState(format!(
                "no content, so no version: {}",
                self.url
            ))),
        }
    }

    pub fn content_size(&self) -> RepoResult<u64> {
        self.require_leaf("content_size")?;
        let mut st = self.lock();
        self.current_content_size(&mut st)
    }

    pub(super) fn current_content_size(&self, st: &mut NodeState) -> RepoResult<u64> {
        if !self.ensure_loaded(st)?.has_content() {
            return Err(RepoError::IllegalState(format!(
                "no content to get size from: {}",
                self.url
            )));
        }
        let path = self.files.current_content();
        Ok(fs::metadata(&path)
            .map_err(|e| RepoError::fault(path.display(), e))?
            .len())
    }

    /// Opens the current version. The returned reader and properties stay
    /// consistent with each other even if a new version is sealed later.
    pub fn node_contents(&self) -> RepoResult<NodeContents> {
        self.require_leaf("node_contents")?;
        let mut st = self.lock();
        let ContentState::Current(version) = self.ensure_loaded(&mut st)? else {
            return Err(RepoError::IllegalState(format!(
                "no content for url {}",
                self.url
            )));
        };
        let path = self.files.current_content();
        let file = File::open(&path).map_err(|e| {
            error!(node.url = %self.url, error = %e, "couldn't open current content");
            RepoError::fault(path.display(), e)
        })?;
        let props = match &st.current_props {
            Some(props) => props.clone(),
            None => files::read_props(&self.files.current_props())?,
        };
        Ok(NodeContents {
            version,
            props,
            reader: BufReader::new(file),
        })
    }

    /// All versions still on disk, newest first.
    pub fn node_versions(&self) -> RepoResult<Vec<NodeVersion>> {
        self.require_leaf("node_versions")?;
        let mut st = self.lock();
        let mut versions = Vec::new();
        if let ContentState::Current(current) = self.ensure_loaded(&mut st)? {
            versions.push(NodeVersion::current(&self.files, current));
        }
        for version in self.files.historical_versions()?.into_iter().rev() {
            if self.files.version_props(version).exists() {
                versions.push(NodeVersion::historical(&self.files, version));
            }
        }
        Ok(versions)
    }

    pub fn node_version(&self, version: u32) -> RepoResult<NodeVersion> {
        self.require_leaf("node_version")?;
        let mut st = self.lock();
        if self.ensure_loaded(&mut st)? == ContentState::Current(version) {
            return Ok(NodeVersion::current(&self.files, version));
        }
        let found = NodeVersion::historical(&self.files, version);
        if found.content.exists() && found.props.exists() {
            Ok(found)
        } else {
            Err(RepoError::NotFound(format!("version {version} of {}", self.url)))
        }
    }

    /// Creates the node directory (and leaf sentinel) if missing.
    pub fn create_node_location(&self) -> RepoResult<()> {
        files::ensure_dir(self.files.dir())?;
        if self.kind.is_leaf() {
            let sentinel = self.files.leaf_sentinel();
            if !sentinel.exists() {
                File::create(&sentinel)
                    .map_err(|e| RepoError::fault(format!("couldn't create {}", sentinel.display()), e))?;
            }
        }
        Ok(())
    }

    /// Moves the current version aside. A later `restore_last_version` or a
    /// new sealed version brings it back.
    pub fn deactivate_content(&self) -> RepoResult<()> {
        self.reject_au("deactivate_content")?;
        {
            let mut st = self.lock();
            self.reject_open_txn(&st, "deactivate")?;
            match self.ensure_loaded(&mut st)? {
                ContentState::Deleted => {
                    warn!(node.url = %self.url, "node already deleted, not deactivating");
                    return Ok(());
                }
                ContentState::Inactive => return Ok(()),
                _ => self.move_current_to_inactive(&mut st)?,
            }
        }
        debug!(node.url = %self.url, "deactivated");
        self.invalidate_cached_values();
        Ok(())
    }

    pub fn mark_as_deleted(&self) -> RepoResult<()> {
        self.reject_au("mark_as_deleted")?;
        {
            let mut st = self.lock();
            self.reject_open_txn(&st, "delete")?;
            if self.ensure_loaded(&mut st)? != ContentState::Inactive {
                self.move_current_to_inactive(&mut st)?;
            }
            st.node_props.deleted = true;
            st.node_props.store(&self.files.node_props())?;
            st.content = Some(ContentState::Deleted);
        }
        debug!(node.url = %self.url, "marked deleted");
        self.invalidate_cached_values();
        Ok(())
    }

    /// Clears the deleted mark and restores any inactive content.
    pub fn mark_as_not_deleted(&self) -> RepoResult<()> {
        self.reject_au("mark_as_not_deleted")?;
        {
            let mut st = self.lock();
            self.reject_open_txn(&st, "undelete")?;
            self.ensure_loaded(&mut st)?;
            st.node_props.deleted = false;
            st.node_props.store(&self.files.node_props())?;
            self.restore_inactive(&mut st)?;
        }
        self.invalidate_cached_values();
        Ok(())
    }

    /// Brings back inactive or deleted content, or for active content
    /// discards the current version in favour of the one before it.
    pub fn restore_last_version(&self) -> RepoResult<()> {
        self.require_leaf("restore_last_version")?;
        {
            let mut st = self.lock();
            self.reject_open_txn(&st, "restore")?;
            let state = self.ensure_loaded(&mut st)?;
            let previous = match state {
                ContentState::Current(current) => self.previous_version(current)?,
                _ => None,
            };
            match (state, previous) {
                (ContentState::Deleted, _) => {
                    st.node_props.deleted = false;
                    st.node_props.store(&self.files.node_props())?;
                    self.restore_inactive(&mut st)?;
                }
                (ContentState::Inactive, _) => self.restore_inactive(&mut st)?,
                (ContentState::Current(current), Some(previous)) => {
                    self.roll_back(&mut st, current, previous)?;
                }
                _ => {
                    error!(node.url = %self.url, "version restore attempted on node without previous versions");
                    return Err(RepoError::IllegalState(format!(
                        "node must have previous versions: {}",
                        self.url
                    )));
                }
            }
        }
        self.invalidate_cached_values();
        Ok(())
    }

    /// Version the inactive files hold, or 0 if there are none.
    pub(super) fn last_active_version(&self) -> RepoResult<u32> {
        let path = self.files.inactive_props();
        if !path.exists() {
            return Ok(0);
        }
        let props = files::read_props(&path)?;
        Ok(files::version_from_props(&props, &path))
    }

    fn restore_inactive(&self, st: &mut NodeState) -> RepoResult<()> {
        if self.kind.is_leaf() && self.last_active_version()? > 0 {
            files::rename(
                &self.files.inactive_content(),
                &self.files.current_content(),
                "inactive content",
            )?;
            files::rename(
                &self.files.inactive_props(),
                &self.files.current_props(),
                "inactive properties",
            )?;
        }
        st.node_props.inactive = false;
        st.node_props.store(&self.files.node_props())?;
        st.content = None;
        self.ensure_loaded(st)?;
        Ok(())
    }

    /// Newest historical version below `current`.
    fn previous_version(&self, current: u32) -> RepoResult<Option<u32>> {
        Ok(self
            .files
            .historical_versions()?
            .into_iter()
            .filter(|v| *v < current)
            .max())
    }

    fn roll_back(&self, st: &mut NodeState, current: u32, previous: u32) -> RepoResult<()> {
        let previous_content = self.files.version_content(previous);
        let previous_props = self.files.version_props(previous);
        if !previous_content.exists() || !previous_props.exists() {
            return Err(RepoError::StateFault(format!(
                "version {previous} of {} missing",
                self.url
            )));
        }
        // the discarded number stays used up
        st.node_props.max_version = st.node_props.max_version.max(current);
        st.node_props.store(&self.files.node_props())?;
        files::remove_if_exists(&self.files.current_content())?;
        files::remove_if_exists(&self.files.current_props())?;
        files::rename(&previous_content, &self.files.current_content(), "old content")?;
        files::rename(&previous_props, &self.files.current_props(), "old properties")?;
        st.content = None;
        self.ensure_loaded(st)?;
        Ok(())
    }

    /// Repairs what it can (missing directories, stray temp files, a stale
    /// child count) and returns false if the node is still inconsistent.
    pub fn check_consistency(&self) -> RepoResult<bool> {
        let expected = {
            let mut st = self.lock();
            if st.txn.is_some() {
                debug!(node.url = %self.url, "new version open, skipping");
                return Ok(true);
            }
            if let Err(e) = self.create_node_location() {
                error!(node.url = %self.url, error = %e, "couldn't create node location");
                return Ok(false);
            }
            // re-read from disk rather than trusting what's loaded
            let expected = st.content.take();
            st.current_props = None;
            st.node_props = NodeProps::load(&self.files.node_props());

            let present = |content: PathBuf, props: PathBuf, desc: &str| {
                let ok = content.is_file() && props.is_file();
                if !ok {
                    warn!(node.url = %self.url, "{desc} files not found");
                }
                ok
            };
            match expected {
                Some(ContentState::Current(_))
                    if !present(
                        self.files.current_content(),
                        self.files.current_props(),
                        "current",
                    ) =>
                {
                    return Ok(false);
                }
                Some(ContentState::Inactive)
                    if !present(
                        self.files.inactive_content(),
                        self.files.inactive_props(),
                        "inactive",
                    ) =>
                {
                    return Ok(false);
                }
                _ => {}
            }

            for temp in [self.files.temp_content(), self.files.temp_props()] {
                if temp.exists() {
                    debug!(path = %temp.display(), "deleting temp file");
                    files::remove_if_exists(&temp)?;
                }
            }
            expected
        };

        self.check_child_count();

        let mut st = self.lock();
        st.content = None;
        if let Err(e) = self.ensure_loaded(&mut st) {
            error!(node.url = %self.url, error = %e, "still can't load node");
            return Ok(false);
        }
        debug!(node.url = %self.url, ?expected, "node consistent");
        Ok(true)
    }

    fn check_child_count(&self) {
        let cached = self.lock().node_props.child_count.known();
        let Some(cached) = cached else {
            return;
        };
        let actual = match self.list_children(None, false) {
            Ok(children) => children.len(),
            Err(e) => {
                warn!(node.url = %self.url, error = %e, "couldn't list children");
                return;
            }
        };
        if cached as usize != actual {
            warn!(node.url = %self.url, cached, actual, "cached child count erroneous");
            let mut st = self.lock();
            st.node_props.child_count = files::CachedValue::Invalid;
            if let Err(e) = st.node_props.store(&self.files.node_props()) {
                warn!(node.url = %self.url, error = %e, "couldn't store node props");
            }
        }
    }

    fn reject_au(&self, op: &str) -> RepoResult<()> {
        if self.kind.is_au() {
            return Err(RepoError::UnsupportedOperation(format!(
                "{op} on the AU root"
            )));
        }
        Ok(())
    }

    fn reject_open_txn(&self, st: &NodeState, op: &str) -> RepoResult<()> {
        if st.txn.is_some() {
            return Err(RepoError::IllegalState(format!(
                "can't {op} while new version open: {}",
                self.url
            )));
        }
        Ok(())
    }

    /// The node one level up: the parent path's node, or the AU root.
    pub(super) fn parent_node(&self) -> RepoResult<Option<Arc<RepositoryNode>>> {
        if self.kind.is_au() {
            return Ok(None);
        }
        let repo = self.repo()?;
        if let Some(parent) = parent_url(&self.url) {
            match repo.get(&parent, false) {
                Ok(node) => return Ok(Some(node)),
                Err(RepoError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Some(repo.get(&CanonicalUrl::au_url(), false)?))
    }

    /// Marks cached sizes stale here and in each ancestor up to the AU
    /// root, stopping early at an ancestor that was already stale.
    pub(crate) fn invalidate_cached_values(&self) {
        if let Err(e) = self.try_invalidate_cached_values() {
            warn!(node.url = %self.url, error = %e, "couldn't invalidate cached sizes");
        }
    }

    fn try_invalidate_cached_values(&self) -> RepoResult<()> {
        self.invalidate_own(true)?;
        let mut next = self.parent_node()?;
        while let Some(node) = next {
            if !node.invalidate_own(false)? {
                break;
            }
            next = node.parent_node()?;
        }
        Ok(())
    }

    /// Returns whether invalidation should carry on to the parent.
    fn invalidate_own(&self, start: bool) -> RepoResult<bool> {
        let mut st = self.lock();
        if st.content.is_none() {
            if let Err(e) = self.ensure_loaded(&mut st) {
                debug!(node.url = %self.url, error = %e, "invalidating unloaded node");
            }
        }
        let already_invalid =
            st.node_props.tree_size.is_invalid() && st.node_props.child_count.is_invalid();
        if st.node_props.invalidate() {
            st.node_props.store(&self.files.node_props())?;
        }
        Ok(start || !already_invalid)
    }
}

/// The current version of a node, opened for reading.
#[derive(Debug)]
pub struct NodeContents {
    version: u32,
    props: Properties,
    reader: BufReader<File>,
}

impl NodeContents {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn properties(&self) -> &Properties {
        &self.props
    }

    pub fn into_reader(self) -> BufReader<File> {
        self.reader
    }

    pub fn read_to_vec(mut self) -> RepoResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for NodeContents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// One stored version of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeVersion {
    version: u32,
    content: PathBuf,
    props: PathBuf,
}

impl NodeVersion {
    fn current(files: &NodeFiles, version: u32) -> Self {
        Self {
            version,
            content: files.current_content(),
            props: files.current_props(),
        }
    }

    fn historical(files: &NodeFiles, version: u32) -> Self {
        Self {
            version,
            content: files.version_content(version),
            props: files.version_props(version),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn content_size(&self) -> RepoResult<u64> {
        Ok(fs::metadata(&self.content)
            .map_err(|e| RepoError::fault(self.content.display(), e))?
            .len())
    }

    pub fn properties(&self) -> RepoResult<Properties> {
        files::read_props(&self.props)
    }

    pub fn open(&self) -> RepoResult<BufReader<File>> {
        let file =
            File::open(&self.content).map_err(|e| RepoError::fault(self.content.display(), e))?;
        Ok(BufReader::new(file))
    }
}
