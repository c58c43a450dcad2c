//! Child enumeration and the sizes cached in node properties.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use crate::error::{RepoError, RepoResult};
use crate::path_mapper::{self, canonicalize, child_url, host_url};
use crate::types::{CanonicalUrl, UrlFilter};

use super::RepoShared;
use super::files::CachedValue;
use super::node::{ContentState, RepositoryNode};

impl RepositoryNode {
    /// Immediate children, sorted by directory name. Deleted nodes are never
    /// listed; inactive leaves only with `include_inactive`.
    pub fn list_children(
        &self,
        filter: Option<UrlFilter<'_>>,
        include_inactive: bool,
    ) -> RepoResult<Vec<Arc<RepositoryNode>>> {
        let repo = self.repo()?;
        let mut seen = HashSet::new();
        let mut children = Vec::new();

        if self.kind().is_au() {
            // <au root>/<host>/<protocol>/...
            for host in child_dir_names(self.location())? {
                for protocol in child_dir_names(&self.location().join(&host))? {
                    let raw = host_url(&host, &protocol);
                    if let Some(child) =
                        visit_child(&repo, &raw, filter, include_inactive, &mut seen)
                    {
                        children.push(child);
                    }
                }
            }
        } else {
            for name in child_dir_names(self.location())? {
                let raw = child_url(self.url(), &name);
                if let Some(child) = visit_child(&repo, &raw, filter, include_inactive, &mut seen)
                {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    /// Number of listed children, cached in node properties.
    pub fn child_count(&self) -> RepoResult<u32> {
        {
            let mut st = self.lock();
            self.ensure_loaded(&mut st)?;
            if let Some(count) = st.node_props.child_count.known() {
                return Ok(count);
            }
        }
        let count = count_u32(self.list_children(None, false)?.len());
        let mut st = self.lock();
        st.node_props.child_count = CachedValue::Known(count);
        st.node_props.store(&self.files.node_props())?;
        Ok(count)
    }

    fn cached_tree_size(&self) -> RepoResult<Option<u64>> {
        let mut st = self.lock();
        self.ensure_loaded(&mut st)?;
        Ok(st.node_props.tree_size.known())
    }

    /// Bytes of current content in this subtree. Unfiltered results are
    /// cached. When unknown and `calc_if_unknown` is false the node is queued
    /// for background calculation and `None` is returned.
    pub fn tree_content_size(
        &self,
        filter: Option<UrlFilter<'_>>,
        calc_if_unknown: bool,
    ) -> RepoResult<Option<u64>> {
        if filter.is_none() {
            if let Some(size) = self.cached_tree_size()? {
                trace!(node.url = %self.url(), "found cached size");
                return Ok(Some(size));
            }
        }
        if !calc_if_unknown {
            self.queue_size_calc();
            return Ok(None);
        }

        let _calculating = self.tree_size_lock.lock();
        if filter.is_none() {
            if let Some(size) = self.cached_tree_size()? {
                return Ok(Some(size));
            }
        }

        let mut total = {
            let mut st = self.lock();
            match self.ensure_loaded(&mut st)? {
                ContentState::Current(_) => self.current_content_size(&mut st)?,
                _ => 0,
            }
        };
        let children = self.list_children(filter, false)?;
        for child in &children {
            total += child.tree_content_size(None, true)?.unwrap_or(0);
        }

        if filter.is_none() {
            let mut st = self.lock();
            st.node_props.tree_size = CachedValue::Known(total);
            st.node_props.child_count = CachedValue::Known(count_u32(children.len()));
            st.node_props.store(&self.files.node_props())?;
        }
        Ok(Some(total))
    }

    /// Bytes used by every file under an AU root, cached like the tree size.
    pub fn disk_usage(&self, calc_if_unknown: bool) -> RepoResult<Option<u64>> {
        if !self.kind().is_au() {
            return Err(RepoError::UnsupportedOperation(format!(
                "disk_usage on {}",
                self.url()
            )));
        }
        {
            let mut st = self.lock();
            self.ensure_loaded(&mut st)?;
            if let Some(usage) = st.node_props.disk_usage.known() {
                return Ok(Some(usage));
            }
        }
        if !calc_if_unknown {
            self.queue_size_calc();
            return Ok(None);
        }

        let usage = du(self.location());
        let mut st = self.lock();
        st.node_props.disk_usage = CachedValue::Known(usage);
        st.node_props.store(&self.files.node_props())?;
        Ok(Some(usage))
    }

    pub(crate) fn queue_size_calc(&self) {
        match (self.repo().ok(), self.arc()) {
            (Some(repo), Some(node)) => repo.queue_size_calc(node),
            _ => debug!(node.url = %self.url(), "repository closed, not queueing size calc"),
        }
    }
}

fn visit_child(
    repo: &Arc<RepoShared>,
    raw: &str,
    filter: Option<UrlFilter<'_>>,
    include_inactive: bool,
    seen: &mut HashSet<CanonicalUrl>,
) -> Option<Arc<RepositoryNode>> {
    let url = match canonicalize(raw) {
        Ok(url) => url,
        Err(e) => {
            error!(url = %raw, error = %e, "malformed child url");
            return None;
        }
    };
    if !seen.insert(url.clone()) {
        return None;
    }
    if filter.is_some_and(|matches| !matches(url.as_str())) {
        return None;
    }

    let node = match repo.get(&url, false) {
        Ok(node) => node,
        Err(RepoError::NotFound(_)) => {
            warn!(node.url = %url, "child node not found, disappeared or unnormalized");
            return None;
        }
        Err(e) => {
            warn!(node.url = %url, error = %e, "skipping unloadable child");
            return None;
        }
    };
    match node.content_state() {
        Ok(ContentState::Deleted) => None,
        Ok(ContentState::Inactive) if !include_inactive && node.is_leaf() => None,
        Ok(_) => Some(node),
        Err(e) => {
            warn!(node.url = %url, error = %e, "skipping unloadable child");
            None
        }
    }
}

/// Names of the subdirectories of `dir` that can hold nodes, sorted.
fn child_dir_names(dir: &Path) -> RepoResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        error!(dir = %dir.display(), "no cache directory located");
        RepoError::fault(format!("no cache directory located: {}", dir.display()), e)
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if !path_mapper::is_sentinel_name(&name) => names.push(name),
            Ok(_) => {}
            Err(name) => warn!(?name, "skipping non-utf8 directory"),
        }
    }
    names.sort_unstable();
    Ok(names)
}

fn du(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry in disk usage");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
