//! Two-tier node cache: a bounded LRU of owned nodes in front of an
//! unbounded table of weak handles, so a node that is still referenced
//! somewhere keeps a single identity even after the LRU lets it go.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use serde::Serialize;
use tracing::trace;

use crate::types::CanonicalUrl;

/// Hit/miss counters for both tiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ref_hits: u64,
    pub ref_misses: u64,
}

#[derive(Debug)]
pub struct NodeCache<N> {
    lru: LruCache<CanonicalUrl, Arc<N>>,
    refs: HashMap<CanonicalUrl, Weak<N>>,
    stats: CacheStats,
}

impl<N> NodeCache<N> {
    pub fn new(max_size: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(max_size),
            refs: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Looks `url` up in the LRU tier, then the weak tier. A live weak hit
    /// is promoted back into the LRU.
    pub fn get(&mut self, url: &CanonicalUrl) -> Option<Arc<N>> {
        if let Some(node) = self.lru.get(url) {
            self.stats.cache_hits += 1;
            return Some(node.clone());
        }
        self.stats.cache_misses += 1;

        match self.refs.get(url).and_then(Weak::upgrade) {
            Some(node) => {
                self.stats.ref_hits += 1;
                self.push_lru(url.clone(), node.clone());
                Some(node)
            }
            None => {
                self.stats.ref_misses += 1;
                None
            }
        }
    }

    /// Inserts `node` unless another live node for `url` got there first,
    /// returning whichever node is now cached.
    pub fn put_if_new(&mut self, url: CanonicalUrl, node: Arc<N>) -> Arc<N> {
        if let Some(existing) = self.lru.get(&url) {
            return existing.clone();
        }
        if let Some(existing) = self.refs.get(&url).and_then(Weak::upgrade) {
            self.push_lru(url, existing.clone());
            return existing;
        }
        self.refs.insert(url.clone(), Arc::downgrade(&node));
        self.push_lru(url, node.clone());
        self.maybe_sweep();
        node
    }

    /// Drops `url` from both tiers.
    pub fn invalidate(&mut self, url: &CanonicalUrl) {
        self.lru.pop(url);
        self.refs.remove(url);
    }

    pub fn set_max_size(&mut self, max_size: NonZeroUsize) {
        while self.lru.len() > max_size.get() {
            match self.lru.pop_lru() {
                Some((url, node)) => self.on_evict(&url, node),
                None => break,
            }
        }
        self.lru.resize(max_size);
    }

    pub fn max_size(&self) -> usize {
        self.lru.cap().get()
    }

    /// Number of nodes owned by the LRU tier.
    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Number of weak handles, live or dead.
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn push_lru(&mut self, url: CanonicalUrl, node: Arc<N>) {
        if let Some((evicted_url, evicted)) = self.lru.push(url.clone(), node) {
            // push hands back the old value when the key was already present
            if evicted_url != url {
                self.on_evict(&evicted_url, evicted);
            }
        }
    }

    fn on_evict(&mut self, url: &CanonicalUrl, node: Arc<N>) {
        if Arc::strong_count(&node) == 1 {
            trace!(node.url = %url, "evicted unreferenced node");
            self.refs.remove(url);
        }
    }

    fn maybe_sweep(&mut self) {
        if self.refs.len() > 2 * self.lru.cap().get() {
            let before = self.refs.len();
            self.refs.retain(|_, weak| weak.strong_count() > 0);
            trace!(before, after = self.refs.len(), "swept weak tier");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> CanonicalUrl {
        CanonicalUrl::new_unchecked(s.to_string())
    }

    fn cache(size: usize) -> NodeCache<String> {
        NodeCache::new(NonZeroUsize::new(size).unwrap())
    }

    #[test]
    fn test_put_and_get_same_instance() {
        let mut cache = cache(2);
        let a = cache.put_if_new(url("http://x.org/a"), Arc::new("a".to_string()));
        let got = cache.get(&url("http://x.org/a")).unwrap();
        assert!(Arc::ptr_eq(&a, &got));
        assert_eq!(cache.stats().cache_hits, 1);
    }

    #[test]
    fn test_put_if_new_keeps_first() {
        let mut cache = cache(2);
        let first = cache.put_if_new(url("http://x.org/a"), Arc::new("first".to_string()));
        let second = cache.put_if_new(url("http://x.org/a"), Arc::new("second".to_string()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, "first");
    }

    #[test]
    fn test_evicted_but_referenced_node_keeps_identity() {
        let mut cache = cache(1);
        let a = cache.put_if_new(url("http://x.org/a"), Arc::new("a".to_string()));
        cache.put_if_new(url("http://x.org/b"), Arc::new("b".to_string()));
        assert_eq!(cache.len(), 1);

        // a fell out of the LRU but is still held here
        let again = cache.get(&url("http://x.org/a")).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        let stats = cache.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.ref_hits, 1);
    }

    #[test]
    fn test_evicted_unreferenced_node_is_forgotten() {
        let mut cache = cache(1);
        cache.put_if_new(url("http://x.org/a"), Arc::new("a".to_string()));
        cache.put_if_new(url("http://x.org/b"), Arc::new("b".to_string()));
        assert!(cache.get(&url("http://x.org/a")).is_none());
        assert_eq!(cache.stats().ref_misses, 1);
        assert_eq!(cache.ref_count(), 1);
    }

    #[test]
    fn test_invalidate() {
        let mut cache = cache(4);
        let held = cache.put_if_new(url("http://x.org/a"), Arc::new("a".to_string()));
        cache.invalidate(&url("http://x.org/a"));
        assert!(cache.get(&url("http://x.org/a")).is_none());
        let fresh = cache.put_if_new(url("http://x.org/a"), Arc::new("a2".to_string()));
        assert!(!Arc::ptr_eq(&held, &fresh));
    }

    #[test]
    fn test_shrink_runs_eviction_hook() {
        let mut cache = cache(4);
        for name in ["a", "b", "c", "d"] {
            cache.put_if_new(url(&format!("http://x.org/{name}")), Arc::new(name.to_string()));
        }
        cache.set_max_size(NonZeroUsize::new(2).unwrap());
        assert_eq!(cache.max_size(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.ref_count(), 2);
        assert!(cache.get(&url("http://x.org/d")).is_some());
        assert!(cache.get(&url("http://x.org/a")).is_none());
    }

    #[test]
    fn test_sweeps_dead_refs() {
        let mut cache = cache(1);
        let held: Vec<_> = (0..2)
            .map(|i| cache.put_if_new(url(&format!("http://x.org/{i}")), Arc::new(i.to_string())))
            .collect();
        assert_eq!(cache.ref_count(), 2);
        drop(held);
        // dead handles linger until the weak tier outgrows twice the bound
        cache.put_if_new(url("http://x.org/z"), Arc::new("z".to_string()));
        assert!(cache.ref_count() <= 2);
    }
}
