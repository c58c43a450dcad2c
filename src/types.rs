//! Core types shared across the repository: canonical URLs, node kinds and
//! version properties.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pseudo-URL naming the root node of an Archival Unit.
pub const AU_URL: &str = "LOCKSSAU:";

/// Property written by the engine at seal time. Callers may not set it.
pub const VERSION_NUMBER_KEY: &str = "version_number";

/// Header properties stored alongside each version of a URL's content.
pub type Properties = BTreeMap<String, String>;

/// A URL normalized by [`crate::path_mapper::canonicalize`]; the key under
/// which nodes are cached and located.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    /// Only the path mapper hands these out.
    pub(crate) fn new_unchecked(url: String) -> Self {
        Self(url)
    }

    pub fn au_url() -> Self {
        Self(AU_URL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_au_url(&self) -> bool {
        self.0 == AU_URL
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which variant a node is, decided once when the node object is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Root of an Archival Unit; children are host/protocol pairs.
    Au,
    /// Pure path segment: children, no content.
    Internal,
    /// Holds versioned content.
    Leaf,
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf)
    }

    pub fn is_au(&self) -> bool {
        matches!(self, NodeKind::Au)
    }
}

/// Predicate over canonical child URLs used to filter listings.
pub type UrlFilter<'a> = &'a (dyn Fn(&str) -> bool + Sync);
