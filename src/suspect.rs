//! Versions that failed hash verification, kept per AU until cleared.

use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{RepoError, RepoResult};
use crate::path_mapper::canonicalize;
use crate::repository::files::{move_aside, write_json};

/// AU root file holding the suspect records.
pub const SUSPECT_VERSIONS_FILE: &str = "#suspect_versions";

/// A (url, version) whose content didn't match its recorded hash. Two
/// records are equal when url and version match; the rest is evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectVersion {
    url: String,
    version: u32,
    #[serde(with = "serde_millis")]
    created: SystemTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    algorithm: Option<String>,
    #[serde(default)]
    computed_hash: Vec<u8>,
    #[serde(default)]
    stored_hash: Vec<u8>,
}

impl SuspectVersion {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }

    pub fn computed_hash(&self) -> &[u8] {
        &self.computed_hash
    }

    pub fn stored_hash(&self) -> &[u8] {
        &self.stored_hash
    }
}

impl PartialEq for SuspectVersion {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.version == other.version
    }
}

impl Eq for SuspectVersion {}

impl Hash for SuspectVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.version.hash(state);
    }
}

type Key = (String, u32);

#[derive(Debug, Default)]
pub struct SuspectVersionTracker {
    path: Option<PathBuf>,
    versions: Mutex<HashMap<Key, SuspectVersion>>,
}

impl SuspectVersionTracker {
    /// A tracker that isn't persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the records at `path`, which every mutation rewrites. A missing
    /// file starts empty; an unreadable one is moved aside to `.ERROR` first
    /// so the next write can't destroy it.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let versions = match File::open(&path) {
            Ok(file) => {
                match serde_json::from_reader::<_, Vec<SuspectVersion>>(BufReader::new(file)) {
                    Ok(list) => list
                        .into_iter()
                        .map(|mut sv| {
                            sv.url = key_url(&sv.url);
                            ((sv.url.clone(), sv.version), sv)
                        })
                        .collect(),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "loading suspect versions");
                        move_aside(&path);
                        HashMap::new()
                    }
                }
            }
            Err(_) => {
                debug!(path = %path.display(), "creating new suspect versions");
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            versions: Mutex::new(versions),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_suspect(&self, url: &str, version: u32) -> bool {
        self.versions.lock().contains_key(&(key_url(url), version))
    }

    /// Records a verification failure. The first record for a version is
    /// kept; marking it again fails with `AlreadyMarked`.
    pub fn mark_as_suspect(
        &self,
        url: &str,
        version: u32,
        algorithm: Option<&str>,
        computed_hash: &[u8],
        stored_hash: &[u8],
    ) -> RepoResult<()> {
        let url = canonicalize(url)?.as_str().to_string();
        let key = (url.clone(), version);
        let mut versions = self.versions.lock();
        if versions.contains_key(&key) {
            return Err(RepoError::AlreadyMarked { url, version });
        }
        versions.insert(
            key.clone(),
            SuspectVersion {
                url: url.clone(),
                version,
                created: SystemTime::now(),
                algorithm: algorithm.map(str::to_string),
                computed_hash: computed_hash.to_vec(),
                stored_hash: stored_hash.to_vec(),
            },
        );
        if let Err(e) = self.store(&versions) {
            versions.remove(&key);
            return Err(e);
        }
        warn!(url = %url, version, "marked suspect");
        Ok(())
    }

    /// Clears a record. Returns whether there was one.
    pub fn unmark(&self, url: &str, version: u32) -> RepoResult<bool> {
        let key = (canonicalize(url)?.as_str().to_string(), version);
        let mut versions = self.versions.lock();
        let Some(removed) = versions.remove(&key) else {
            return Ok(false);
        };
        if let Err(e) = self.store(&versions) {
            versions.insert(key, removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Copy of all records, ordered by url then version.
    pub fn list(&self) -> Vec<SuspectVersion> {
        let mut list: Vec<_> = self.versions.lock().values().cloned().collect();
        list.sort_by(|a, b| (&a.url, a.version).cmp(&(&b.url, b.version)));
        list
    }

    pub fn is_empty(&self) -> bool {
        self.versions.lock().is_empty()
    }

    fn store(&self, versions: &HashMap<Key, SuspectVersion>) -> RepoResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut list: Vec<_> = versions.values().collect();
        list.sort_by(|a, b| (&a.url, a.version).cmp(&(&b.url, b.version)));
        write_json(path, &list).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "could not store suspect versions");
        })
    }
}

/// Records are keyed by canonical url. A url that doesn't canonicalize can't
/// have been marked, so it keys as given.
fn key_url(url: &str) -> String {
    canonicalize(url).map_or_else(|_| url.to_string(), |c| c.as_str().to_string())
}
