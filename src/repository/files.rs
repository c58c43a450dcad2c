//! File names inside a node directory, and the JSON records kept there.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{RepoError, RepoResult};
use crate::types::{Properties, VERSION_NUMBER_KEY};

/// Base name of a leaf's content files.
pub const CONTENT_NAME: &str = "#content";

/// Marks a node directory as a leaf.
pub const LEAF_SENTINEL: &str = "#isLeaf";

/// Per-node flags and cached sizes.
pub const NODE_PROPS_FILE: &str = "#node_props";

/// Suffix given to unreadable files moved out of the way.
pub const FAULTY_SUFFIX: &str = ".ERROR";

/// Suffix of a file being written before it is renamed into place.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Set on the archived properties of a version that was restored from
/// inactive content.
pub const WAS_INACTIVE_KEY: &str = "node_was_inactive";

/// Paths of one node directory's files.
#[derive(Debug, Clone)]
pub(crate) struct NodeFiles {
    dir: PathBuf,
}

impl NodeFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn content(&self, suffix: impl std::fmt::Display) -> PathBuf {
        self.dir.join(format!("{CONTENT_NAME}.{suffix}"))
    }

    fn props(&self, suffix: impl std::fmt::Display) -> PathBuf {
        self.dir.join(format!("{CONTENT_NAME}.props.{suffix}"))
    }

    pub fn current_content(&self) -> PathBuf {
        self.content("current")
    }

    pub fn current_props(&self) -> PathBuf {
        self.props("current")
    }

    pub fn temp_content(&self) -> PathBuf {
        self.content("temp")
    }

    pub fn temp_props(&self) -> PathBuf {
        self.props("temp")
    }

    pub fn inactive_content(&self) -> PathBuf {
        self.content("inactive")
    }

    pub fn inactive_props(&self) -> PathBuf {
        self.props("inactive")
    }

    pub fn version_content(&self, version: u32) -> PathBuf {
        self.content(version)
    }

    pub fn version_props(&self, version: u32) -> PathBuf {
        self.props(version)
    }

    pub fn node_props(&self) -> PathBuf {
        self.dir.join(NODE_PROPS_FILE)
    }

    pub fn leaf_sentinel(&self) -> PathBuf {
        self.dir.join(LEAF_SENTINEL)
    }

    /// Version numbers of the historical content files present, ascending.
    pub fn historical_versions(&self) -> RepoResult<Vec<u32>> {
        let prefix = format!("{CONTENT_NAME}.");
        let mut versions = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(RepoError::fault(self.dir.display(), e)),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };
            versions.push(n);
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn highest_historical_version(&self) -> RepoResult<u32> {
        Ok(self.historical_versions()?.last().copied().unwrap_or(0))
    }
}

/// Reads a properties file. A file that exists but doesn't parse is a
/// state fault.
pub(crate) fn read_props(path: &Path) -> RepoResult<Properties> {
    let file = File::open(path).map_err(|e| RepoError::fault(path.display(), e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        error!(path = %path.display(), error = %e, "can't read properties file");
        RepoError::StateFault(format!("can't read properties file {}: {e}", path.display()))
    })
}

pub(crate) fn write_props(path: &Path, props: &Properties) -> RepoResult<()> {
    write_json(path, props)
}

/// Serializes `value` to a sibling temp file and renames it over `path`, so
/// a crash leaves either the old file or the new one.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> RepoResult<()> {
    let tmp = temp_sibling(path);
    let file = File::create(&tmp)
        .map_err(|e| RepoError::fault(format!("couldn't create {}", tmp.display()), e))?;
    let mut out = BufWriter::new(file);
    let written = serde_json::to_writer_pretty(&mut out, value)
        .map_err(RepoError::from)
        .and_then(|()| {
            out.flush()?;
            out.get_ref().sync_all()?;
            Ok(())
        });
    drop(out);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        error!(path = %path.display(), error = %e, "couldn't write json file");
        return Err(e);
    }
    rename(&tmp, path, "json file")
}

/// Renames an unreadable file to `<path>.ERROR` so it is kept for
/// inspection and never overwritten. Returns the new name on success.
pub(crate) fn move_aside(path: &Path) -> Option<PathBuf> {
    let mut faulty = path.as_os_str().to_owned();
    faulty.push(FAULTY_SUFFIX);
    let faulty = PathBuf::from(faulty);
    match fs::rename(path, &faulty) {
        Ok(()) => Some(faulty),
        Err(e) => {
            error!(path = %path.display(), error = %e, "error renaming faulty file");
            None
        }
    }
}

pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TEMP_SUFFIX);
    PathBuf::from(tmp)
}

/// The `version_number` recorded in `props`; missing or unparseable reads
/// as 0.
pub(crate) fn version_from_props(props: &Properties, path: &Path) -> u32 {
    match props.get(VERSION_NUMBER_KEY).map(|v| v.trim().parse::<u32>()) {
        Some(Ok(version)) => version,
        Some(Err(_)) => {
            error!(path = %path.display(), "bad content version found");
            0
        }
        None => {
            warn!(path = %path.display(), "no content version found");
            0
        }
    }
}

/// Renames `from` to `to`, replacing `to`. A failure is logged and becomes a
/// state fault; nothing is rolled back.
pub(crate) fn rename(from: &Path, to: &Path, what: &str) -> RepoResult<()> {
    fs::rename(from, to).map_err(|e| {
        error!(
            from = %from.display(),
            to = %to.display(),
            error = %e,
            "couldn't rename {what}"
        );
        RepoError::fault(format!("couldn't rename {what} {}", from.display()), e)
    })
}

/// Removes `path`, ignoring a file that is already gone.
pub(crate) fn remove_if_exists(path: &Path) -> RepoResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepoError::fault(format!("couldn't remove {}", path.display()), e)),
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> RepoResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| {
        error!(dir = %dir.display(), error = %e, "couldn't create directory");
        RepoError::fault(format!("mkdirs({})", dir.display()), e)
    })
}

/// A value cached in node properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue<T> {
    /// Never computed.
    #[default]
    Unset,
    /// Computed once, since made stale.
    Invalid,
    Known(T),
}

impl<T: Copy> CachedValue<T> {
    pub fn known(&self) -> Option<T> {
        match self {
            CachedValue::Known(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, CachedValue::Invalid)
    }

    /// Marks a known value stale. Returns whether anything changed.
    pub fn invalidate(&mut self) -> bool {
        if let CachedValue::Known(_) = self {
            *self = CachedValue::Invalid;
            true
        } else {
            false
        }
    }
}

/// Contents of `#node_props`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct NodeProps {
    pub inactive: bool,
    pub deleted: bool,
    pub tree_size: CachedValue<u64>,
    pub child_count: CachedValue<u32>,
    pub disk_usage: CachedValue<u64>,
    /// Highest version number ever sealed, so a rolled-back number is
    /// never issued again.
    pub max_version: u32,
}

impl NodeProps {
    /// Loads `#node_props`. A missing file reads as defaults; an unreadable
    /// one is moved aside and also reads as defaults.
    pub fn load(path: &Path) -> Self {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Self::default(),
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(props) => props,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "renaming faulty node props");
                move_aside(path);
                Self::default()
            }
        }
    }

    pub fn store(&self, path: &Path) -> RepoResult<()> {
        write_json(path, self)
    }

    /// Marks the cached sizes stale. Returns whether anything changed.
    pub fn invalidate(&mut self) -> bool {
        let mut changed = false;
        if self.tree_size.known().is_some() || self.child_count.known().is_some() {
            self.tree_size = CachedValue::Invalid;
            self.child_count = CachedValue::Invalid;
            changed = true;
        }
        changed |= self.disk_usage.invalidate();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let files = NodeFiles::new("/repo/x.org/http/a");
        assert_eq!(
            files.current_content(),
            PathBuf::from("/repo/x.org/http/a/#content.current")
        );
        assert_eq!(
            files.version_props(3),
            PathBuf::from("/repo/x.org/http/a/#content.props.3")
        );
        assert_eq!(
            files.inactive_content(),
            PathBuf::from("/repo/x.org/http/a/#content.inactive")
        );
    }

    #[test]
    fn test_historical_versions() {
        let tmp = tempfile::tempdir().unwrap();
        let files = NodeFiles::new(tmp.path());
        assert_eq!(files.highest_historical_version().unwrap(), 0);
        for name in ["#content.1", "#content.3", "#content.props.7", "#content.current"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        assert_eq!(files.historical_versions().unwrap(), vec![1, 3]);
        assert_eq!(files.highest_historical_version().unwrap(), 3);
    }

    #[test]
    fn test_write_json_replaces_whole_file() -> RepoResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(NODE_PROPS_FILE);
        fs::write(&path, b"{\"inactive\": true, \"padding\": \"xxxxxxxxxxxxxxxxxxxxxxxx\"}").unwrap();
        let props = NodeProps {
            deleted: true,
            ..NodeProps::default()
        };
        props.store(&path)?;
        assert_eq!(NodeProps::load(&path), props);
        assert!(!temp_sibling(&path).exists());
        Ok(())
    }

    #[test]
    fn test_version_from_props() {
        let path = Path::new("p");
        let mut props = Properties::new();
        assert_eq!(version_from_props(&props, path), 0);
        props.insert(VERSION_NUMBER_KEY.into(), "junk".into());
        assert_eq!(version_from_props(&props, path), 0);
        props.insert(VERSION_NUMBER_KEY.into(), "4".into());
        assert_eq!(version_from_props(&props, path), 4);
    }

    #[test]
    fn test_node_props_invalidate() {
        let mut props = NodeProps::default();
        assert!(!props.invalidate());
        props.tree_size = CachedValue::Known(10);
        assert!(props.invalidate());
        assert!(props.tree_size.is_invalid());
        assert!(props.child_count.is_invalid());
        assert!(!props.invalidate());
    }

    #[test]
    fn test_faulty_node_props_moved_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(NODE_PROPS_FILE);
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(NodeProps::load(&path), NodeProps::default());
        assert!(!path.exists());
        assert!(tmp.path().join("#node_props.ERROR").exists());
    }
}
