//! AU identity → short directory name allocation.
//!
//! Each AU gets a directory `a`, `b`, … `z`, `aa`, `ab`, … under
//! `<repository root>/cache/`. The AU's identity is written to a read-only
//! `#au_id_file` sentinel inside it; those sentinels are the only record of
//! the mapping and are rescanned whenever a map is opened.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RepoError, RepoResult};
use crate::repository::files::write_json;

/// Directory below the repository root holding the AU directories.
pub const CACHE_ROOT_NAME: &str = "cache";

/// Sentinel recording which AU owns a directory.
pub const AU_ID_FILE: &str = "#au_id_file";

// One before 'a', so the first allocation tries "a".
const INITIAL_DIR: &str = "`";

/// Contents of an `#au_id_file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuIdRecord {
    #[serde(rename = "au.id")]
    pub au_id: String,
    #[serde(rename = "plugin.id", default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

#[derive(Debug)]
struct DirMapState {
    by_au: HashMap<String, String>,
    prev_dir: String,
}

/// The AU directory map of one repository root.
#[derive(Debug)]
pub struct AuDirectoryMap {
    cache_root: PathBuf,
    state: Mutex<DirMapState>,
}

impl AuDirectoryMap {
    /// Opens the map for `repository_root`, rebuilding it from the sentinel
    /// files already on disk.
    pub fn open(repository_root: &Path) -> RepoResult<Self> {
        let cache_root = repository_root.join(CACHE_ROOT_NAME);
        let mut by_au = HashMap::new();

        if !cache_root.exists() {
            debug!(root = %cache_root.display(), "creating cache dir");
            fs::create_dir_all(&cache_root)
                .map_err(|e| RepoError::fault(format!("mkdirs({})", cache_root.display()), e))?;
        } else {
            let mut entries: Vec<_> = fs::read_dir(&cache_root)?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                match read_au_id_file(&entry.path()) {
                    Some(record) => {
                        debug!(au.dir = %name, au.id = %record.au_id, "mapping");
                        by_au.insert(record.au_id, name);
                    }
                    None => debug!(au.dir = %name, "not mapping, no au id file"),
                }
            }
        }

        Ok(Self {
            cache_root,
            state: Mutex::new(DirMapState {
                by_au,
                prev_dir: INITIAL_DIR.to_string(),
            }),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Full path of the AU directory with short name `short_name`.
    pub fn location(&self, short_name: &str) -> PathBuf {
        self.cache_root.join(short_name)
    }

    /// Existing short name for `au_id`, without allocating one.
    pub fn lookup(&self, au_id: &str) -> Option<String> {
        self.state.lock().by_au.get(au_id).cloned()
    }

    /// Short name for `au_id`, allocating the next unused one (and writing
    /// its sentinel) on first request.
    pub fn assign(
        &self,
        au_id: &str,
        plugin_id: Option<&str>,
        max_tries: usize,
    ) -> RepoResult<String> {
        validate_au_id(au_id)?;
        let mut state = self.state.lock();
        if let Some(existing) = state.by_au.get(au_id) {
            return Ok(existing.clone());
        }

        debug!(au.id = %au_id, "creating new au directory");
        let mut candidate = state.prev_dir.clone();
        for _ in 0..max_tries {
            candidate = next_dir_name(&candidate);
            let dir = self.cache_root.join(&candidate);
            if dir.exists() {
                debug!(au.dir = %candidate, "existing directory, checking next");
                continue;
            }
            state.prev_dir = candidate.clone();
            let record = AuIdRecord {
                au_id: au_id.to_string(),
                plugin_id: plugin_id.map(str::to_string),
            };
            write_au_id_file(&dir, &record)?;
            state.by_au.insert(au_id.to_string(), candidate.clone());
            debug!(au.dir = %candidate, au.id = %au_id, "new au directory");
            return Ok(candidate);
        }

        Err(RepoError::StateFault(format!(
            "can't find unused repository dir after {max_tries} tries in {}",
            self.cache_root.display()
        )))
    }

    /// Forgets the mapping for `au_id`. The directory itself is untouched.
    pub fn remove(&self, au_id: &str) -> bool {
        let removed = self.state.lock().by_au.remove(au_id).is_some();
        if !removed {
            warn!(au.id = %au_id, "au id disappeared from map");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_au.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_au_id(au_id: &str) -> RepoResult<()> {
    if au_id.trim().is_empty() || au_id.chars().any(char::is_control) {
        return Err(RepoError::MalformedInput(format!("bad au id: {au_id:?}")));
    }
    Ok(())
}

/// Next string in the sequence "a", "b", … "z", "aa", "ab", …
pub fn next_dir_name(old: &str) -> String {
    let mut chars: Vec<char> = old.chars().collect();
    // increment the last non-'z' char, so "az" -> "ba" and "zz" -> "aaa"
    for i in (0..chars.len()).rev() {
        if chars[i] < 'z' {
            chars[i] = char::from(chars[i] as u8 + 1);
            return chars.into_iter().collect();
        }
        chars[i] = 'a';
    }
    chars.insert(0, 'a');
    chars.into_iter().collect()
}

pub fn read_au_id_file(au_dir: &Path) -> Option<AuIdRecord> {
    let path = au_dir.join(AU_ID_FILE);
    let bytes = fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "error loading au id");
            None
        }
    }
}

fn write_au_id_file(au_dir: &Path, record: &AuIdRecord) -> RepoResult<()> {
    fs::create_dir_all(au_dir)
        .map_err(|e| RepoError::fault(format!("mkdirs({})", au_dir.display()), e))?;
    let path = au_dir.join(AU_ID_FILE);
    write_json(&path, record)?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(&path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_dir_name() {
        assert_eq!(next_dir_name(INITIAL_DIR), "a");
        assert_eq!(next_dir_name("a"), "b");
        assert_eq!(next_dir_name("z"), "aa");
        assert_eq!(next_dir_name("aa"), "ab");
        assert_eq!(next_dir_name("az"), "ba");
        assert_eq!(next_dir_name("zz"), "aaa");
    }

    #[test]
    fn test_assign_and_rescan() -> RepoResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        let map = AuDirectoryMap::open(tmp.path())?;
        assert!(map.is_empty());

        assert_eq!(map.assign("plugin1&auA", Some("plugin1"), 100)?, "a");
        assert_eq!(map.assign("plugin1&auB", Some("plugin1"), 100)?, "b");
        // idempotent
        assert_eq!(map.assign("plugin1&auA", None, 100)?, "a");
        assert_eq!(map.len(), 2);

        let record = read_au_id_file(&map.location("b")).unwrap();
        assert_eq!(record.au_id, "plugin1&auB");
        assert_eq!(record.plugin_id.as_deref(), Some("plugin1"));
        assert!(!map.location("b").join(format!("{AU_ID_FILE}.tmp")).exists());

        drop(map);
        let reopened = AuDirectoryMap::open(tmp.path())?;
        assert_eq!(reopened.lookup("plugin1&auA").as_deref(), Some("a"));
        assert_eq!(reopened.lookup("plugin1&auB").as_deref(), Some("b"));
        assert_eq!(reopened.assign("plugin1&auC", None, 100)?, "c");
        Ok(())
    }

    #[test]
    fn test_skips_foreign_directories() -> RepoResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(CACHE_ROOT_NAME).join("a")).unwrap();
        let map = AuDirectoryMap::open(tmp.path())?;
        assert!(map.is_empty());
        assert_eq!(map.assign("p&x", None, 100)?, "b");
        Ok(())
    }

    #[test]
    fn test_search_limit() -> RepoResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(CACHE_ROOT_NAME).join("a")).unwrap();
        let map = AuDirectoryMap::open(tmp.path())?;
        assert!(matches!(
            map.assign("p&x", None, 1),
            Err(RepoError::StateFault(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_au_id() -> RepoResult<()> {
        let tmp = tempfile::tempdir().unwrap();
        let map = AuDirectoryMap::open(tmp.path())?;
        assert!(matches!(
            map.assign("  ", None, 10),
            Err(RepoError::MalformedInput(_))
        ));
        assert!(matches!(
            map.assign("a\nb", None, 10),
            Err(RepoError::MalformedInput(_))
        ));
        Ok(())
    }
}
