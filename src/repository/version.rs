//! The new-version transaction of a leaf: open, write content, write
//! properties, then seal or abandon.

use std::fs::File;
use std::io::BufWriter;
use std::time::Instant;

use tracing::{debug, error, info, instrument};

use crate::error::{RepoError, RepoResult};
use crate::types::{Properties, VERSION_NUMBER_KEY};

use super::files::{self, WAS_INACTIVE_KEY};
use super::node::{ContentState, NodeState, RepositoryNode};

/// An open, unsealed version.
#[derive(Debug)]
pub(crate) struct Transaction {
    /// Version the current files hold; they are archived under this number.
    pub archive_version: u32,
    /// Number the sealed version gets.
    pub new_version: u32,
    pub deadline: Instant,
    pub content_written: bool,
    pub props_written: bool,
    /// Opened over inactive or deleted content, which rejoins the history
    /// at seal time.
    pub was_inactive: bool,
}

impl RepositoryNode {
    /// Opens a new version. An open version past its timeout is abandoned
    /// and reclaimed; otherwise a second open fails.
    #[instrument(level = "debug", skip(self), fields(node.url = %self.url()))]
    pub fn make_new_version(&self) -> RepoResult<()> {
        self.require_leaf("make_new_version")?;
        let timeout = self.config().version_timeout;
        let mut st = self.lock();
        match st.txn.as_ref().map(|txn| Instant::now() >= txn.deadline) {
            Some(false) => {
                return Err(RepoError::IllegalState(format!(
                    "new version already initialized: {}",
                    self.url()
                )));
            }
            Some(true) => {
                info!("current open version is timed out, abandoning");
                self.abandon_locked(&mut st);
            }
            None => {}
        }

        let content = self.ensure_loaded(&mut st)?;
        // unconditionally, in case the node dir has disappeared
        self.create_node_location()?;

        let (archive_version, was_inactive) = match content {
            ContentState::Current(version) => (version, false),
            // a half-sealed pair left by a crash keeps its own number
            ContentState::NoContent => (self.stale_current_version(), false),
            ContentState::Inactive | ContentState::Deleted => (self.last_active_version()?, true),
        };
        let highest = self
            .files
            .highest_historical_version()?
            .max(st.node_props.max_version);
        let new_version = archive_version.max(highest) + 1;

        st.txn = Some(Transaction {
            archive_version,
            new_version,
            deadline: Instant::now() + timeout,
            content_written: false,
            props_written: false,
            was_inactive,
        });
        debug!(new_version, "opened new version");
        Ok(())
    }

    pub fn is_new_version_open(&self) -> bool {
        self.lock().txn.is_some()
    }

    /// Creates the temp content file. Flush or drop the writer before
    /// sealing.
    pub fn get_new_output_stream(&self) -> RepoResult<BufWriter<File>> {
        self.require_leaf("get_new_output_stream")?;
        let mut st = self.lock();
        let txn = st.txn.as_ref().ok_or_else(|| self.not_open())?;
        if txn.content_written {
            return Err(RepoError::IllegalState(format!(
                "get_new_output_stream called twice: {}",
                self.url()
            )));
        }

        let path = self.files.temp_content();
        match File::create(&path) {
            Ok(file) => {
                if let Some(txn) = st.txn.as_mut() {
                    txn.content_written = true;
                }
                Ok(BufWriter::new(file))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "no new version file");
                self.abandon_locked(&mut st);
                Err(RepoError::fault(
                    format!("couldn't create {}", path.display()),
                    e,
                ))
            }
        }
    }

    /// Writes the pending version's properties, adding `version_number`.
    pub fn set_new_properties(&self, props: &Properties) -> RepoResult<()> {
        self.require_leaf("set_new_properties")?;
        let mut st = self.lock();
        let txn = st.txn.as_ref().ok_or_else(|| self.not_open())?;
        if !txn.content_written {
            return Err(RepoError::IllegalState(format!(
                "get_new_output_stream not called: {}",
                self.url()
            )));
        }
        if txn.props_written {
            return Err(RepoError::IllegalState(format!(
                "set_new_properties called twice: {}",
                self.url()
            )));
        }
        if props.contains_key(VERSION_NUMBER_KEY) {
            return Err(RepoError::MalformedInput(format!(
                "{VERSION_NUMBER_KEY} is reserved"
            )));
        }

        let mut props = props.clone();
        props.insert(VERSION_NUMBER_KEY.to_string(), txn.new_version.to_string());
        let path = self.files.temp_props();
        if let Err(e) = files::write_props(&path, &props) {
            error!(path = %path.display(), error = %e, "couldn't write properties");
            self.abandon_locked(&mut st);
            return Err(e);
        }
        if let Some(txn) = st.txn.as_mut() {
            txn.props_written = true;
        }
        Ok(())
    }

    /// Promotes the pending version to current and returns its number.
    /// A failed rename is not rolled back.
    #[instrument(level = "debug", skip(self), fields(node.url = %self.url()))]
    pub fn seal_new_version(&self) -> RepoResult<u32> {
        self.require_leaf("seal_new_version")?;
        let result = {
            let mut st = self.lock();
            let txn = match st.txn.take() {
                Some(txn) if txn.content_written && txn.props_written => txn,
                other => {
                    let err = match &other {
                        None => self.not_open(),
                        Some(txn) if !txn.content_written => RepoError::IllegalState(format!(
                            "get_new_output_stream not called: {}",
                            self.url()
                        )),
                        Some(_) => RepoError::IllegalState(format!(
                            "set_new_properties not called: {}",
                            self.url()
                        )),
                    };
                    st.txn = other;
                    return Err(err);
                }
            };

            let result = self.seal_files(&mut st, &txn);
            st.content = None;
            st.current_props = None;
            result.map(|()| txn.new_version)
        };
        if let Ok(version) = &result {
            debug!(version, "sealed new version");
        }
        self.invalidate_cached_values();
        result
    }

    fn seal_files(&self, st: &mut NodeState, txn: &Transaction) -> RepoResult<()> {
        let current_content = self.files.current_content();
        let current_props = self.files.current_props();

        if txn.was_inactive {
            let inactive_content = self.files.inactive_content();
            let inactive_props = self.files.inactive_props();
            if inactive_content.exists() {
                files::rename(&inactive_content, &current_content, "inactive content")?;
            }
            if inactive_props.exists() {
                files::rename(&inactive_props, &current_props, "inactive properties")?;
                match files::read_props(&current_props) {
                    Ok(mut props) => {
                        props.insert(WAS_INACTIVE_KEY.to_string(), "true".to_string());
                        if let Err(e) = files::write_props(&current_props, &props) {
                            error!(error = %e, "couldn't set was-inactive property");
                        }
                    }
                    Err(e) => error!(error = %e, "couldn't set was-inactive property"),
                }
            }
            st.node_props.inactive = false;
            st.node_props.deleted = false;
            st.node_props.store(&self.files.node_props())?;
        }

        if current_content.exists() {
            files::rename(
                &current_content,
                &self.files.version_content(txn.archive_version),
                "current content",
            )?;
        }
        if current_props.exists() {
            files::rename(
                &current_props,
                &self.files.version_props(txn.archive_version),
                "current properties",
            )?;
        }
        files::rename(&self.files.temp_content(), &current_content, "temp content")?;
        files::rename(&self.files.temp_props(), &current_props, "temp properties")?;
        st.node_props.max_version = st.node_props.max_version.max(txn.new_version);
        st.node_props.store(&self.files.node_props())
    }

    /// Discards the pending version; the current version is untouched.
    pub fn abandon_new_version(&self) -> RepoResult<()> {
        self.require_leaf("abandon_new_version")?;
        let mut st = self.lock();
        if st.txn.is_none() {
            return Err(self.not_open());
        }
        self.abandon_locked(&mut st);
        Ok(())
    }

    pub(super) fn abandon_locked(&self, st: &mut NodeState) {
        let Some(txn) = st.txn.take() else {
            return;
        };
        for path in [self.files.temp_content(), self.files.temp_props()] {
            if let Err(e) = files::remove_if_exists(&path) {
                // harmless, the next version overwrites it
                debug!(error = %e, "couldn't remove temp file");
            }
        }
        if txn.was_inactive {
            st.content = None;
        }
        debug!(node.url = %self.url(), "abandoned new version");
    }

    fn stale_current_version(&self) -> u32 {
        let path = self.files.current_props();
        if !path.exists() {
            return 0;
        }
        files::read_props(&path)
            .map(|props| files::version_from_props(&props, &path))
            .unwrap_or(0)
    }

    fn not_open(&self) -> RepoError {
        RepoError::IllegalState(format!("new version not initialized: {}", self.url()))
    }
}
