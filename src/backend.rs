use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::RepoResult;
use crate::repository::RepositoryNode;

/// Node lookup and lifecycle by URL, implemented by every repository.
pub trait NodeStore: Send + Sync {
    /// The node for `url`; `NotFound` if nothing is stored there.
    fn get_node(&self, url: &str) -> RepoResult<Arc<RepositoryNode>>;

    /// The node for `url`, creating its directory as a leaf if needed.
    fn create_node(&self, url: &str) -> RepoResult<Arc<RepositoryNode>>;

    /// Marks the node deleted. Its content is kept inactive.
    fn delete_node(&self, url: &str) -> RepoResult<()>;

    /// Moves the node's current content aside.
    fn deactivate_node(&self, url: &str) -> RepoResult<()>;
}

/// Identity of an Archival Unit, supplied by whatever manages AUs.
pub trait ArchivalUnit: Send + Sync {
    fn au_id(&self) -> &str;

    fn plugin_id(&self) -> Option<&str> {
        None
    }
}

/// An AU known only by its identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuIdentity {
    pub au_id: String,
    pub plugin_id: Option<String>,
}

impl AuIdentity {
    pub fn new(au_id: impl Into<String>) -> Self {
        Self {
            au_id: au_id.into(),
            plugin_id: None,
        }
    }

    pub fn with_plugin(au_id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            au_id: au_id.into(),
            plugin_id: Some(plugin_id.into()),
        }
    }
}

impl ArchivalUnit for AuIdentity {
    fn au_id(&self) -> &str {
        &self.au_id
    }

    fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }
}

/// Liveness monitor for a long-running thread.
pub trait Watchdog: Send + Sync {
    /// The thread is alive.
    fn poke(&self);

    /// Whether the thread exiting should be reported.
    fn set_trigger_on_exit(&self, armed: bool);

    /// The thread exited while armed.
    fn exited(&self);
}

/// Watchdog that logs instead of restarting anything.
#[derive(Debug)]
pub struct LoggingWatchdog {
    name: String,
    state: Mutex<(Option<Instant>, bool)>,
}

impl LoggingWatchdog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new((None, false)),
        }
    }

    pub fn last_poke(&self) -> Option<Instant> {
        self.state.lock().0
    }
}

impl Watchdog for LoggingWatchdog {
    fn poke(&self) {
        self.state.lock().0 = Some(Instant::now());
    }

    fn set_trigger_on_exit(&self, armed: bool) {
        debug!(thread = %self.name, armed, "watchdog trigger on exit");
        self.state.lock().1 = armed;
    }

    fn exited(&self) {
        if self.state.lock().1 {
            error!(thread = %self.name, "thread exited unexpectedly");
        } else {
            warn!(thread = %self.name, "unarmed watchdog reported exit");
        }
    }
}
