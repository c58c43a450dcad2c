//! strongroom: versioned on-disk repository for a digital preservation node.
//! Each Archival Unit gets its own directory tree mapping URLs to nodes that
//! keep every version of their content.

pub mod au_dirs;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod path_mapper;
pub mod repository;
pub mod size_calc;
pub mod suspect;
pub mod types;

// Re-export
pub use backend::*;
pub use config::{ConfigHandle, RepositoryConfig};
pub use error::{RepoError, RepoResult};
pub use manager::RepositoryManager;
pub use repository::{ContentState, LocalRepository, NodeContents, NodeVersion, RepositoryNode};
pub use suspect::{SuspectVersion, SuspectVersionTracker};
pub use types::*;
