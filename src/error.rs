use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Serialize, Deserialize, PartialEq)]
pub enum RepoError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    // std::io::Error is stringified so it works with Serialize/Deserialize
    #[error("repository state fault: {0}")]
    StateFault(String),

    #[error("version {version} of {url} already marked suspect")]
    AlreadyMarked { url: String, version: u32 },

    #[error("not found: {0}")]
    NotFound(String),
}

impl RepoError {
    /// Wraps an I/O failure with the operation that hit it.
    pub fn fault(context: impl std::fmt::Display, e: std::io::Error) -> Self {
        RepoError::StateFault(format!("{context}: {e}"))
    }
}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::StateFault(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::StateFault(format!("unreadable properties: {e}"))
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
