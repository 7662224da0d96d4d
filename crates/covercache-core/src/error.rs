//! Error types for covercache-core
//!
//! Persistence errors are recovered inside the store and only logged;
//! fetch errors are multicast to every waiter of a single-flight resource.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while loading or flushing the persisted cache file
#[derive(Error, Debug)]
pub enum PersistError {
    // ===================
    // IO Errors
    // ===================
    #[error("Failed to read cache file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache file: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ===================
    // Encoding Errors
    // ===================
    #[error("Failed to decode cache file {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Failed to encode cache entries: {message}")]
    Encode { message: String },

    #[error("Cache file {path} has format version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

/// Terminal failure of a single-flight fetch
///
/// Cloned to every waiter, so it carries rendered messages rather than
/// the underlying error values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to read byte stream: {message}")]
    Read { message: String },

    #[error("Producer failed: {message}")]
    Producer { message: String },

    #[error("No async runtime available to start the fetch")]
    RuntimeUnavailable,
}

impl FetchError {
    /// Producer failure from any displayable error
    pub fn producer(message: impl std::fmt::Display) -> Self {
        FetchError::Producer {
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Read {
            message: e.to_string(),
        }
    }
}
